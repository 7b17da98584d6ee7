use super::gpu::{self, GpuDevice};
use super::{Metric, Reading, SensorSource, Subsystem};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use sysinfo::{ComponentExt, CpuExt, DiskExt, System, SystemExt};
use tracing::debug;

/// Gap between the two CPU refreshes needed for a usage figure.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

/// Reads the host through `sysinfo`, sysfs thermal zones, NVML and `nvidia-smi`.
///
/// Holds no `System` between calls, so concurrent reads share nothing mutable.
#[derive(Debug, Clone)]
pub struct HostSensors {
    disk_mount: String,
}

impl HostSensors {
    pub fn new(disk_mount: impl Into<String>) -> Self {
        Self {
            disk_mount: disk_mount.into(),
        }
    }
}

impl SensorSource for HostSensors {
    fn read(&self, subsystem: Subsystem) -> Reading {
        match subsystem {
            Subsystem::Cpu => read_cpu(),
            Subsystem::Gpu => read_gpu(),
            Subsystem::Ram => read_ram(),
            Subsystem::Disk => read_disk(&self.disk_mount),
        }
    }
}

fn read_cpu() -> Reading {
    let mut system = System::new();
    system.refresh_cpu();
    std::thread::sleep(CPU_SAMPLE_INTERVAL);
    system.refresh_cpu();

    let cpus = system.cpus();
    if cpus.is_empty() {
        return Reading::unavailable(Subsystem::Cpu);
    }

    let usage = cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64;
    let freq = cpus.iter().map(|c| c.frequency() as f64).sum::<f64>() / cpus.len() as f64;
    let threads = cpus.len();
    let brand = cpus
        .first()
        .map(|c| c.brand().trim().to_string())
        .unwrap_or_default();

    let mut metrics = BTreeMap::new();
    metrics.insert(Metric::UsagePercent, usage);
    if freq > 0.0 {
        metrics.insert(Metric::FrequencyMhz, freq);
    }
    let (min_mhz, max_mhz) = cpufreq_limits();
    if let Some(v) = min_mhz {
        metrics.insert(Metric::FrequencyMinMhz, v);
    }
    if let Some(v) = max_mhz {
        metrics.insert(Metric::FrequencyMaxMhz, v);
    }
    metrics.insert(Metric::ThreadCount, threads as f64);
    if let Some(cores) = system.physical_core_count() {
        metrics.insert(Metric::CoreCount, cores as f64);
    }

    system.refresh_components_list();
    let mut temps: Vec<TempSample> = system
        .components()
        .iter()
        .map(|c| TempSample {
            sensor: c.label().to_string(),
            celsius: c.temperature() as f64,
            critical: c.critical().map(|v| v as f64),
        })
        .collect();
    temps.extend(collect_linux_temps());
    debug!(candidates = temps.len(), "кандидаты температуры CPU");

    if let Some(t) = cpu_temperature(&temps) {
        metrics.insert(Metric::TemperatureCelsius, t.celsius);
        if let Some(crit) = t.critical {
            metrics.insert(Metric::CriticalTemperatureCelsius, crit);
        }
    }

    Reading::ok(Subsystem::Cpu, metrics).with_device(brand)
}

fn read_gpu() -> Reading {
    if let Some(reading) = gpu::read_nvml() {
        return reading;
    }
    if let Some(reading) = read_gpu_nvidia_smi() {
        return reading;
    }

    let mut system = System::new();
    system.refresh_components_list();
    let from_components = system
        .components()
        .iter()
        .filter(|c| {
            let label = c.label().to_lowercase();
            GPU_MARKERS.iter().any(|m| label.contains(m))
        })
        .filter(|c| is_plausible_celsius(c.temperature() as f64))
        .max_by(|a, b| a.temperature().total_cmp(&b.temperature()));

    match from_components {
        Some(c) => {
            let mut metrics = BTreeMap::new();
            metrics.insert(Metric::TemperatureCelsius, c.temperature() as f64);
            Reading::ok(Subsystem::Gpu, metrics).with_device(c.label())
        }
        None => Reading::unavailable(Subsystem::Gpu),
    }
}

fn read_gpu_nvidia_smi() -> Option<Reading> {
    let output = run_nvidia_smi(&[
        "--query-gpu=name,utilization.gpu,memory.used,memory.total,temperature.gpu,clocks.gr",
        "--format=csv,noheader,nounits",
    ])?;
    if !output.status.success() {
        return Some(Reading::error(
            Subsystem::Gpu,
            format!("nvidia-smi завершился с кодом {}", output.status),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    match parse_nvidia_smi(&text) {
        Ok(devices) if devices.is_empty() => None,
        Ok(devices) => Some(gpu::merge_devices(devices)),
        Err(reason) => Some(Reading::error(Subsystem::Gpu, reason)),
    }
}

/// One device per non-empty line of the `--query-gpu` CSV.
fn parse_nvidia_smi(text: &str) -> Result<Vec<GpuDevice>, String> {
    let mut devices = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 6 {
            return Err(format!("неожиданный вывод nvidia-smi: {line}"));
        }

        let mut metrics = BTreeMap::new();
        let fields = [
            (Metric::UsagePercent, parts[1], 1.0),
            (Metric::MemoryUsedBytes, parts[2], 1024.0 * 1024.0),
            (Metric::MemoryTotalBytes, parts[3], 1024.0 * 1024.0),
            (Metric::TemperatureCelsius, parts[4], 1.0),
            (Metric::ClockMhz, parts[5], 1.0),
        ];
        for (metric, raw, scale) in fields {
            if let Some(v) = parse_f64_loose(raw) {
                metrics.insert(metric, v * scale);
            }
        }
        devices.push(GpuDevice {
            name: parts[0].to_string(),
            metrics,
        });
    }
    Ok(devices)
}

fn read_ram() -> Reading {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return Reading::unavailable(Subsystem::Ram);
    }
    let used = system.used_memory();

    let mut metrics = BTreeMap::new();
    metrics.insert(Metric::MemoryTotalBytes, total as f64);
    metrics.insert(Metric::MemoryUsedBytes, used as f64);
    metrics.insert(Metric::MemoryAvailableBytes, system.available_memory() as f64);
    metrics.insert(Metric::UsagePercent, percent(used, total));
    Reading::ok(Subsystem::Ram, metrics)
}

fn read_disk(mount: &str) -> Reading {
    let mut system = System::new();
    system.refresh_disks_list();
    let wanted = Path::new(mount);
    let Some(disk) = system.disks().iter().find(|d| d.mount_point() == wanted) else {
        debug!(mount, "диск с точкой монтирования не найден");
        return Reading::unavailable(Subsystem::Disk);
    };

    let total = disk.total_space();
    if total == 0 {
        return Reading::error(Subsystem::Disk, format!("{mount}: нулевой размер раздела"));
    }
    let free = disk.available_space();
    let used = total.saturating_sub(free);

    let mut metrics = BTreeMap::new();
    metrics.insert(Metric::DiskTotalBytes, total as f64);
    metrics.insert(Metric::DiskUsedBytes, used as f64);
    metrics.insert(Metric::DiskFreeBytes, free as f64);
    metrics.insert(Metric::UsagePercent, percent(used, total));
    Reading::ok(Subsystem::Disk, metrics).with_device(disk.name().to_string_lossy())
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64) * 100.0
}

#[derive(Debug, Clone)]
struct TempSample {
    sensor: String,
    celsius: f64,
    critical: Option<f64>,
}

fn is_plausible_celsius(v: f64) -> bool {
    v > 0.0 && v <= 130.0
}

/// Picks the hottest sensor that names the CPU package, then any non-GPU
/// sensor, then ACPI thermal zones.
fn cpu_temperature(temps: &[TempSample]) -> Option<TempSample> {
    let primary_markers = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp"];
    let acpi_markers = ["acpi", "thermal zone", "_tz"];
    let plausible = || temps.iter().filter(|t| is_plausible_celsius(t.celsius));
    let hottest = |a: &&TempSample, b: &&TempSample| a.celsius.total_cmp(&b.celsius);

    let primary = plausible()
        .filter(|t| {
            let s = t.sensor.to_lowercase();
            primary_markers.iter().any(|m| s.contains(m))
                && !GPU_MARKERS.iter().any(|m| s.contains(m))
                && !acpi_markers.iter().any(|m| s.contains(m))
        })
        .max_by(hottest);
    if let Some(t) = primary {
        return Some(t.clone());
    }

    let non_gpu = plausible()
        .filter(|t| {
            let s = t.sensor.to_lowercase();
            !GPU_MARKERS.iter().any(|m| s.contains(m))
                && !acpi_markers.iter().any(|m| s.contains(m))
        })
        .max_by(hottest);
    if let Some(t) = non_gpu {
        return Some(t.clone());
    }

    plausible()
        .filter(|t| {
            let s = t.sensor.to_lowercase();
            acpi_markers.iter().any(|m| s.contains(m))
        })
        .max_by(hottest)
        .cloned()
}

#[cfg(target_os = "linux")]
fn collect_linux_temps() -> Vec<TempSample> {
    let Ok(entries) = fs::read_dir("/sys/class/thermal") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }

        let Ok(temp_raw) = fs::read_to_string(path.join("temp")) else {
            continue;
        };
        let typ = fs::read_to_string(path.join("type"))
            .ok()
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| name.to_string());
        let Ok(v) = temp_raw.trim().parse::<f64>() else {
            continue;
        };
        let celsius = if v > 1000.0 { v / 1000.0 } else { v };
        // x86_pkg_temp and friends are real package sensors; the rest are ACPI zones.
        let sensor = if typ.contains("pkg") || typ.contains("cpu") {
            typ
        } else {
            format!("acpi {typ}")
        };
        out.push(TempSample {
            sensor,
            celsius,
            critical: None,
        });
    }

    out
}

#[cfg(not(target_os = "linux"))]
fn collect_linux_temps() -> Vec<TempSample> {
    Vec::new()
}

/// Lowest and highest scaling limits over all cores, in MHz.
#[cfg(target_os = "linux")]
fn cpufreq_limits() -> (Option<f64>, Option<f64>) {
    let Ok(entries) = fs::read_dir("/sys/devices/system/cpu") else {
        return (None, None);
    };

    let read_khz = |path: &Path| {
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
    };
    let mut mins = Vec::new();
    let mut maxes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let is_core = name
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !is_core {
            continue;
        }
        let dir = entry.path().join("cpufreq");
        mins.extend(read_khz(&dir.join("cpuinfo_min_freq")));
        maxes.extend(read_khz(&dir.join("cpuinfo_max_freq")));
    }
    khz_limits(&mins, &maxes)
}

#[cfg(not(target_os = "linux"))]
fn cpufreq_limits() -> (Option<f64>, Option<f64>) {
    (None, None)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn khz_limits(mins: &[f64], maxes: &[f64]) -> (Option<f64>, Option<f64>) {
    let to_mhz = |khz: f64| (khz > 0.0).then_some(khz / 1000.0);
    let min = mins.iter().copied().filter_map(to_mhz).min_by(f64::total_cmp);
    let max = maxes.iter().copied().filter_map(to_mhz).max_by(f64::total_cmp);
    (min, max)
}

fn run_nvidia_smi(args: &[&str]) -> Option<std::process::Output> {
    if let Ok(output) = Command::new("nvidia-smi").args(args).output() {
        return Some(output);
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
        {
            return Some(output);
        }
    }

    None
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+' | 'e' | 'E'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
