//! NVML-backed GPU reading.
//!
//! NVML is loaded at runtime, so hosts without NVIDIA drivers simply report
//! no backend and the caller moves on to the next source.

use super::{Metric, Reading, Subsystem};
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::{Device, Nvml};
use std::collections::BTreeMap;
use tracing::debug;

/// One GPU as reported by a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    pub name: String,
    pub metrics: BTreeMap<Metric, f64>,
}

/// Folds every GPU into one reading. Load, temperature and clocks come from
/// the busiest device; memory sizes add up.
pub fn merge_devices(devices: Vec<GpuDevice>) -> Reading {
    if devices.is_empty() {
        return Reading::unavailable(Subsystem::Gpu);
    }

    let mut metrics: BTreeMap<Metric, f64> = BTreeMap::new();
    for device in &devices {
        for (&metric, &value) in &device.metrics {
            let additive = matches!(metric, Metric::MemoryUsedBytes | Metric::MemoryTotalBytes);
            metrics
                .entry(metric)
                .and_modify(|acc| *acc = if additive { *acc + value } else { acc.max(value) })
                .or_insert(value);
        }
    }
    metrics.insert(Metric::DeviceCount, devices.len() as f64);

    let names: Vec<&str> = devices
        .iter()
        .map(|d| d.name.trim())
        .filter(|n| !n.is_empty())
        .collect();
    Reading::ok(Subsystem::Gpu, metrics).with_device(names.join(", "))
}

/// `None` when NVML could not be initialised or enumerates no device.
pub fn read_nvml() -> Option<Reading> {
    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(err) => {
            debug!(error = %err, "NVML недоступен");
            return None;
        }
    };

    let count = match nvml.device_count() {
        Ok(0) => return None,
        Ok(n) => n,
        Err(err) => return Some(Reading::error(Subsystem::Gpu, format!("NVML: {err}"))),
    };
    debug!(devices = count, "NVML инициализирован");

    let mut devices = Vec::new();
    let mut last_error = None;
    for index in 0..count {
        match nvml.device_by_index(index).and_then(|d| device_metrics(&d)) {
            Ok(device) => devices.push(device),
            Err(err) => {
                debug!(index, error = %err, "NVML: устройство пропущено");
                last_error = Some(err);
            }
        }
    }

    match (devices.is_empty(), last_error) {
        (true, Some(err)) => Some(Reading::error(Subsystem::Gpu, format!("NVML: {err}"))),
        _ => Some(merge_devices(devices)),
    }
}

fn device_metrics(device: &Device<'_>) -> Result<GpuDevice, nvml_wrapper::error::NvmlError> {
    let utilization = device.utilization_rates()?;

    let mut metrics = BTreeMap::new();
    metrics.insert(Metric::UsagePercent, utilization.gpu as f64);
    metrics.insert(Metric::MemoryLoadPercent, utilization.memory as f64);
    if let Ok(t) = device.temperature(TemperatureSensor::Gpu) {
        metrics.insert(Metric::TemperatureCelsius, t as f64);
    }
    if let Ok(clock) = device.clock_info(Clock::Graphics) {
        metrics.insert(Metric::ClockMhz, clock as f64);
    }
    if let Ok(mem) = device.memory_info() {
        metrics.insert(Metric::MemoryUsedBytes, mem.used as f64);
        metrics.insert(Metric::MemoryTotalBytes, mem.total as f64);
    }

    Ok(GpuDevice {
        name: device.name().unwrap_or_default(),
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, metrics: &[(Metric, f64)]) -> GpuDevice {
        GpuDevice {
            name: name.to_string(),
            metrics: metrics.iter().copied().collect(),
        }
    }

    #[test]
    fn no_devices_is_unavailable() {
        assert!(!merge_devices(Vec::new()).is_ok());
    }

    #[test]
    fn two_devices_merge_into_one_reading() {
        let reading = merge_devices(vec![
            device(
                "RTX A4000",
                &[
                    (Metric::UsagePercent, 12.0),
                    (Metric::TemperatureCelsius, 48.0),
                    (Metric::MemoryTotalBytes, 16.0),
                    (Metric::MemoryUsedBytes, 2.0),
                ],
            ),
            device(
                "RTX A2000",
                &[
                    (Metric::UsagePercent, 97.0),
                    (Metric::TemperatureCelsius, 81.0),
                    (Metric::MemoryTotalBytes, 6.0),
                    (Metric::MemoryUsedBytes, 5.0),
                ],
            ),
        ]);

        assert!(reading.is_ok());
        assert_eq!(reading.metric(Metric::DeviceCount), Some(2.0));
        assert_eq!(reading.metric(Metric::UsagePercent), Some(97.0));
        assert_eq!(reading.metric(Metric::TemperatureCelsius), Some(81.0));
        assert_eq!(reading.metric(Metric::MemoryTotalBytes), Some(22.0));
        assert_eq!(reading.metric(Metric::MemoryUsedBytes), Some(7.0));
        assert_eq!(reading.device(), Some("RTX A4000, RTX A2000"));
    }
}
