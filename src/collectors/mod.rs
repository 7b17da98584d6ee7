pub mod gpu;
pub mod system;

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub use system::HostSensors;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Cpu,
    Gpu,
    Ram,
    Disk,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Cpu,
        Subsystem::Gpu,
        Subsystem::Ram,
        Subsystem::Disk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Gpu => "gpu",
            Subsystem::Ram => "ram",
            Subsystem::Disk => "disk",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of metric names a [`Reading`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    UsagePercent,
    TemperatureCelsius,
    CriticalTemperatureCelsius,
    FrequencyMhz,
    FrequencyMinMhz,
    FrequencyMaxMhz,
    ClockMhz,
    /// Number of devices merged into one GPU reading.
    DeviceCount,
    CoreCount,
    ThreadCount,
    MemoryUsedBytes,
    MemoryTotalBytes,
    MemoryAvailableBytes,
    MemoryLoadPercent,
    DiskUsedBytes,
    DiskTotalBytes,
    DiskFreeBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ReadingStatus {
    Ok,
    Unavailable,
    Error(String),
}

/// One subsystem's normalized sample. `Unavailable` and `Error` readings never carry metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    subsystem: Subsystem,
    status: ReadingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    metrics: BTreeMap<Metric, f64>,
}

impl Reading {
    pub fn ok(subsystem: Subsystem, metrics: BTreeMap<Metric, f64>) -> Self {
        let metrics = metrics.into_iter().filter(|(_, v)| v.is_finite()).collect();
        Self {
            subsystem,
            status: ReadingStatus::Ok,
            device: None,
            metrics,
        }
    }

    pub fn unavailable(subsystem: Subsystem) -> Self {
        Self {
            subsystem,
            status: ReadingStatus::Unavailable,
            device: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn error(subsystem: Subsystem, reason: impl Into<String>) -> Self {
        Self {
            subsystem,
            status: ReadingStatus::Error(reason.into()),
            device: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        let device = device.into();
        if !device.trim().is_empty() {
            self.device = Some(device);
        }
        self
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn status(&self) -> &ReadingStatus {
        &self.status
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadingStatus::Ok
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).copied()
    }

    pub fn metrics(&self) -> &BTreeMap<Metric, f64> {
        &self.metrics
    }
}

/// Source of per-subsystem readings. Implementations must never panic on
/// missing hardware; absence is reported through [`ReadingStatus`].
pub trait SensorSource: Send + Sync {
    fn read(&self, subsystem: Subsystem) -> Reading;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays fixed readings; subsystems without an entry read as `Unavailable`.
    #[derive(Default)]
    pub struct FixedSensors {
        readings: HashMap<Subsystem, Reading>,
        delays: HashMap<Subsystem, Duration>,
        reads: AtomicUsize,
        delayed: AtomicUsize,
        delayed_in_flight: AtomicUsize,
        peak_delayed_in_flight: AtomicUsize,
    }

    impl FixedSensors {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, subsystem: Subsystem, metrics: &[(Metric, f64)]) -> Self {
            let map = metrics.iter().copied().collect();
            self.readings.insert(subsystem, Reading::ok(subsystem, map));
            self
        }

        pub fn with_reading(mut self, reading: Reading) -> Self {
            self.readings.insert(reading.subsystem(), reading);
            self
        }

        pub fn with_delay(mut self, subsystem: Subsystem, delay: Duration) -> Self {
            self.delays.insert(subsystem, delay);
            self
        }

        pub fn healthy() -> Self {
            Self::new()
                .with(
                    Subsystem::Cpu,
                    &[(Metric::UsagePercent, 12.0), (Metric::TemperatureCelsius, 45.0)],
                )
                .with(
                    Subsystem::Gpu,
                    &[(Metric::UsagePercent, 3.0), (Metric::TemperatureCelsius, 40.0)],
                )
                .with(Subsystem::Ram, &[(Metric::UsagePercent, 35.0)])
                .with(Subsystem::Disk, &[(Metric::UsagePercent, 50.0)])
        }

        pub fn read_count(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        /// Reads that went through a configured delay.
        pub fn delayed_reads(&self) -> usize {
            self.delayed.load(Ordering::SeqCst)
        }

        /// Most delayed reads ever running at the same time.
        pub fn peak_delayed_in_flight(&self) -> usize {
            self.peak_delayed_in_flight.load(Ordering::SeqCst)
        }
    }

    impl SensorSource for FixedSensors {
        fn read(&self, subsystem: Subsystem) -> Reading {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(&subsystem) {
                self.delayed.fetch_add(1, Ordering::SeqCst);
                let now = self.delayed_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak_delayed_in_flight.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(*delay);
                self.delayed_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            self.readings
                .get(&subsystem)
                .cloned()
                .unwrap_or_else(|| Reading::unavailable(subsystem))
        }
    }
}
