pub mod bayes;
pub mod dataset;
pub mod rules;

use crate::collectors::{Metric, Subsystem};
use crate::config::{ClassifierConfig, ClassifierStrategy};
use crate::snapshot::SystemSnapshot;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub use bayes::LearnedClassifier;
pub use rules::RuleClassifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    Normal,
    Warning,
    Critical,
    Unknown,
    Error,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Normal => "Normal",
            Verdict::Warning => "Warning",
            Verdict::Critical => "Critical",
            Verdict::Unknown => "Unknown",
            Verdict::Error => "Error",
        }
    }

    /// Ordering used when picking the worst verdict of a series. Verdicts
    /// without health information rank below `Normal`.
    pub fn severity(self) -> u8 {
        match self {
            Verdict::Error => 0,
            Verdict::Unknown => 1,
            Verdict::Normal => 2,
            Verdict::Warning => 3,
            Verdict::Critical => 4,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    CpuUsage,
    CpuTemp,
    GpuUsage,
    GpuTemp,
    DiskUsage,
    RamUsage,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::CpuUsage,
        Feature::CpuTemp,
        Feature::GpuUsage,
        Feature::GpuTemp,
        Feature::DiskUsage,
        Feature::RamUsage,
    ];

    /// Column name in the training dataset.
    pub fn column(self) -> &'static str {
        match self {
            Feature::CpuUsage => "cpu_usage",
            Feature::CpuTemp => "cpu_temp",
            Feature::GpuUsage => "gpu_usage",
            Feature::GpuTemp => "gpu_temp",
            Feature::DiskUsage => "disk_usage",
            Feature::RamUsage => "ram_usage",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn source(self) -> (Subsystem, Metric) {
        match self {
            Feature::CpuUsage => (Subsystem::Cpu, Metric::UsagePercent),
            Feature::CpuTemp => (Subsystem::Cpu, Metric::TemperatureCelsius),
            Feature::GpuUsage => (Subsystem::Gpu, Metric::UsagePercent),
            Feature::GpuTemp => (Subsystem::Gpu, Metric::TemperatureCelsius),
            Feature::DiskUsage => (Subsystem::Disk, Metric::UsagePercent),
            Feature::RamUsage => (Subsystem::Ram, Metric::UsagePercent),
        }
    }
}

/// The six classifier inputs. Features the snapshot could not supply hold 0
/// and are flagged as unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FeatureVector {
    pub cpu_usage: f64,
    pub cpu_temp: f64,
    pub gpu_usage: f64,
    pub gpu_temp: f64,
    pub disk_usage: f64,
    pub ram_usage: f64,
    #[serde(skip)]
    unreadable: u8,
}

impl FeatureVector {
    pub fn new(
        cpu_usage: f64,
        cpu_temp: f64,
        gpu_usage: f64,
        gpu_temp: f64,
        disk_usage: f64,
        ram_usage: f64,
    ) -> Self {
        Self {
            cpu_usage,
            cpu_temp,
            gpu_usage,
            gpu_temp,
            disk_usage,
            ram_usage,
            unreadable: 0,
        }
    }

    pub fn from_array(values: [f64; 6]) -> Self {
        let [cpu_usage, cpu_temp, gpu_usage, gpu_temp, disk_usage, ram_usage] = values;
        Self::new(cpu_usage, cpu_temp, gpu_usage, gpu_temp, disk_usage, ram_usage)
    }

    pub fn from_snapshot(snapshot: &SystemSnapshot) -> Self {
        let mut values = [0.0; 6];
        let mut unreadable = 0u8;
        for feature in Feature::ALL {
            let (subsystem, metric) = feature.source();
            match snapshot.reading(subsystem).metric(metric) {
                Some(v) => values[feature.index()] = v,
                None => unreadable |= 1 << feature.index(),
            }
        }
        Self {
            unreadable,
            ..Self::from_array(values)
        }
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.to_array()[feature.index()]
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.cpu_usage,
            self.cpu_temp,
            self.gpu_usage,
            self.gpu_temp,
            self.disk_usage,
            self.ram_usage,
        ]
    }

    pub fn is_readable(&self, feature: Feature) -> bool {
        self.unreadable & (1 << feature.index()) == 0
    }

    pub fn with_unreadable(mut self, feature: Feature) -> Self {
        self.unreadable |= 1 << feature.index();
        self.set(feature, 0.0);
        self
    }

    /// Negative and NaN values become 0; readability flags are kept.
    pub fn clamped(&self) -> Self {
        let mut out = *self;
        for feature in Feature::ALL {
            out.set(feature, self.get(feature).max(0.0));
        }
        out
    }

    fn set(&mut self, feature: Feature, value: f64) {
        match feature {
            Feature::CpuUsage => self.cpu_usage = value,
            Feature::CpuTemp => self.cpu_temp = value,
            Feature::GpuUsage => self.gpu_usage = value,
            Feature::GpuTemp => self.gpu_temp = value,
            Feature::DiskUsage => self.disk_usage = value,
            Feature::RamUsage => self.ram_usage = value,
        }
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, features: &FeatureVector) -> Verdict;

    fn name(&self) -> &'static str;

    fn classify_snapshot(&self, snapshot: &SystemSnapshot) -> Verdict {
        self.classify(&FeatureVector::from_snapshot(snapshot))
    }
}

/// Builds the configured strategy. The learned strategy always ends up fit,
/// falling back to a minimal model when neither artifact nor dataset is usable.
pub fn build_classifier(cfg: &ClassifierConfig) -> Arc<dyn Classifier> {
    let classifier: Arc<dyn Classifier> = match cfg.strategy {
        ClassifierStrategy::Rules => Arc::new(RuleClassifier::new(
            cfg.thresholds,
            cfg.clamp_negative_for_rules,
        )),
        ClassifierStrategy::Learned => Arc::new(LearnedClassifier::load_or_train(
            &cfg.model_path,
            &cfg.dataset_path,
        )),
    };
    info!(strategy = classifier.name(), "классификатор готов");
    classifier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Reading;
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    #[test]
    fn features_are_pulled_from_matching_subsystems() {
        let mut cpu = BTreeMap::new();
        cpu.insert(Metric::UsagePercent, 40.0);
        cpu.insert(Metric::TemperatureCelsius, 66.0);
        let mut ram = BTreeMap::new();
        ram.insert(Metric::UsagePercent, 71.0);
        let snapshot = SystemSnapshot::from_readings(
            SystemTime::now(),
            vec![
                Reading::ok(Subsystem::Cpu, cpu),
                Reading::ok(Subsystem::Ram, ram),
            ],
        );

        let f = FeatureVector::from_snapshot(&snapshot);
        assert_eq!(f.cpu_usage, 40.0);
        assert_eq!(f.cpu_temp, 66.0);
        assert_eq!(f.ram_usage, 71.0);
        assert_eq!(f.gpu_usage, 0.0);
        assert!(f.is_readable(Feature::CpuUsage));
        assert!(!f.is_readable(Feature::GpuUsage));
        assert!(!f.is_readable(Feature::DiskUsage));
    }

    #[test]
    fn clamping_floors_negatives_and_nan() {
        let f = FeatureVector::new(-5.0, f64::NAN, 10.0, -0.1, 0.0, 55.0).clamped();
        assert_eq!(f.to_array(), [0.0, 0.0, 10.0, 0.0, 0.0, 55.0]);
    }

    #[test]
    fn clamping_is_idempotent() {
        let f = FeatureVector::new(-5.0, 80.0, -1.0, 50.0, 20.0, -3.0);
        assert_eq!(f.clamped(), f.clamped().clamped());
    }

    #[test]
    fn severity_orders_health_states() {
        assert!(Verdict::Critical.severity() > Verdict::Warning.severity());
        assert!(Verdict::Warning.severity() > Verdict::Normal.severity());
        assert!(Verdict::Normal.severity() > Verdict::Unknown.severity());
    }
}
