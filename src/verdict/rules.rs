use super::{Classifier, Feature, FeatureVector, Verdict};
use crate::config::RuleThresholds;

/// Fixed-threshold verdict keyed on temperatures plus RAM/disk saturation.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    thresholds: RuleThresholds,
    clamp_negative: bool,
}

impl RuleClassifier {
    pub fn new(thresholds: RuleThresholds, clamp_negative: bool) -> Self {
        Self {
            thresholds,
            clamp_negative,
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new(RuleThresholds::default(), false)
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, features: &FeatureVector) -> Verdict {
        if !features.is_readable(Feature::CpuUsage) || !features.is_readable(Feature::GpuUsage) {
            return Verdict::Unknown;
        }

        let f = if self.clamp_negative {
            features.clamped()
        } else {
            *features
        };
        let t = &self.thresholds;

        if f.cpu_temp < t.cpu_temp_warning_celsius
            && f.gpu_temp < t.gpu_temp_warning_celsius
            && f.ram_usage < t.ram_usage_limit_percent
            && f.disk_usage < t.disk_usage_limit_percent
        {
            return Verdict::Normal;
        }

        let cpu_warm = (t.cpu_temp_warning_celsius..t.cpu_temp_critical_celsius).contains(&f.cpu_temp);
        let gpu_warm = (t.gpu_temp_warning_celsius..t.gpu_temp_critical_celsius).contains(&f.gpu_temp);
        if cpu_warm || gpu_warm {
            return Verdict::Warning;
        }

        Verdict::Critical
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(cpu_temp: f64, gpu_temp: f64, ram: f64, disk: f64) -> Verdict {
        RuleClassifier::default().classify(&FeatureVector::new(30.0, cpu_temp, 20.0, gpu_temp, disk, ram))
    }

    #[test]
    fn cool_machine_is_normal() {
        assert_eq!(classify(65.0, 70.0, 50.0, 60.0), Verdict::Normal);
    }

    #[test]
    fn warm_cpu_and_gpu_is_warning() {
        assert_eq!(classify(75.0, 82.0, 50.0, 60.0), Verdict::Warning);
    }

    #[test]
    fn hot_and_saturated_is_critical() {
        assert_eq!(classify(95.0, 90.0, 90.0, 90.0), Verdict::Critical);
    }

    #[test]
    fn boundaries_follow_half_open_ranges() {
        assert_eq!(classify(70.0, 40.0, 10.0, 10.0), Verdict::Warning);
        assert_eq!(classify(90.0, 40.0, 10.0, 10.0), Verdict::Critical);
        assert_eq!(classify(40.0, 80.0, 10.0, 10.0), Verdict::Warning);
        assert_eq!(classify(40.0, 40.0, 75.0, 10.0), Verdict::Critical);
    }

    #[test]
    fn saturated_ram_with_warm_gpu_is_warning() {
        assert_eq!(classify(40.0, 85.0, 90.0, 10.0), Verdict::Warning);
    }

    #[test]
    fn unreadable_usage_is_unknown() {
        let base = FeatureVector::new(10.0, 40.0, 10.0, 40.0, 10.0, 10.0);
        let rules = RuleClassifier::default();
        assert_eq!(rules.classify(&base.with_unreadable(Feature::CpuUsage)), Verdict::Unknown);
        assert_eq!(rules.classify(&base.with_unreadable(Feature::GpuUsage)), Verdict::Unknown);
        assert_eq!(rules.classify(&base.with_unreadable(Feature::DiskUsage)), Verdict::Normal);
    }

    #[test]
    fn negative_readings_match_zero_with_and_without_clamping() {
        let negative = FeatureVector::new(-3.0, -20.0, 5.0, -1.0, 10.0, -4.0);
        let zeroed = negative.clamped();
        for clamp in [false, true] {
            let rules = RuleClassifier::new(RuleThresholds::default(), clamp);
            assert_eq!(rules.classify(&negative), rules.classify(&zeroed));
        }
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = RuleThresholds {
            cpu_temp_warning_celsius: 50.0,
            ..RuleThresholds::default()
        };
        let rules = RuleClassifier::new(strict, false);
        let f = FeatureVector::new(30.0, 65.0, 20.0, 70.0, 60.0, 50.0);
        assert_eq!(rules.classify(&f), Verdict::Warning);
    }
}
