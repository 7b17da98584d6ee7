use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub stress: StressConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_disk_mount")]
    pub disk_mount: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierStrategy {
    Rules,
    Learned,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ClassifierStrategy,
    #[serde(default)]
    pub clamp_negative_for_rules: bool,
    #[serde(default)]
    pub thresholds: RuleThresholds,
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
}

/// Boundaries of the rule-based verdict. Lower bounds are inclusive for
/// `Warning`, upper bounds are exclusive for `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RuleThresholds {
    #[serde(default = "default_cpu_temp_warning")]
    pub cpu_temp_warning_celsius: f64,
    #[serde(default = "default_cpu_temp_critical")]
    pub cpu_temp_critical_celsius: f64,
    #[serde(default = "default_gpu_temp_warning")]
    pub gpu_temp_warning_celsius: f64,
    #[serde(default = "default_gpu_temp_critical")]
    pub gpu_temp_critical_celsius: f64,
    #[serde(default = "default_ram_usage_limit")]
    pub ram_usage_limit_percent: f64,
    #[serde(default = "default_disk_usage_limit")]
    pub disk_usage_limit_percent: f64,
}

/// Longest stress run accepted from the config file or the command line.
pub const MAX_STRESS_SECS: u64 = 24 * 60 * 60;
pub const MAX_RESAMPLE_INTERVAL_MS: u64 = 60 * 60 * 1000;
const MAX_POLL_INTERVAL_MS: u64 = 60 * 1000;
const MAX_GRACE_PERIOD_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StressConfig {
    #[serde(default = "default_duration_secs")]
    pub default_duration_secs: u64,
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_memory_block_mb")]
    pub memory_block_mb: usize,
    #[serde(default)]
    pub gpu_kernel_cmd: Option<String>,
    #[serde(default = "default_gpu_builtin_kernel")]
    pub gpu_builtin_kernel: bool,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_resample_interval_ms")]
    pub resample_interval_ms: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            disk_mount: default_disk_mount(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            clamp_negative_for_rules: false,
            thresholds: RuleThresholds::default(),
            model_path: default_model_path(),
            dataset_path: default_dataset_path(),
        }
    }
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            cpu_temp_warning_celsius: default_cpu_temp_warning(),
            cpu_temp_critical_celsius: default_cpu_temp_critical(),
            gpu_temp_warning_celsius: default_gpu_temp_warning(),
            gpu_temp_critical_celsius: default_gpu_temp_critical(),
            ram_usage_limit_percent: default_ram_usage_limit(),
            disk_usage_limit_percent: default_disk_usage_limit(),
        }
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: default_duration_secs(),
            hard_timeout_secs: default_hard_timeout_secs(),
            grace_period_ms: default_grace_period_ms(),
            memory_block_mb: default_memory_block_mb(),
            gpu_kernel_cmd: None,
            gpu_builtin_kernel: default_gpu_builtin_kernel(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resample_interval_ms: default_resample_interval_ms(),
        }
    }
}

impl SensorsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StressConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl SessionConfig {
    pub fn resample_interval(&self) -> Duration {
        Duration::from_millis(self.resample_interval_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(path_ref)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sensors(&self.sensors)?;
        validate_classifier(&self.classifier)?;
        validate_stress(&self.stress)?;
        if !(100..=MAX_RESAMPLE_INTERVAL_MS).contains(&self.session.resample_interval_ms) {
            return Err(ConfigError::Validation(format!(
                "session.resample_interval_ms должно быть в диапазоне 100..={MAX_RESAMPLE_INTERVAL_MS}"
            )));
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_sensors(cfg: &SensorsConfig) -> Result<(), ConfigError> {
    if !(250..=MAX_POLL_INTERVAL_MS).contains(&cfg.poll_interval_ms) {
        return Err(ConfigError::Validation(format!(
            "sensors.poll_interval_ms должно быть в диапазоне 250..={MAX_POLL_INTERVAL_MS}"
        )));
    }
    if cfg.disk_mount.trim().is_empty() {
        return Err(ConfigError::Validation(
            "sensors.disk_mount не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_classifier(cfg: &ClassifierConfig) -> Result<(), ConfigError> {
    let t = &cfg.thresholds;
    if t.cpu_temp_warning_celsius >= t.cpu_temp_critical_celsius {
        return Err(ConfigError::Validation(
            "classifier.thresholds: cpu_temp_warning_celsius должно быть меньше cpu_temp_critical_celsius"
                .to_string(),
        ));
    }
    if t.gpu_temp_warning_celsius >= t.gpu_temp_critical_celsius {
        return Err(ConfigError::Validation(
            "classifier.thresholds: gpu_temp_warning_celsius должно быть меньше gpu_temp_critical_celsius"
                .to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&t.ram_usage_limit_percent) {
        return Err(ConfigError::Validation(
            "classifier.thresholds.ram_usage_limit_percent должно быть в диапазоне 0..100"
                .to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&t.disk_usage_limit_percent) {
        return Err(ConfigError::Validation(
            "classifier.thresholds.disk_usage_limit_percent должно быть в диапазоне 0..100"
                .to_string(),
        ));
    }
    if cfg.model_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "classifier.model_path не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_stress(cfg: &StressConfig) -> Result<(), ConfigError> {
    if !(1..=MAX_STRESS_SECS).contains(&cfg.default_duration_secs) {
        return Err(ConfigError::Validation(format!(
            "stress.default_duration_secs должно быть в диапазоне 1..={MAX_STRESS_SECS}"
        )));
    }
    if !(1..=MAX_STRESS_SECS).contains(&cfg.hard_timeout_secs) {
        return Err(ConfigError::Validation(format!(
            "stress.hard_timeout_secs должно быть в диапазоне 1..={MAX_STRESS_SECS}"
        )));
    }
    if !(100..=MAX_GRACE_PERIOD_MS).contains(&cfg.grace_period_ms) {
        return Err(ConfigError::Validation(format!(
            "stress.grace_period_ms должно быть в диапазоне 100..={MAX_GRACE_PERIOD_MS}"
        )));
    }
    if cfg.memory_block_mb < 1 {
        return Err(ConfigError::Validation(
            "stress.memory_block_mb должно быть >= 1".to_string(),
        ));
    }
    if !(10..=1000).contains(&cfg.progress_interval_ms) {
        return Err(ConfigError::Validation(
            "stress.progress_interval_ms должно быть в диапазоне 10..1000".to_string(),
        ));
    }
    if let Some(cmd) = &cfg.gpu_kernel_cmd {
        if cmd.trim().is_empty() {
            return Err(ConfigError::Validation(
                "stress.gpu_kernel_cmd не должен быть пустой строкой".to_string(),
            ));
        }
    }
    Ok(())
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_disk_mount() -> String {
    "/".to_string()
}

const fn default_strategy() -> ClassifierStrategy {
    ClassifierStrategy::Rules
}

fn default_model_path() -> PathBuf {
    PathBuf::from("./model.json")
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("./system_data.csv")
}

const fn default_cpu_temp_warning() -> f64 {
    70.0
}

const fn default_cpu_temp_critical() -> f64 {
    90.0
}

const fn default_gpu_temp_warning() -> f64 {
    80.0
}

const fn default_gpu_temp_critical() -> f64 {
    90.0
}

const fn default_ram_usage_limit() -> f64 {
    75.0
}

const fn default_disk_usage_limit() -> f64 {
    80.0
}

const fn default_duration_secs() -> u64 {
    60
}

const fn default_hard_timeout_secs() -> u64 {
    600
}

const fn default_grace_period_ms() -> u64 {
    2000
}

const fn default_memory_block_mb() -> usize {
    1024
}

const fn default_gpu_builtin_kernel() -> bool {
    true
}

const fn default_progress_interval_ms() -> u64 {
    500
}

const fn default_resample_interval_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("пример должен разбираться");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.classifier.strategy, ClassifierStrategy::Rules);
        assert_eq!(cfg.stress.memory_block_mb, 1024);
    }

    #[test]
    fn empty_document_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("пустой документ допустим");
        cfg.validate().expect("значения по умолчанию валидны");
        assert_eq!(cfg.classifier.thresholds, RuleThresholds::default());
        assert_eq!(cfg.sensors.disk_mount, "/");
    }

    #[test]
    fn inverted_temperature_thresholds_are_rejected() {
        let mut cfg = Config::default();
        cfg.classifier.thresholds.cpu_temp_warning_celsius = 95.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn progress_interval_must_keep_one_hertz() {
        let mut cfg = Config::default();
        cfg.stress.progress_interval_ms = 1500;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn unbounded_durations_are_rejected() {
        let mut cfg = Config::default();
        cfg.session.resample_interval_ms = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.stress.default_duration_secs = MAX_STRESS_SECS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.stress.hard_timeout_secs = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.stress.default_duration_secs = MAX_STRESS_SECS;
        cfg.validate().expect("верхняя граница допустима");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_or_default(dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(cfg.stress.hard_timeout_secs, 600);
    }

    #[test]
    fn strategy_is_parsed_in_snake_case() {
        let cfg: Config =
            serde_yaml::from_str("classifier:\n  strategy: learned\n").expect("yaml");
        assert_eq!(cfg.classifier.strategy, ClassifierStrategy::Learned);
    }
}
