//! Gaussian naive Bayes over the six health features.
//!
//! Each label keeps a prior plus a per-feature mean and variance; prediction
//! picks the label with the highest joint log-likelihood. Variances get the
//! usual smoothing term (a fraction of the widest feature variance) so a
//! constant column cannot divide by zero.

use super::dataset::{self, Label, Sample};
use super::{Classifier, Feature, FeatureVector, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

const VAR_SMOOTHING: f64 = 1e-9;
const MIN_VARIANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("обучающая выборка пуста")]
    EmptyTrainingSet,
    #[error("не удалось прочитать или записать {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("некорректный JSON модели в {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("не удалось разобрать CSV {path}: {source}")]
    Dataset { path: String, source: csv::Error },
    #[error("модель несовместима: {0}")]
    Incompatible(String),
    #[error("сбой вывода модели: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClassStats {
    label: Label,
    prior: f64,
    means: [f64; 6],
    variances: [f64; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianNb {
    classes: Vec<ClassStats>,
}

impl GaussianNb {
    pub fn fit(samples: &[Sample]) -> Result<Self, ModelError> {
        if samples.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        Ok(Self::fit_nonempty(samples))
    }

    fn fit_nonempty(samples: &[Sample]) -> Self {
        let all: Vec<[f64; 6]> = samples.iter().map(|s| s.features).collect();
        let widest = moments(&all)
            .1
            .iter()
            .copied()
            .fold(0.0_f64, f64::max);
        let epsilon = (VAR_SMOOTHING * widest).max(MIN_VARIANCE);

        let mut grouped: BTreeMap<Label, Vec<[f64; 6]>> = BTreeMap::new();
        for sample in samples {
            grouped.entry(sample.label).or_default().push(sample.features);
        }

        let total = samples.len() as f64;
        let classes = grouped
            .into_iter()
            .map(|(label, rows)| {
                let (means, mut variances) = moments(&rows);
                for v in &mut variances {
                    *v += epsilon;
                }
                ClassStats {
                    label,
                    prior: rows.len() as f64 / total,
                    means,
                    variances,
                }
            })
            .collect();

        Self { classes }
    }

    pub fn predict(&self, x: &[f64; 6]) -> Result<Label, ModelError> {
        let mut best: Option<(Label, f64)> = None;
        for class in &self.classes {
            let score = class.log_likelihood(x);
            if !score.is_finite() {
                return Err(ModelError::Inference(format!(
                    "неконечное правдоподобие для класса {}",
                    class.label.as_str()
                )));
            }
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((class.label, score)),
            }
        }
        best.map(|(label, _)| label)
            .ok_or_else(|| ModelError::Inference("модель не содержит классов".to_string()))
    }

    pub fn labels(&self) -> Vec<Label> {
        self.classes.iter().map(|c| c.label).collect()
    }
}

impl ClassStats {
    fn log_likelihood(&self, x: &[f64; 6]) -> f64 {
        let mut score = self.prior.ln();
        for i in 0..6 {
            let var = self.variances[i];
            let diff = x[i] - self.means[i];
            score -= 0.5 * (2.0 * std::f64::consts::PI * var).ln();
            score -= 0.5 * diff * diff / var;
        }
        score
    }
}

/// Per-column mean and population variance.
fn moments(rows: &[[f64; 6]]) -> ([f64; 6], [f64; 6]) {
    let n = rows.len().max(1) as f64;
    let mut means = [0.0; 6];
    for row in rows {
        for i in 0..6 {
            means[i] += row[i];
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut variances = [0.0; 6];
    for row in rows {
        for i in 0..6 {
            let d = row[i] - means[i];
            variances[i] += d * d;
        }
    }
    for v in &mut variances {
        *v /= n;
    }
    (means, variances)
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact {
    features: Vec<String>,
    model: GaussianNb,
}

/// How a [`LearnedClassifier`] obtained its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingSource {
    Dataset { rows: usize, skipped: usize },
    Fallback { reason: String },
}

#[derive(Debug, Clone)]
pub struct LearnedClassifier {
    model: GaussianNb,
}

impl LearnedClassifier {
    pub fn train(samples: &[Sample]) -> Result<Self, ModelError> {
        Ok(Self {
            model: GaussianNb::fit(samples)?,
        })
    }

    /// Single all-zero `Normal` sample; keeps inference defined when no data exists.
    pub fn fallback() -> Self {
        Self {
            model: GaussianNb::fit_nonempty(&[Sample {
                features: [0.0; 6],
                label: Label::Normal,
            }]),
        }
    }

    /// Trains on the CSV at `dataset_path`, falling back to [`LearnedClassifier::fallback`]
    /// when the file is missing, unreadable or holds no valid row.
    pub fn train_from_dataset(dataset_path: &Path) -> (Self, TrainingSource) {
        let loaded = match dataset::load_samples(dataset_path) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "обучающие данные недоступны, используется минимальная модель");
                return (
                    Self::fallback(),
                    TrainingSource::Fallback {
                        reason: err.to_string(),
                    },
                );
            }
        };

        match Self::train(&loaded.samples) {
            Ok(classifier) => (
                classifier,
                TrainingSource::Dataset {
                    rows: loaded.samples.len(),
                    skipped: loaded.skipped,
                },
            ),
            Err(err) => {
                warn!(
                    error = %err,
                    skipped = loaded.skipped,
                    "в обучающих данных нет валидных строк, используется минимальная модель"
                );
                (
                    Self::fallback(),
                    TrainingSource::Fallback {
                        reason: err.to_string(),
                    },
                )
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let path_display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path_display.clone(),
            source,
        })?;
        let artifact: ModelArtifact =
            serde_json::from_str(&text).map_err(|source| ModelError::Json {
                path: path_display,
                source,
            })?;

        let expected: Vec<&str> = Feature::ALL.iter().map(|f| f.column()).collect();
        if artifact.features != expected {
            return Err(ModelError::Incompatible(format!(
                "ожидались признаки {:?}, в файле {:?}",
                expected, artifact.features
            )));
        }
        if artifact.model.classes.is_empty() {
            return Err(ModelError::Incompatible("модель не содержит классов".to_string()));
        }
        Ok(Self {
            model: artifact.model,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let path_display = path.display().to_string();
        let artifact = ModelArtifact {
            features: Feature::ALL.iter().map(|f| f.column().to_string()).collect(),
            model: self.model.clone(),
        };
        let text = serde_json::to_string_pretty(&artifact).map_err(|source| ModelError::Json {
            path: path_display.clone(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ModelError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::write(path, text).map_err(|source| ModelError::Io {
            path: path_display,
            source,
        })
    }

    /// Loads the artifact at `model_path`, or trains from `dataset_path` and
    /// writes the artifact back. Never fails; a write error is only logged.
    pub fn load_or_train(model_path: &Path, dataset_path: &Path) -> Self {
        if model_path.exists() {
            match Self::load(model_path) {
                Ok(classifier) => {
                    info!(path = %model_path.display(), "модель загружена");
                    return classifier;
                }
                Err(err) => {
                    warn!(error = %err, "не удалось загрузить модель, выполняется переобучение");
                }
            }
        }

        let (classifier, source) = Self::train_from_dataset(dataset_path);
        info!(source = ?source, "модель обучена");
        if let Err(err) = classifier.save(model_path) {
            warn!(error = %err, "не удалось сохранить модель");
        }
        classifier
    }

    pub fn model(&self) -> &GaussianNb {
        &self.model
    }
}

impl Classifier for LearnedClassifier {
    fn classify(&self, features: &FeatureVector) -> Verdict {
        let x = features.clamped().to_array();
        match self.model.predict(&x) {
            Ok(label) => label.into(),
            Err(err) => {
                debug!(error = %err, "классификация завершилась ошибкой");
                Verdict::Error
            }
        }
    }

    fn name(&self) -> &'static str {
        "learned"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(features: [f64; 6], label: Label) -> Sample {
        Sample { features, label }
    }

    fn toy_set() -> Vec<Sample> {
        vec![
            sample([10.0, 40.0, 10.0, 45.0, 30.0, 30.0], Label::Normal),
            sample([20.0, 50.0, 15.0, 55.0, 40.0, 40.0], Label::Normal),
            sample([15.0, 45.0, 25.0, 50.0, 35.0, 45.0], Label::Normal),
            sample([60.0, 78.0, 70.0, 82.0, 50.0, 60.0], Label::Warning),
            sample([70.0, 85.0, 60.0, 83.0, 60.0, 70.0], Label::Warning),
            sample([65.0, 80.0, 80.0, 84.0, 55.0, 65.0], Label::Warning),
            sample([95.0, 99.0, 95.0, 98.0, 90.0, 95.0], Label::Critical),
            sample([90.0, 95.0, 98.0, 100.0, 85.0, 90.0], Label::Critical),
            sample([99.0, 102.0, 90.0, 95.0, 95.0, 92.0], Label::Critical),
        ]
    }

    #[test]
    fn empty_training_set_is_rejected() {
        assert!(matches!(
            LearnedClassifier::train(&[]),
            Err(ModelError::EmptyTrainingSet)
        ));
    }

    #[test]
    fn separates_clear_clusters() {
        let clf = LearnedClassifier::train(&toy_set()).expect("fit");
        let cool = FeatureVector::new(12.0, 42.0, 12.0, 48.0, 33.0, 35.0);
        let hot = FeatureVector::new(97.0, 100.0, 96.0, 99.0, 92.0, 94.0);
        assert_eq!(clf.classify(&cool), Verdict::Normal);
        assert_eq!(clf.classify(&hot), Verdict::Critical);
    }

    #[test]
    fn training_twice_gives_identical_predictions() {
        let a = LearnedClassifier::train(&toy_set()).expect("fit");
        let b = LearnedClassifier::train(&toy_set()).expect("fit");
        assert_eq!(a.model(), b.model());
        let sample = FeatureVector::new(10.0, 85.0, 60.0, 85.0, 20.0, 45.0);
        assert_eq!(a.classify(&sample), b.classify(&sample));
    }

    #[test]
    fn negative_inputs_classify_like_zero() {
        let clf = LearnedClassifier::train(&toy_set()).expect("fit");
        for feature in Feature::ALL {
            let mut values = [30.0, 60.0, 30.0, 60.0, 40.0, 40.0];
            values[feature as usize] = -25.0;
            let negative = FeatureVector::from_array(values);
            values[feature as usize] = 0.0;
            let zero = FeatureVector::from_array(values);
            assert_eq!(clf.classify(&negative), clf.classify(&zero), "{feature:?}");
        }
    }

    #[test]
    fn fallback_model_predicts_normal() {
        let clf = LearnedClassifier::fallback();
        assert_eq!(clf.classify(&FeatureVector::default()), Verdict::Normal);
        assert_eq!(
            clf.classify(&FeatureVector::new(99.0, 99.0, 99.0, 99.0, 99.0, 99.0)),
            Verdict::Normal
        );
    }

    #[test]
    fn non_finite_input_yields_error_verdict() {
        let clf = LearnedClassifier::train(&toy_set()).expect("fit");
        let f = FeatureVector::new(f64::INFINITY, 40.0, 10.0, 40.0, 10.0, 10.0);
        assert_eq!(clf.classify(&f), Verdict::Error);
    }

    #[test]
    fn artifact_round_trip_preserves_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("model.json");
        let clf = LearnedClassifier::train(&toy_set()).expect("fit");
        clf.save(&path).expect("save");
        let loaded = LearnedClassifier::load(&path).expect("load");
        assert_eq!(loaded.model(), clf.model());
    }

    #[test]
    fn artifact_with_foreign_features_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.json");
        let clf = LearnedClassifier::fallback();
        clf.save(&path).expect("save");
        let text = std::fs::read_to_string(&path)
            .expect("read")
            .replace("\"cpu_temp\"", "\"fan_rpm\"");
        std::fs::write(&path, text).expect("write");
        assert!(matches!(
            LearnedClassifier::load(&path),
            Err(ModelError::Incompatible(_))
        ));
    }

    #[test]
    fn missing_dataset_falls_back_and_writes_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model_path = dir.path().join("model.json");
        let clf = LearnedClassifier::load_or_train(&model_path, &dir.path().join("absent.csv"));
        assert!(model_path.exists());
        assert_eq!(clf.model().labels(), vec![Label::Normal]);
    }

    #[test]
    fn corrupt_artifact_is_replaced_by_retraining() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model_path = dir.path().join("model.json");
        std::fs::write(&model_path, "{ not json").expect("write");
        let _ = LearnedClassifier::load_or_train(&model_path, &dir.path().join("absent.csv"));
        assert!(LearnedClassifier::load(&model_path).is_ok());
    }
}
