use super::bayes::ModelError;
use super::{Feature, Verdict};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

pub const LABEL_COLUMN: &str = "system_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Label {
    Normal,
    Warning,
    Critical,
}

impl Label {
    pub const ALL: [Label; 3] = [Label::Normal, Label::Warning, Label::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Normal => "Normal",
            Label::Warning => "Warning",
            Label::Critical => "Critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Label::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(raw))
    }
}

impl From<Label> for Verdict {
    fn from(label: Label) -> Self {
        match label {
            Label::Normal => Verdict::Normal,
            Label::Warning => Verdict::Warning,
            Label::Critical => Verdict::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: [f64; 6],
    pub label: Label,
}

#[derive(Debug, Default)]
pub struct LoadedDataset {
    pub samples: Vec<Sample>,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    cpu_usage: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    cpu_temp: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    gpu_usage: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    gpu_temp: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    disk_usage: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ram_usage: Option<f64>,
    #[serde(default)]
    system_state: Option<String>,
}

impl Row {
    fn into_sample(self) -> Option<Sample> {
        let label = Label::parse(self.system_state.as_deref()?)?;
        let features = [
            self.cpu_usage,
            self.cpu_temp,
            self.gpu_usage,
            self.gpu_temp,
            self.disk_usage,
            self.ram_usage,
        ]
        .map(|v| v.filter(|x| x.is_finite()).unwrap_or(0.0));
        Some(Sample { features, label })
    }
}

/// Reads a labelled CSV. Missing or non-numeric feature cells become 0;
/// rows without a recognised label are counted as skipped.
pub fn load_samples(path: &Path) -> Result<LoadedDataset, ModelError> {
    let path_display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| ModelError::Dataset {
            path: path_display.clone(),
            source,
        })?;

    let mut out = LoadedDataset::default();
    for record in reader.deserialize::<Row>() {
        match record {
            Ok(row) => match row.into_sample() {
                Some(sample) => out.samples.push(sample),
                None => out.skipped += 1,
            },
            Err(err) => {
                debug!(error = %err, "строка датасета пропущена");
                out.skipped += 1;
            }
        }
    }
    debug!(
        path = %path_display,
        rows = out.samples.len(),
        skipped = out.skipped,
        "датасет прочитан"
    );
    Ok(out)
}

/// Per-label value ranges of the synthetic training data, in column order.
fn label_ranges(label: Label) -> [Range<f64>; 6] {
    match label {
        Label::Normal => [
            0.0..100.0,
            30.0..69.0,
            0.0..100.0,
            40.0..79.0,
            10.0..79.0,
            20.0..64.0,
        ],
        Label::Warning => [
            0.0..100.0,
            70.0..89.0,
            0.0..100.0,
            80.0..84.0,
            10.0..98.0,
            20.0..98.0,
        ],
        Label::Critical => [
            0.0..100.0,
            91.0..105.0,
            0.0..100.0,
            86.0..105.0,
            10.0..98.0,
            82.0..98.0,
        ],
    }
}

/// Writes a balanced labelled dataset with `per_class` rows for every label.
/// The same seed always produces the same values.
pub fn generate_balanced(path: &Path, per_class: usize, seed: u64) -> Result<usize, ModelError> {
    let path_display = path.display().to_string();
    let csv_err = |source| ModelError::Dataset {
        path: path_display.clone(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;

    let mut header = vec!["timestamp"];
    header.extend(Feature::ALL.iter().map(|f| f.column()));
    header.push(LABEL_COLUMN);
    writer.write_record(&header).map_err(csv_err)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let timestamp = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
    let mut written = 0;
    for label in Label::ALL {
        let ranges = label_ranges(label);
        for _ in 0..per_class {
            let mut record = vec![timestamp.clone()];
            for range in ranges.iter() {
                let v: f64 = rng.gen_range(range.clone());
                record.push(format!("{:.1}", v));
            }
            record.push(label.as_str().to_string());
            writer.write_record(&record).map_err(csv_err)?;
            written += 1;
        }
    }
    writer.flush().map_err(|source| ModelError::Io {
        path: path_display.clone(),
        source,
    })?;
    Ok(written)
}
