use crate::error::{ApneaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CLASS_NAMES: [&str; 2] = ["Normal", "Apnea"];
pub const N_CLASSES: usize = CLASS_NAMES.len();

/// Everything the pipeline needs, passed explicitly into loaders, models and
/// the orchestrator. Missing TOML keys fall back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub signal: SignalConfig,
    pub dataset: DatasetConfig,
    pub mat: MatLayoutConfig,
    pub forest: ForestConfig,
    pub cnn_lstm: CnnLstmConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ApneaError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signal.sampling_rate <= 0.0 {
            return Err(ApneaError::InvalidArgument(
                "sampling_rate must be positive".into(),
            ));
        }
        if self.signal.window_size_sec == 0 {
            return Err(ApneaError::InvalidArgument(
                "window_size_sec must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.signal.overlap) {
            return Err(ApneaError::InvalidArgument(format!(
                "overlap fraction {} must be in [0, 1)",
                self.signal.overlap
            )));
        }
        for (name, frac) in [
            ("test_split", self.dataset.test_split),
            ("validation_split", self.dataset.validation_split),
        ] {
            if !(0.0..1.0).contains(&frac) {
                return Err(ApneaError::InvalidArgument(format!(
                    "{name} {frac} must be in [0, 1)"
                )));
            }
        }
        if self.dataset.folds < 2 {
            return Err(ApneaError::InvalidArgument(format!(
                "cross-validation needs at least 2 folds, got {}",
                self.dataset.folds
            )));
        }
        if self.forest.n_estimators == 0 {
            return Err(ApneaError::InvalidArgument(
                "n_estimators must be positive".into(),
            ));
        }
        if self.cnn_lstm.batch_size == 0 {
            return Err(ApneaError::InvalidArgument(
                "batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Hz
    pub sampling_rate: f64,
    pub window_size_sec: usize,
    /// Fraction of a window shared with the next one.
    pub overlap: f64,
    pub bandpass_low_hz: f64,
    pub bandpass_high_hz: f64,
    /// Power line interference.
    pub notch_hz: f64,
    /// Minimum physiological RR distance used by the R-peak detector (seconds).
    pub min_rr_s: f64,
    /// Multiplier that converts stored RR values to seconds.
    pub rr_scale: f64,
    /// Resampling rate for the PSD features.
    pub psd_interp_fs: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 100.0,
            window_size_sec: 60,
            overlap: 0.5,
            bandpass_low_hz: 0.5,
            bandpass_high_hz: 40.0,
            notch_hz: 60.0,
            min_rr_s: 0.25,
            rr_scale: 1.0,
            psd_interp_fs: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub test_split: f64,
    pub validation_split: f64,
    pub seed: u64,
    pub folds: usize,
    /// Records whose name starts with this prefix are controls (Normal).
    pub control_prefix: String,
    /// Annotation symbol that marks an apnea minute in `.apn` files.
    pub apnea_symbol: String,
    /// Annotation extension holding apnea labels.
    pub apnea_annotator: String,
    /// Beat annotation extensions tried, in order, before falling back to
    /// R-peak detection.
    pub beat_annotators: Vec<String>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            test_split: 0.2,
            validation_split: 0.2,
            seed: 42,
            folds: 5,
            control_prefix: "C".into(),
            apnea_symbol: "A".into(),
            apnea_annotator: "apn".into(),
            beat_annotators: vec!["qrs".into(), "atr".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatLayoutConfig {
    pub rr_dir: String,
    pub sat_dir: String,
    pub labels_dir: String,
}

impl Default for MatLayoutConfig {
    fn default() -> Self {
        Self {
            rr_dir: "RR".into(),
            sat_dir: "SAT".into(),
            labels_dir: "LABELS".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub class_weight_balanced: bool,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            class_weight_balanced: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnLstmConfig {
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub dropout: f64,
    pub lstm_units: usize,
    pub dense_units: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub patience: usize,
    pub seed: u64,
}

impl Default for CnnLstmConfig {
    fn default() -> Self {
        Self {
            conv1_filters: 64,
            conv2_filters: 128,
            kernel_size: 3,
            pool_size: 2,
            dropout: 0.2,
            lstm_units: 100,
            dense_units: 50,
            learning_rate: 0.001,
            batch_size: 32,
            epochs: 100,
            patience: 5,
            seed: 42,
        }
    }
}
