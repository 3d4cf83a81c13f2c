pub mod cnn_lstm;
pub mod forest;
pub(crate) mod layers;
pub mod optim;
pub mod report;
pub mod scaler;
pub mod tree;

pub use cnn_lstm::{CnnLstmModel, EpochRecord, History};
pub use forest::{RandomForest, RandomForestModel};
pub use report::{ClassificationReport, ConfusionMatrix};
pub use scaler::StandardScaler;

use crate::error::{ApneaError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{fs, path::Path};

/// Model artifacts are single JSON files; parent directories are created.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ApneaError::io(parent, e))?;
    }
    let text = serde_json::to_string(value)?;
    fs::write(path, text).map_err(|e| ApneaError::io(path, e))
}

pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| ApneaError::io(path, e))?;
    Ok(serde_json::from_str(&text)?)
}
