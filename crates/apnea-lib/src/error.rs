use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApneaError>;

/// Errors surfaced by the pipeline.
///
/// Loader failures for individual records never appear here: they are logged
/// and turned into "no data for this record" at the loader boundary.
#[derive(Debug, Error)]
pub enum ApneaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown {kind} '{name}' (expected one of: {expected})")]
    UnknownMethod {
        kind: &'static str,
        name: String,
        expected: String,
    },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error("model has not been trained")]
    NotTrained,

    #[error("malformed MAT file: {0}")]
    MatFormat(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ApneaError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
