pub mod config;
pub mod dataset;
pub mod detectors;
pub mod error;
pub mod extract;
pub mod io;
pub mod metrics;
pub mod models;
pub mod signal;
pub mod train;

pub use config::PipelineConfig;
pub use error::{ApneaError, Result};
pub use signal::*;
