use anyhow::{Context, Result};
use apnea_lib::{
    config::PipelineConfig,
    extract::{extract_features_to_csv, DataFormat},
    io::{
        mat::MatDataLoader,
        wfdb::{load_dataset_summary, WfdbLoader},
    },
    train::{train_cnn_lstm, train_rf, ModelType},
};
use log::info;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "apnea",
    version,
    about = "Sleep apnea detection from RR intervals"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and save it to --output-path
    Train {
        /// rf or cnn-lstm
        #[arg(long, default_value = "rf")]
        model_type: ModelType,
        /// Feature CSV for rf, dataset directory for cnn-lstm
        #[arg(long)]
        data_path: PathBuf,
        #[arg(long)]
        output_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Layout of the dataset directory (cnn-lstm only)
        #[arg(long, default_value = "mat")]
        format: DataFormat,
        /// Segment length in RR samples; defaults to the configured window size
        #[arg(long)]
        segment_seconds: Option<usize>,
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Compute windowed HRV features and write them as CSV
    ExtractFeatures {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "wfdb")]
        format: DataFormat,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Record count and header info for a WFDB directory
    Summary {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 5)]
        sample: usize,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Train {
            model_type,
            data_path,
            output_path,
            config,
            format,
            segment_seconds,
            epochs,
        } => cmd_train(
            model_type,
            &data_path,
            &output_path,
            config.as_deref(),
            format,
            segment_seconds,
            epochs,
        )?,
        Commands::ExtractFeatures {
            data_dir,
            output,
            format,
            config,
        } => cmd_extract_features(&data_dir, &output, format, config.as_deref())?,
        Commands::Summary {
            data_dir,
            sample,
            config,
        } => cmd_summary(&data_dir, sample, config.as_deref())?,
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_train(
    model_type: ModelType,
    data_path: &Path,
    output_path: &Path,
    config: Option<&Path>,
    format: DataFormat,
    segment_seconds: Option<usize>,
    epochs: Option<usize>,
) -> Result<()> {
    let cfg = load_config(config)?;
    info!("training {model_type} model");
    let js = match model_type {
        ModelType::Rf => serde_json::to_string(&train_rf(data_path, output_path, &cfg)?)?,
        ModelType::CnnLstm => {
            let segment_len = segment_seconds.unwrap_or(cfg.signal.window_size_sec);
            let epochs = epochs.unwrap_or(cfg.cnn_lstm.epochs);
            let summary = match format {
                DataFormat::Mat => {
                    let loader = MatDataLoader::new(data_path, &cfg);
                    train_cnn_lstm(&loader, output_path, &cfg, segment_len, epochs)?
                }
                DataFormat::Wfdb => {
                    let loader = WfdbLoader::new(data_path, &cfg);
                    train_cnn_lstm(&loader, output_path, &cfg, segment_len, epochs)?
                }
            };
            serde_json::to_string(&summary)?
        }
    };
    println!("{}", js);
    Ok(())
}

fn cmd_extract_features(
    data_dir: &Path,
    output: &Path,
    format: DataFormat,
    config: Option<&Path>,
) -> Result<()> {
    let cfg = load_config(config)?;
    let rows = extract_features_to_csv(data_dir, format, output, &cfg)?;
    let js = serde_json::json!({
        "rows": rows,
        "output": output.display().to_string(),
    });
    println!("{}", js);
    Ok(())
}

fn cmd_summary(data_dir: &Path, sample: usize, config: Option<&Path>) -> Result<()> {
    let cfg = load_config(config)?;
    let loader = WfdbLoader::new(data_dir, &cfg);
    let summary = load_dataset_summary(&loader, sample);
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
