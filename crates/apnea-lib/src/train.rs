//! Training entry points for both model families.

use crate::{
    config::PipelineConfig,
    dataset::{get_segmented_dataset, split_records, stratified_kfold, RecordLabeler, SequenceSource},
    error::{ApneaError, Result},
    io::features::read_feature_csv,
    models::{ClassificationReport, CnnLstmModel, ConfusionMatrix, History, RandomForestModel},
};
use log::info;
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Rf,
    CnnLstm,
}

impl ModelType {
    const TABLE: [(&'static str, ModelType); 3] = [
        ("rf", ModelType::Rf),
        ("cnn-lstm", ModelType::CnnLstm),
        ("cnn_lstm", ModelType::CnnLstm),
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelType::Rf => "rf",
            ModelType::CnnLstm => "cnn-lstm",
        }
    }
}

impl FromStr for ModelType {
    type Err = ApneaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::TABLE
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, m)| *m)
            .ok_or_else(|| ApneaError::UnknownMethod {
                kind: "model type",
                name: s.to_string(),
                expected: Self::TABLE.map(|(n, _)| n).join(", "),
            })
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldReport {
    pub fold: usize,
    pub report: ClassificationReport,
    pub confusion: ConfusionMatrix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfTrainingSummary {
    pub model_type: ModelType,
    pub n_rows: usize,
    pub feature_names: Vec<String>,
    pub folds: Vec<FoldReport>,
    pub mean_accuracy: f64,
    pub model_path: String,
}

/// Cross-validate a random forest over a feature CSV, then fit on every row
/// and save the model with its scaler.
pub fn train_rf(data_path: &Path, output_path: &Path, cfg: &PipelineConfig) -> Result<RfTrainingSummary> {
    info!("loading features from {}", data_path.display());
    let table = read_feature_csv(data_path)?;
    let mut model = RandomForestModel::new(cfg.forest.clone());
    let prepared = model.preprocess(&table)?;
    let k = cfg.dataset.folds;
    let splits = stratified_kfold(&prepared.y, k, cfg.dataset.seed)?;

    let mut folds = Vec::with_capacity(k);
    for (fold, (train_idx, val_idx)) in splits.iter().enumerate() {
        info!("training fold {}/{k}", fold + 1);
        let x_train = prepared.x.select(Axis(0), train_idx);
        let y_train: Vec<u8> = train_idx.iter().map(|&i| prepared.y[i]).collect();
        let x_val = prepared.x.select(Axis(0), val_idx);
        let y_val: Vec<u8> = val_idx.iter().map(|&i| prepared.y[i]).collect();
        model.train(x_train.view(), &y_train)?;
        let (report, confusion) = model.evaluate(x_val.view(), &y_val)?;
        info!("fold {} evaluation:\n{report}", fold + 1);
        folds.push(FoldReport {
            fold: fold + 1,
            report,
            confusion,
        });
    }

    info!("training final model on full dataset");
    model.train(prepared.x.view(), &prepared.y)?;
    model.save(output_path)?;
    let mean_accuracy = folds.iter().map(|f| f.report.accuracy).sum::<f64>() / folds.len().max(1) as f64;
    Ok(RfTrainingSummary {
        model_type: ModelType::Rf,
        n_rows: prepared.y.len(),
        feature_names: prepared.feature_names,
        folds,
        mean_accuracy,
        model_path: output_path.display().to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CnnLstmTrainingSummary {
    pub model_type: ModelType,
    pub segment_len: usize,
    pub train_records: Vec<String>,
    pub validation_records: Vec<String>,
    pub test_records: Vec<String>,
    pub train_segments: usize,
    pub validation_segments: usize,
    pub test_segments: usize,
    pub history: History,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub model_path: String,
}

fn as_sequences(x: ndarray::Array2<f64>) -> Array3<f64> {
    x.insert_axis(Axis(2))
}

/// Split records, assemble fixed-length segments per split, train the
/// sequence model, and report accuracy on the held-out records.
pub fn train_cnn_lstm<S: SequenceSource + ?Sized>(
    source: &S,
    output_path: &Path,
    cfg: &PipelineConfig,
    segment_len: usize,
    epochs: usize,
) -> Result<CnnLstmTrainingSummary> {
    let labeler = RecordLabeler::from_config(&cfg.dataset);
    let records = source.list_records();
    if records.is_empty() {
        return Err(ApneaError::EmptyDataset("no records found".into()));
    }
    let split = split_records(
        &records,
        &labeler,
        cfg.dataset.test_split,
        cfg.dataset.validation_split,
        cfg.dataset.seed,
    )?;
    info!(
        "split {} records: {} train, {} validation, {} test",
        records.len(),
        split.train.len(),
        split.validation.len(),
        split.test.len()
    );

    info!("loading training segments");
    let (x_train, y_train) = get_segmented_dataset(source, &split.train, segment_len, &labeler)?;
    info!("loading validation segments");
    let (x_val, y_val) = get_segmented_dataset(source, &split.validation, segment_len, &labeler)?;
    info!("loading test segments");
    let (x_test, y_test) = get_segmented_dataset(source, &split.test, segment_len, &labeler)?;
    if y_train.is_empty() {
        return Err(ApneaError::EmptyDataset("no training segments".into()));
    }
    if y_test.is_empty() {
        return Err(ApneaError::EmptyDataset("no test segments".into()));
    }
    let (x_train, x_val, x_test) = (as_sequences(x_train), as_sequences(x_val), as_sequences(x_test));

    let mut model = CnnLstmModel::new(cfg.cnn_lstm.clone(), segment_len)?;
    let history = model.train(
        &x_train,
        &y_train,
        &x_val,
        &y_val,
        epochs,
        cfg.cnn_lstm.batch_size,
    )?;
    model.save(output_path)?;
    let (test_loss, test_accuracy) = model.evaluate(&x_test, &y_test)?;
    info!("CNN-LSTM test accuracy: {test_accuracy:.4}");

    Ok(CnnLstmTrainingSummary {
        model_type: ModelType::CnnLstm,
        segment_len,
        train_segments: y_train.len(),
        validation_segments: y_val.len(),
        test_segments: y_test.len(),
        train_records: split.train,
        validation_records: split.validation,
        test_records: split.test,
        history,
        test_loss,
        test_accuracy,
        model_path: output_path.display().to_string(),
    })
}
