//! Windowed HRV feature extraction into the feature CSV layout.

use crate::{
    config::PipelineConfig,
    dataset::RecordLabeler,
    error::{ApneaError, Result},
    io::{
        features::write_feature_csv,
        mat::{MatDataLoader, MatSignal},
        wfdb::{Annotations, WfdbLoader},
    },
    metrics::hrv::{hrv_features, FeatureRow},
    signal::RRSeries,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

/// Windows with fewer intervals than this carry no usable HRV.
pub const MIN_RR_PER_WINDOW: usize = 3;

/// On-disk layout of a dataset directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Wfdb,
    Mat,
}

impl DataFormat {
    const TABLE: [(&'static str, DataFormat); 2] =
        [("wfdb", DataFormat::Wfdb), ("mat", DataFormat::Mat)];

    pub fn name(self) -> &'static str {
        match self {
            DataFormat::Wfdb => "wfdb",
            DataFormat::Mat => "mat",
        }
    }
}

impl FromStr for DataFormat {
    type Err = ApneaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, f)| *f)
            .ok_or_else(|| ApneaError::UnknownMethod {
                kind: "data format",
                name: s.to_string(),
                expected: Self::TABLE.map(|(n, _)| n).join(", "),
            })
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `[start, end)` second ranges covering `duration` at the configured window
/// and overlap. Partial trailing windows are dropped.
pub fn window_bounds(duration: f64, window_s: f64, overlap: f64) -> Vec<(f64, f64)> {
    let step = window_s * (1.0 - overlap);
    if window_s <= 0.0 || step <= 0.0 {
        return Vec::new();
    }
    let mut bounds = Vec::new();
    let mut start = 0.0;
    while start + window_s <= duration + 1e-9 {
        bounds.push((start, start + window_s));
        start += step;
    }
    bounds
}

/// Second ranges flagged as apnea: each annotation with `symbol` marks the
/// minute that begins at its sample.
pub fn apnea_intervals(ann: &Annotations, fs: f64, symbol: &str) -> Vec<(f64, f64)> {
    ann.iter()
        .filter(|(_, sym)| *sym == symbol)
        .map(|(sample, _)| {
            let t = sample as f64 / fs;
            (t, t + 60.0)
        })
        .collect()
}

fn overlaps(window: (f64, f64), intervals: &[(f64, f64)]) -> bool {
    intervals
        .iter()
        .any(|&(start, end)| start < window.1 && end > window.0)
}

/// Cut an RR series into windows and compute one feature row per window
/// that holds enough intervals.
fn rows_for_record(
    name: &str,
    rr: &RRSeries,
    duration: f64,
    cfg: &PipelineConfig,
    mut label: impl FnMut((f64, f64)) -> u8,
) -> Vec<FeatureRow> {
    let bounds = window_bounds(
        duration,
        cfg.signal.window_size_sec as f64,
        cfg.signal.overlap,
    );
    let mut rows = Vec::new();
    for (idx, &(start, end)) in bounds.iter().enumerate() {
        let window = rr.window(start, end);
        if window.len() < MIN_RR_PER_WINDOW {
            continue;
        }
        rows.push(FeatureRow {
            filename: format!("{name}_{idx}"),
            features: hrv_features(&window, cfg.signal.psd_interp_fs),
            label: label((start, end)),
        });
    }
    rows
}

/// Feature rows for every WFDB record in the loader's directory. Windows are
/// labelled from the apnea annotation file; records without one fall back to
/// the filename convention.
pub fn extract_wfdb_features(loader: &WfdbLoader, cfg: &PipelineConfig) -> Vec<FeatureRow> {
    let labeler = RecordLabeler::from_config(&cfg.dataset);
    let mut rows = Vec::new();
    for name in loader.list_records() {
        let Some(info) = loader.get_record_info(&name) else {
            continue;
        };
        let Some(rr) = loader.load_rr(&name) else {
            warn!("skipping {name}: no RR intervals");
            continue;
        };
        let duration = if info.fs > 0.0 && info.sig_len > 0 {
            info.sig_len as f64 / info.fs
        } else {
            rr.times.last().copied().unwrap_or(0.0)
        };
        let record_label = labeler.label(&name);
        let apnea = loader
            .load_annotations(&name, &cfg.dataset.apnea_annotator)
            .map(|ann| apnea_intervals(&ann, info.fs, &cfg.dataset.apnea_symbol));
        let record_rows = match &apnea {
            Some(intervals) => {
                rows_for_record(&name, &rr, duration, cfg, |w| u8::from(overlaps(w, intervals)))
            }
            None => rows_for_record(&name, &rr, duration, cfg, |_| record_label),
        };
        info!("{name}: {} feature windows", record_rows.len());
        rows.extend(record_rows);
    }
    rows
}

/// Feature rows for every MAT record; intervals are multiplied by
/// `rr_scale` and windows inherit the record's filename label.
pub fn extract_mat_features(loader: &MatDataLoader, cfg: &PipelineConfig) -> Vec<FeatureRow> {
    let labeler = RecordLabeler::from_config(&cfg.dataset);
    let mut rows = Vec::new();
    for name in loader.list_records() {
        let Some(raw) = loader.load(MatSignal::Rr, &name) else {
            continue;
        };
        let intervals: Vec<f64> = raw
            .iter()
            .map(|v| v * cfg.signal.rr_scale)
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        let rr = RRSeries::from_intervals(intervals);
        let duration = rr.times.last().copied().unwrap_or(0.0);
        let label = labeler.label(&name);
        let record_rows = rows_for_record(&name, &rr, duration, cfg, |_| label);
        info!("{name}: {} feature windows", record_rows.len());
        rows.extend(record_rows);
    }
    rows
}

/// Extract features from `data_dir` and write them to `output`. Returns the
/// number of rows written.
pub fn extract_features_to_csv(
    data_dir: &Path,
    format: DataFormat,
    output: &Path,
    cfg: &PipelineConfig,
) -> Result<usize> {
    let rows = match format {
        DataFormat::Wfdb => extract_wfdb_features(&WfdbLoader::new(data_dir, cfg), cfg),
        DataFormat::Mat => extract_mat_features(&MatDataLoader::new(data_dir, cfg), cfg),
    };
    if rows.is_empty() {
        return Err(ApneaError::EmptyDataset(format!(
            "no feature windows extracted from {}",
            data_dir.display()
        )));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ApneaError::io(parent, e))?;
    }
    write_feature_csv(output, &rows)?;
    info!("wrote {} feature rows to {}", rows.len(), output.display());
    Ok(rows.len())
}
