use crate::{
    error::{ApneaError, Result},
    metrics::hrv::{FeatureRow, HrvFeatures},
};
use csv::{ReaderBuilder, WriterBuilder};
use std::path::Path;

pub const LABEL_COLUMN: &str = "label";
/// Columns that identify a row rather than describe it.
pub const ID_COLUMNS: [&str; 1] = ["filename"];

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Feature CSV held column-wise, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub columns: Vec<(String, Column)>,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, c)| c.len())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Read a feature CSV. A column is numeric when every non-empty cell parses;
/// empty cells in a numeric column read as NaN.
pub fn read_feature_csv(path: &Path) -> Result<FeatureTable> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (idx, column) in cells.iter_mut().enumerate() {
            column.push(record.get(idx).unwrap_or("").to_string());
        }
    }
    if cells.first().map_or(true, Vec::is_empty) {
        return Err(ApneaError::EmptyDataset(format!(
            "{} has no rows",
            path.display()
        )));
    }
    let columns = headers
        .into_iter()
        .zip(cells)
        .map(|(name, raw)| {
            let all_empty = raw.iter().all(String::is_empty);
            let parsed: Option<Vec<f64>> = raw
                .iter()
                .map(|v| if v.is_empty() { Some(f64::NAN) } else { v.parse::<f64>().ok() })
                .collect();
            let column = match parsed {
                Some(values) if !all_empty => Column::Numeric(values),
                _ => Column::Text(raw),
            };
            (name, column)
        })
        .collect();
    Ok(FeatureTable { columns })
}

/// Write HRV feature rows with a `filename` column first and `label` last.
pub fn write_feature_csv(path: &Path, rows: &[FeatureRow]) -> Result<()> {
    let mut writer = WriterBuilder::new().from_path(path)?;
    let mut header = vec!["filename"];
    header.extend(HrvFeatures::NAMES);
    header.push(LABEL_COLUMN);
    writer.write_record(&header)?;
    for row in rows {
        let mut record = vec![row.filename.clone()];
        record.extend(row.features.to_vec().iter().map(|v| v.to_string()));
        record.push(row.label.to_string());
        writer.write_record(&record)?;
    }
    writer
        .flush()
        .map_err(|e| ApneaError::io(path, e))?;
    Ok(())
}
