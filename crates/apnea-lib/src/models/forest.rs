use super::{
    load_json,
    report::{ClassificationReport, ConfusionMatrix},
    save_json,
    scaler::StandardScaler,
    tree::{DecisionTree, TreeParams},
};
use crate::{
    config::{ForestConfig, N_CLASSES},
    error::{ApneaError, Result},
    io::features::{Column, FeatureTable, ID_COLUMNS, LABEL_COLUMN},
};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `n / (n_classes * count_c)` per row; classes absent from `y` get no weight.
pub fn balanced_weights(y: &[u8]) -> Vec<f64> {
    let mut counts = [0usize; N_CLASSES];
    for &label in y {
        counts[label as usize] += 1;
    }
    let n = y.len() as f64;
    y.iter()
        .map(|&label| n / (N_CLASSES as f64 * counts[label as usize] as f64))
        .collect()
}

fn check_inputs(x: ArrayView2<'_, f64>, y: &[u8]) -> Result<()> {
    if x.nrows() == 0 {
        return Err(ApneaError::EmptyDataset("no training rows".into()));
    }
    if x.nrows() != y.len() {
        return Err(ApneaError::ShapeMismatch {
            expected: vec![x.nrows()],
            actual: vec![y.len()],
        });
    }
    if let Some(bad) = y.iter().find(|&&l| l as usize >= N_CLASSES) {
        return Err(ApneaError::InvalidArgument(format!("label {bad} out of range")));
    }
    if let Some(((row, col), v)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(ApneaError::InvalidArgument(format!(
            "non-finite feature value {v} at row {row}, column {col}"
        )));
    }
    Ok(())
}

/// Bagged CART trees; each tree draws a bootstrap sample and considers
/// `sqrt(n_features)` candidate features per split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    config: ForestConfig,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            n_features: 0,
            trees: Vec::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[u8]) -> Result<()> {
        check_inputs(x, y)?;
        let n = x.nrows();
        let weight = if self.config.class_weight_balanced {
            balanced_weights(y)
        } else {
            vec![1.0; n]
        };
        let params = TreeParams {
            max_depth: self.config.max_depth,
            min_samples_split: self.config.min_samples_split,
            max_features: ((x.ncols() as f64).sqrt() as usize).max(1),
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.trees = (0..self.config.n_estimators)
            .map(|_| {
                let mut tree_rng = StdRng::seed_from_u64(rng.gen());
                let rows: Vec<usize> = (0..n).map(|_| tree_rng.gen_range(0..n)).collect();
                DecisionTree::fit(x, y, &weight, &rows, params, &mut tree_rng)
            })
            .collect();
        self.n_features = x.ncols();
        debug!(
            "fitted {} trees, mean depth {:.1}",
            self.trees.len(),
            self.trees.iter().map(|t| t.depth() as f64).sum::<f64>() / self.trees.len().max(1) as f64
        );
        Ok(())
    }

    /// Mean of the per-tree leaf distributions, shape (rows, classes).
    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if !self.is_fitted() {
            return Err(ApneaError::NotTrained);
        }
        if x.ncols() != self.n_features {
            return Err(ApneaError::ShapeMismatch {
                expected: vec![x.nrows(), self.n_features],
                actual: x.shape().to_vec(),
            });
        }
        let mut proba = Array2::<f64>::zeros((x.nrows(), N_CLASSES));
        for (row, mut out) in x.rows().into_iter().zip(proba.rows_mut()) {
            for tree in &self.trees {
                for (o, p) in out.iter_mut().zip(tree.predict_proba_row(row)) {
                    *o += p;
                }
            }
        }
        proba /= self.trees.len() as f64;
        Ok(proba)
    }

    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<u8>> {
        let proba = self.predict_proba(x)?;
        Ok(proba
            .rows()
            .into_iter()
            .map(|row| {
                // ties go to the lower class index
                let mut best = 0;
                for (c, &p) in row.iter().enumerate() {
                    if p > row[best] {
                        best = c;
                    }
                }
                best as u8
            })
            .collect())
    }
}

/// Scaled feature matrix and labels ready for the forest.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub x: Array2<f64>,
    pub y: Vec<u8>,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Artifact {
    feature_names: Vec<String>,
    scaler: StandardScaler,
    forest: RandomForest,
}

/// Forest plus the scaler it was trained behind. Saved and loaded as one unit.
#[derive(Debug, Clone)]
pub struct RandomForestModel {
    scaler: StandardScaler,
    forest: RandomForest,
    feature_names: Vec<String>,
}

impl RandomForestModel {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            scaler: StandardScaler::new(),
            forest: RandomForest::new(config),
            feature_names: Vec::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.forest.is_fitted()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Drop identifier columns, split off `label`, then fit the scaler on the
    /// remaining numeric columns and apply it.
    pub fn preprocess(&mut self, table: &FeatureTable) -> Result<Prepared> {
        let Some(Column::Numeric(labels)) = table.column(LABEL_COLUMN) else {
            return Err(ApneaError::InvalidArgument(format!(
                "feature table needs a numeric '{LABEL_COLUMN}' column"
            )));
        };
        let y = labels
            .iter()
            .enumerate()
            .map(|(row, &l)| match l {
                l if l == 0.0 => Ok(0),
                l if l == 1.0 => Ok(1),
                _ => Err(ApneaError::InvalidArgument(format!(
                    "label {l} at row {row} is not 0 or 1"
                ))),
            })
            .collect::<Result<Vec<u8>>>()?;
        let mut feature_names = Vec::new();
        let mut columns = Vec::new();
        for (name, column) in &table.columns {
            if name == LABEL_COLUMN || ID_COLUMNS.contains(&name.as_str()) {
                continue;
            }
            match column {
                Column::Numeric(values) => {
                    feature_names.push(name.clone());
                    columns.push(values);
                }
                Column::Text(_) => warn!("dropping non-numeric feature column {name}"),
            }
        }
        if columns.is_empty() {
            return Err(ApneaError::EmptyDataset("no numeric feature columns".into()));
        }
        let raw = Array2::from_shape_fn((table.n_rows(), columns.len()), |(r, c)| columns[c][r]);
        if let Some(((row, col), v)) = raw.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(ApneaError::InvalidArgument(format!(
                "non-finite value {v} in column {} at row {row}",
                feature_names[col]
            )));
        }
        let x = self.scaler.fit_transform(&raw)?;
        self.feature_names = feature_names.clone();
        info!(
            "preprocessed {} rows x {} features",
            x.nrows(),
            x.ncols()
        );
        Ok(Prepared {
            x,
            y,
            feature_names,
        })
    }

    pub fn train(&mut self, x: ArrayView2<'_, f64>, y: &[u8]) -> Result<()> {
        self.forest.fit(x, y)?;
        info!(
            "random forest of {} trees trained on {} rows",
            self.forest.n_trees(),
            x.nrows()
        );
        Ok(())
    }

    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<u8>> {
        self.forest.predict(x)
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.forest.predict_proba(x)
    }

    pub fn evaluate(
        &self,
        x: ArrayView2<'_, f64>,
        y: &[u8],
    ) -> Result<(ClassificationReport, ConfusionMatrix)> {
        let predicted = self.predict(x)?;
        let cm = ConfusionMatrix::from_labels(y, &predicted)?;
        Ok((ClassificationReport::from_confusion(&cm), cm))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if !self.is_trained() {
            return Err(ApneaError::NotTrained);
        }
        let artifact = Artifact {
            feature_names: self.feature_names.clone(),
            scaler: self.scaler.clone(),
            forest: self.forest.clone(),
        };
        save_json(path, &artifact)?;
        info!("saved random forest to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let artifact: Artifact = load_json(path)?;
        Ok(Self {
            scaler: artifact.scaler,
            forest: artifact.forest,
            feature_names: artifact.feature_names,
        })
    }
}
