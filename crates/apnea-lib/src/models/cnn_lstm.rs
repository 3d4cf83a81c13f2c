//! Convolutional + recurrent binary classifier over `(time_steps, 1)` RR
//! sequences.
//!
//! ```text
//! Conv1D(relu) -> MaxPool -> Dropout -> Conv1D(relu) -> MaxPool -> Dropout
//!   -> LSTM(final state) -> Dropout -> Dense(relu) -> Dense(1, sigmoid)
//! ```
//!
//! Trained with binary cross-entropy and Adam; early stopping on validation
//! loss restores the best weights seen.

use super::{
    layers::{
        col2im, conv1d, conv1d_backward, dropout, dropout_backward, glorot, lstm_backward,
        lstm_forward, max_pool, max_pool_backward, relu, relu_backward, sigmoid, LstmStep,
    },
    load_json,
    optim::Adam,
    save_json,
};
use crate::{
    config::CnnLstmConfig,
    error::{ApneaError, Result},
};
use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayViewD, ArrayViewMutD, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Matches the clipping applied to probabilities before taking logs.
const PROB_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    conv1_w: Array2<f64>,
    conv1_b: Array1<f64>,
    conv2_w: Array2<f64>,
    conv2_b: Array1<f64>,
    lstm_wx: Array2<f64>,
    lstm_wh: Array2<f64>,
    lstm_b: Array1<f64>,
    dense_w: Array2<f64>,
    dense_b: Array1<f64>,
    out_w: Array2<f64>,
    out_b: Array1<f64>,
}

impl Params {
    fn init(cfg: &CnnLstmConfig, rng: &mut StdRng) -> Self {
        let k = cfg.kernel_size;
        let (c1, c2, h, d) = (
            cfg.conv1_filters,
            cfg.conv2_filters,
            cfg.lstm_units,
            cfg.dense_units,
        );
        let mut lstm_b = Array1::<f64>::zeros(4 * h);
        // forget gate starts open
        lstm_b.slice_mut(ndarray::s![h..2 * h]).fill(1.0);
        Self {
            conv1_w: glorot(k, c1, k, k * c1, rng),
            conv1_b: Array1::zeros(c1),
            conv2_w: glorot(k * c1, c2, k * c1, k * c2, rng),
            conv2_b: Array1::zeros(c2),
            lstm_wx: glorot(c2, 4 * h, c2, 4 * h, rng),
            lstm_wh: glorot(h, 4 * h, h, 4 * h, rng),
            lstm_b,
            dense_w: glorot(h, d, h, d, rng),
            dense_b: Array1::zeros(d),
            out_w: glorot(d, 1, d, 1, rng),
            out_b: Array1::zeros(1),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            conv1_w: Array2::zeros(self.conv1_w.raw_dim()),
            conv1_b: Array1::zeros(self.conv1_b.raw_dim()),
            conv2_w: Array2::zeros(self.conv2_w.raw_dim()),
            conv2_b: Array1::zeros(self.conv2_b.raw_dim()),
            lstm_wx: Array2::zeros(self.lstm_wx.raw_dim()),
            lstm_wh: Array2::zeros(self.lstm_wh.raw_dim()),
            lstm_b: Array1::zeros(self.lstm_b.raw_dim()),
            dense_w: Array2::zeros(self.dense_w.raw_dim()),
            dense_b: Array1::zeros(self.dense_b.raw_dim()),
            out_w: Array2::zeros(self.out_w.raw_dim()),
            out_b: Array1::zeros(self.out_b.raw_dim()),
        }
    }

    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![
            self.conv1_w.view().into_dyn(),
            self.conv1_b.view().into_dyn(),
            self.conv2_w.view().into_dyn(),
            self.conv2_b.view().into_dyn(),
            self.lstm_wx.view().into_dyn(),
            self.lstm_wh.view().into_dyn(),
            self.lstm_b.view().into_dyn(),
            self.dense_w.view().into_dyn(),
            self.dense_b.view().into_dyn(),
            self.out_w.view().into_dyn(),
            self.out_b.view().into_dyn(),
        ]
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![
            self.conv1_w.view_mut().into_dyn(),
            self.conv1_b.view_mut().into_dyn(),
            self.conv2_w.view_mut().into_dyn(),
            self.conv2_b.view_mut().into_dyn(),
            self.lstm_wx.view_mut().into_dyn(),
            self.lstm_wh.view_mut().into_dyn(),
            self.lstm_b.view_mut().into_dyn(),
            self.dense_w.view_mut().into_dyn(),
            self.dense_b.view_mut().into_dyn(),
            self.out_w.view_mut().into_dyn(),
            self.out_b.view_mut().into_dyn(),
        ]
    }

    fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors().iter().map(|t| t.shape().to_vec()).collect()
    }

    fn count(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }
}

/// Activations kept from the forward pass for backpropagation.
struct Trace {
    cols1: Array2<f64>,
    act1: Array3<f64>,
    pool1: Array3<usize>,
    mask1: Option<Array3<f64>>,
    cols2: Array2<f64>,
    act2: Array3<f64>,
    pool2: Array3<usize>,
    mask2: Option<Array3<f64>>,
    lstm: Vec<LstmStep>,
    mask3: Option<Array2<f64>>,
    hidden: Array2<f64>,
    dense: Array2<f64>,
    proba: Array1<f64>,
}

/// Per-epoch metrics; validation fields are `None` without a validation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: usize,
    pub stopped_early: bool,
}

#[derive(Serialize, Deserialize)]
struct Artifact {
    config: CnnLstmConfig,
    time_steps: usize,
    params: Params,
    optimizer: Adam,
}

fn bce(proba: &Array1<f64>, y: &[f64]) -> f64 {
    let total: f64 = proba
        .iter()
        .zip(y)
        .map(|(&p, &t)| {
            let p = p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum();
    total / proba.len().max(1) as f64
}

fn correct(proba: &Array1<f64>, y: &[f64]) -> usize {
    proba
        .iter()
        .zip(y)
        .filter(|&(&p, &t)| (p > 0.5) == (t > 0.5))
        .count()
}

/// Time length left after each conv/pool stage, or `None` if a stage would
/// produce nothing.
fn stage_lengths(cfg: &CnnLstmConfig, time_steps: usize) -> Option<[usize; 4]> {
    let k = cfg.kernel_size;
    let p = cfg.pool_size;
    let conv1 = time_steps.checked_sub(k)? + 1;
    let pool1 = conv1 / p;
    let conv2 = pool1.checked_sub(k)? + 1;
    let pool2 = conv2 / p;
    (pool2 > 0).then_some([conv1, pool1, conv2, pool2])
}

pub struct CnnLstmModel {
    config: CnnLstmConfig,
    time_steps: usize,
    params: Params,
    optimizer: Adam,
    rng: StdRng,
}

impl CnnLstmModel {
    pub fn new(config: CnnLstmConfig, time_steps: usize) -> Result<Self> {
        if config.kernel_size == 0 || config.pool_size == 0 {
            return Err(ApneaError::InvalidArgument(
                "kernel_size and pool_size must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(ApneaError::InvalidArgument(format!(
                "dropout {} must be in [0, 1)",
                config.dropout
            )));
        }
        if stage_lengths(&config, time_steps).is_none() {
            return Err(ApneaError::InvalidArgument(format!(
                "{time_steps} time steps is too short for two conv/pool blocks"
            )));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = Params::init(&config, &mut rng);
        info!(
            "built CNN-LSTM for {time_steps} steps with {} parameters",
            params.count()
        );
        Ok(Self {
            optimizer: Adam::new(config.learning_rate),
            config,
            time_steps,
            params,
            rng,
        })
    }

    pub fn time_steps(&self) -> usize {
        self.time_steps
    }

    pub fn config(&self) -> &CnnLstmConfig {
        &self.config
    }

    pub fn n_parameters(&self) -> usize {
        self.params.count()
    }

    fn check_input(&self, x: &Array3<f64>, y: Option<&[u8]>) -> Result<()> {
        let (n, t, c) = x.dim();
        if t != self.time_steps || c != 1 {
            return Err(ApneaError::ShapeMismatch {
                expected: vec![n, self.time_steps, 1],
                actual: vec![n, t, c],
            });
        }
        if n == 0 {
            return Err(ApneaError::EmptyDataset("no sequences".into()));
        }
        if let Some(y) = y {
            if y.len() != n {
                return Err(ApneaError::ShapeMismatch {
                    expected: vec![n],
                    actual: vec![y.len()],
                });
            }
        }
        Ok(())
    }

    fn forward(&mut self, x: &Array3<f64>, training: bool) -> Trace {
        let k = self.config.kernel_size;
        let pool = self.config.pool_size;
        let rate = self.config.dropout;
        let w = &self.params;
        let rng = &mut self.rng;

        let (cols1, z1) = conv1d(x, &w.conv1_w, &w.conv1_b, k);
        let act1 = z1.mapv(relu);
        let (p1, pool1) = max_pool(&act1, pool);
        let (d1, mask1) = dropout(p1, rate, training, rng);

        let (cols2, z2) = conv1d(&d1, &w.conv2_w, &w.conv2_b, k);
        let act2 = z2.mapv(relu);
        let (p2, pool2) = max_pool(&act2, pool);
        let (d2, mask2) = dropout(p2, rate, training, rng);

        let (h_last, lstm) = lstm_forward(&d2, &w.lstm_wx, &w.lstm_wh, &w.lstm_b);
        let (hidden, mask3) = dropout(h_last, rate, training, rng);
        let dense = (hidden.dot(&w.dense_w) + &w.dense_b).mapv(relu);
        let logits = dense.dot(&w.out_w) + &w.out_b;
        let proba = logits.column(0).mapv(sigmoid);
        Trace {
            cols1,
            act1,
            pool1,
            mask1,
            cols2,
            act2,
            pool2,
            mask2,
            lstm,
            mask3,
            hidden,
            dense,
            proba,
        }
    }

    /// Gradients of the mean BCE over the batch.
    fn backward(&self, x: &Array3<f64>, y: &[f64], trace: &Trace) -> Params {
        let w = &self.params;
        let mut g = w.zeros_like();
        let (batch, t, _) = x.dim();
        let Some([conv1_len, pool1_len, conv2_len, _]) = stage_lengths(&self.config, t) else {
            return g;
        };
        let k = self.config.kernel_size;
        let c1 = self.config.conv1_filters;

        let dlogit = Array2::from_shape_fn((batch, 1), |(i, _)| {
            (trace.proba[i] - y[i]) / batch as f64
        });
        g.out_w = trace.dense.t().dot(&dlogit);
        g.out_b = dlogit.sum_axis(Axis(0));

        let mut ddense = dlogit.dot(&w.out_w.t());
        relu_backward(&mut ddense, &trace.dense);
        g.dense_w = trace.hidden.t().dot(&ddense);
        g.dense_b = ddense.sum_axis(Axis(0));

        let dh = dropout_backward(ddense.dot(&w.dense_w.t()), &trace.mask3);
        let lstm = lstm_backward(&trace.lstm, &dh, &w.lstm_wx, &w.lstm_wh);
        g.lstm_wx = lstm.dwx;
        g.lstm_wh = lstm.dwh;
        g.lstm_b = lstm.db;

        let dp2 = dropout_backward(lstm.dseq, &trace.mask2);
        let mut dz2 = max_pool_backward(&dp2, &trace.pool2, conv2_len);
        relu_backward(&mut dz2, &trace.act2);
        let (dw2, db2, dcols2) = conv1d_backward(&trace.cols2, &dz2, &w.conv2_w);
        g.conv2_w = dw2;
        g.conv2_b = db2;

        let dd1 = col2im(&dcols2, (batch, pool1_len, c1), k);
        let dp1 = dropout_backward(dd1, &trace.mask1);
        let mut dz1 = max_pool_backward(&dp1, &trace.pool1, conv1_len);
        relu_backward(&mut dz1, &trace.act1);
        let (dw1, db1, _) = conv1d_backward(&trace.cols1, &dz1, &w.conv1_w);
        g.conv1_w = dw1;
        g.conv1_b = db1;
        g
    }

    fn batch(x: &Array3<f64>, y: &[f64], idx: &[usize]) -> (Array3<f64>, Vec<f64>) {
        (x.select(Axis(0), idx), idx.iter().map(|&i| y[i]).collect())
    }

    fn probabilities(&mut self, x: &Array3<f64>) -> Array1<f64> {
        let n = x.dim().0;
        let step = self.config.batch_size.max(1);
        let mut out = Vec::with_capacity(n);
        let mut start = 0;
        while start < n {
            let end = (start + step).min(n);
            let chunk = x.slice(ndarray::s![start..end, .., ..]).to_owned();
            out.extend(self.forward(&chunk, false).proba.iter().copied());
            start = end;
        }
        Array1::from(out)
    }

    /// Fit with mini-batches, monitoring validation loss (training loss when
    /// the validation set is empty) for early stopping.
    pub fn train(
        &mut self,
        x_train: &Array3<f64>,
        y_train: &[u8],
        x_val: &Array3<f64>,
        y_val: &[u8],
        epochs: usize,
        batch_size: usize,
    ) -> Result<History> {
        self.check_input(x_train, Some(y_train))?;
        let has_val = x_val.dim().0 > 0;
        if has_val {
            self.check_input(x_val, Some(y_val))?;
        }
        if batch_size == 0 {
            return Err(ApneaError::InvalidArgument("batch_size must be positive".into()));
        }
        let y: Vec<f64> = y_train.iter().map(|&v| v as f64).collect();
        let n = y.len();
        let mut order: Vec<usize> = (0..n).collect();
        let mut history = History::default();
        let mut best: Option<(f64, Params)> = None;
        let mut wait = 0;

        for epoch in 1..=epochs {
            order.shuffle(&mut self.rng);
            let mut loss_sum = 0.0;
            let mut hits = 0;
            for idx in order.chunks(batch_size) {
                let (xb, yb) = Self::batch(x_train, &y, idx);
                let trace = self.forward(&xb, true);
                loss_sum += bce(&trace.proba, &yb) * idx.len() as f64;
                hits += correct(&trace.proba, &yb);
                let grads = self.backward(&xb, &yb, &trace);
                self.optimizer.step(self.params.tensors_mut(), grads.tensors());
            }
            let loss = loss_sum / n as f64;
            let accuracy = hits as f64 / n as f64;
            let (val_loss, val_accuracy) = if has_val {
                let (l, a) = self.evaluate(x_val, y_val)?;
                (Some(l), Some(a))
            } else {
                (None, None)
            };
            info!(
                "epoch {epoch}/{epochs}: loss {loss:.4} accuracy {accuracy:.4}{}",
                match (val_loss, val_accuracy) {
                    (Some(l), Some(a)) => format!(" val_loss {l:.4} val_accuracy {a:.4}"),
                    _ => String::new(),
                }
            );
            history.epochs.push(EpochRecord {
                epoch,
                loss,
                accuracy,
                val_loss,
                val_accuracy,
            });

            let monitored = val_loss.unwrap_or(loss);
            if best.as_ref().map_or(true, |(b, _)| monitored < *b) {
                best = Some((monitored, self.params.clone()));
                history.best_epoch = epoch;
                wait = 0;
            } else {
                wait += 1;
                if wait >= self.config.patience {
                    info!(
                        "early stopping at epoch {epoch}, restoring weights from epoch {}",
                        history.best_epoch
                    );
                    history.stopped_early = true;
                    break;
                }
            }
        }
        if let Some((_, params)) = best {
            self.params = params;
        }
        Ok(history)
    }

    /// Mean BCE loss and accuracy at inference (no dropout).
    pub fn evaluate(&mut self, x: &Array3<f64>, y: &[u8]) -> Result<(f64, f64)> {
        self.check_input(x, Some(y))?;
        let y: Vec<f64> = y.iter().map(|&v| v as f64).collect();
        let proba = self.probabilities(x);
        let loss = bce(&proba, &y);
        let accuracy = correct(&proba, &y) as f64 / y.len() as f64;
        debug!("evaluated {} sequences: loss {loss:.4}", y.len());
        Ok((loss, accuracy))
    }

    pub fn predict_proba(&mut self, x: &Array3<f64>) -> Result<Array1<f64>> {
        self.check_input(x, None)?;
        Ok(self.probabilities(x))
    }

    /// 1 where the apnea probability exceeds 0.5.
    pub fn predict(&mut self, x: &Array3<f64>) -> Result<Vec<u8>> {
        Ok(self
            .predict_proba(x)?
            .iter()
            .map(|&p| u8::from(p > 0.5))
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let artifact = Artifact {
            config: self.config.clone(),
            time_steps: self.time_steps,
            params: self.params.clone(),
            optimizer: self.optimizer.clone(),
        };
        save_json(path, &artifact)?;
        info!("saved CNN-LSTM to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let artifact: Artifact = load_json(path)?;
        let mut model = Self::new(artifact.config, artifact.time_steps)?;
        if artifact.params.shapes() != model.params.shapes() {
            return Err(ApneaError::InvalidArgument(format!(
                "{} holds weights that do not match its architecture",
                path.display()
            )));
        }
        model.params = artifact.params;
        model.optimizer = artifact.optimizer;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn tiny_config() -> CnnLstmConfig {
        CnnLstmConfig {
            conv1_filters: 3,
            conv2_filters: 4,
            kernel_size: 3,
            pool_size: 2,
            dropout: 0.0,
            lstm_units: 5,
            dense_units: 4,
            learning_rate: 0.01,
            batch_size: 8,
            epochs: 30,
            patience: 5,
            seed: 7,
        }
    }

    fn data(n: usize, t: usize, seed: u64) -> (Array3<f64>, Vec<u8>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let y: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
        let x = Array3::from_shape_fn((n, t, 1), |(i, j, _)| {
            // apnea rows oscillate, normal rows stay flat
            let base = if y[i] == 1 { (j as f64 * 1.3).sin() } else { 0.0 };
            base + rng.gen_range(-0.1..0.1)
        });
        (x, y)
    }

    #[test]
    fn rejects_wrong_shapes() {
        let mut model = CnnLstmModel::new(tiny_config(), 16).unwrap();
        let x = Array3::zeros((2, 15, 1));
        assert!(matches!(
            model.predict(&x),
            Err(ApneaError::ShapeMismatch { .. })
        ));
        let x = Array3::zeros((2, 16, 2));
        assert!(matches!(
            model.predict(&x),
            Err(ApneaError::ShapeMismatch { .. })
        ));
        let x = Array3::zeros((0, 16, 1));
        assert!(matches!(model.predict(&x), Err(ApneaError::EmptyDataset(_))));
        assert!(CnnLstmModel::new(tiny_config(), 6).is_err());
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let mut model = CnnLstmModel::new(tiny_config(), 16).unwrap();
        let (x, labels) = data(3, 16, 1);
        let y: Vec<f64> = labels.iter().map(|&v| v as f64).collect();
        let trace = model.forward(&x, false);
        let grads = model.backward(&x, &y, &trace);
        let analytic: Vec<Vec<f64>> = grads
            .tensors()
            .iter()
            .map(|t| t.iter().copied().collect())
            .collect();

        let eps = 1e-6;
        for (ti, tensor) in analytic.iter().enumerate() {
            for j in [0, tensor.len() / 2, tensor.len() - 1] {
                let original = model.params.tensors()[ti].iter().nth(j).copied().unwrap();
                let mut loss_at = |value: f64| {
                    if let Some(v) = model.params.tensors_mut()[ti].iter_mut().nth(j) {
                        *v = value;
                    }
                    let trace = model.forward(&x, false);
                    bce(&trace.proba, &y)
                };
                let numeric = (loss_at(original + eps) - loss_at(original - eps)) / (2.0 * eps);
                loss_at(original);
                let exact = tensor[j];
                let tol = 1e-5 * exact.abs().max(numeric.abs()).max(1e-3);
                assert!(
                    (exact - numeric).abs() <= tol,
                    "tensor {ti} entry {j}: analytic {exact} numeric {numeric}"
                );
            }
        }
    }

    #[test]
    fn training_reduces_loss_and_learns_pattern() {
        let mut model = CnnLstmModel::new(tiny_config(), 16).unwrap();
        let (x, y) = data(40, 16, 2);
        let (xv, yv) = data(12, 16, 3);
        let (before, _) = model.evaluate(&xv, &yv).unwrap();
        let history = model.train(&x, &y, &xv, &yv, 30, 8).unwrap();
        assert!(!history.epochs.is_empty());
        let (after, accuracy) = model.evaluate(&xv, &yv).unwrap();
        assert!(after < before, "loss {before} -> {after}");
        assert!(accuracy >= 0.75, "accuracy {accuracy}");
        let best = &history.epochs[history.best_epoch - 1];
        assert!((best.val_loss.unwrap() - after).abs() < 1e-9);
    }

    #[test]
    fn early_stopping_respects_patience() {
        let cfg = CnnLstmConfig {
            learning_rate: 0.0,
            patience: 2,
            ..tiny_config()
        };
        let mut model = CnnLstmModel::new(cfg, 16).unwrap();
        let (x, y) = data(8, 16, 4);
        let history = model.train(&x, &y, &x, &y, 50, 4).unwrap();
        // a frozen model never improves after the first epoch
        assert!(history.stopped_early);
        assert_eq!(history.best_epoch, 1);
        assert_eq!(history.epochs.len(), 3);
    }

    #[test]
    fn save_then_load_restores_weights_and_optimizer() {
        let mut model = CnnLstmModel::new(tiny_config(), 16).unwrap();
        let (x, y) = data(10, 16, 5);
        let empty = Array3::zeros((0, 16, 1));
        model.train(&x, &y, &empty, &[], 2, 5).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cnn_lstm.json");
        model.save(&path).unwrap();
        let mut loaded = CnnLstmModel::load(&path).unwrap();
        assert_eq!(loaded.params, model.params);
        assert_eq!(loaded.optimizer, model.optimizer);
        assert_eq!(loaded.optimizer.iterations(), 4);
        assert_eq!(loaded.predict(&x).unwrap(), model.predict(&x).unwrap());
    }
}
