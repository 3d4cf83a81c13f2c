use crate::error::{ApneaError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Per-column standardisation to zero mean and unit variance. Columns with
/// zero variance are centred only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.mean.is_some()
    }

    pub fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        if x.nrows() == 0 {
            return Err(ApneaError::EmptyDataset("cannot fit scaler on zero rows".into()));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| ApneaError::EmptyDataset("cannot fit scaler on zero rows".into()))?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s == 0.0 || !s.is_finite() { 1.0 } else { s });
        self.mean = Some(mean);
        self.scale = Some(scale);
        Ok(())
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (Some(mean), Some(scale)) = (&self.mean, &self.scale) else {
            return Err(ApneaError::NotTrained);
        };
        if x.ncols() != mean.len() {
            return Err(ApneaError::ShapeMismatch {
                expected: vec![x.nrows(), mean.len()],
                actual: x.shape().to_vec(),
            });
        }
        Ok((x - mean) / scale)
    }

    pub fn fit_transform(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.fit(x)?;
        self.transform(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardises_columns() {
        let x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
        let mut scaler = StandardScaler::new();
        let z = scaler.fit_transform(&x).unwrap();
        let col0: Vec<f64> = z.column(0).to_vec();
        let std = (8.0f64 / 3.0).sqrt();
        assert!((col0[0] + 2.0 / std).abs() < 1e-12);
        assert!(col0[1].abs() < 1e-12);
        // constant column is centred, not divided by zero
        assert!(z.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn transform_before_fit_is_rejected() {
        let scaler = StandardScaler::new();
        assert!(matches!(
            scaler.transform(&array![[1.0]]),
            Err(ApneaError::NotTrained)
        ));
    }

    #[test]
    fn column_count_must_match() {
        let mut scaler = StandardScaler::new();
        scaler.fit(&array![[1.0, 2.0], [2.0, 3.0]]).unwrap();
        assert!(matches!(
            scaler.transform(&array![[1.0]]),
            Err(ApneaError::ShapeMismatch { .. })
        ));
    }
}
