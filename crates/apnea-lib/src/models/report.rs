use crate::{
    config::{CLASS_NAMES, N_CLASSES},
    error::{ApneaError, Result},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counts with rows as the true class and columns as the predicted class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix(pub [[usize; N_CLASSES]; N_CLASSES]);

impl ConfusionMatrix {
    pub fn from_labels(y_true: &[u8], y_pred: &[u8]) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            return Err(ApneaError::ShapeMismatch {
                expected: vec![y_true.len()],
                actual: vec![y_pred.len()],
            });
        }
        let mut counts = [[0usize; N_CLASSES]; N_CLASSES];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            let (t, p) = (t as usize, p as usize);
            if t >= N_CLASSES || p >= N_CLASSES {
                return Err(ApneaError::InvalidArgument(format!(
                    "label out of range: true {t}, predicted {p}"
                )));
            }
            counts[t][p] += 1;
        }
        Ok(Self(counts))
    }

    pub fn total(&self) -> usize {
        self.0.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..N_CLASSES).map(|c| self.0[c][c]).sum()
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.0 {
            let cells: Vec<String> = row.iter().map(|c| format!("{c:>6}")).collect();
            writeln!(f, "[{}]", cells.join(""))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision, recall and F1 with accuracy and the macro and
/// support-weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<(String, ClassScores)>,
    pub accuracy: f64,
    pub macro_avg: ClassScores,
    pub weighted_avg: ClassScores,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn average(classes: &[(String, ClassScores)], weights: &[f64], norm: f64, support: usize) -> ClassScores {
    let mean = |pick: fn(&ClassScores) -> f64| {
        classes
            .iter()
            .zip(weights)
            .map(|((_, s), w)| w * pick(s))
            .sum::<f64>()
            / norm
    };
    ClassScores {
        precision: mean(|s| s.precision),
        recall: mean(|s| s.recall),
        f1: mean(|s| s.f1),
        support,
    }
}

impl ClassificationReport {
    pub fn from_confusion(cm: &ConfusionMatrix) -> Self {
        let m = &cm.0;
        let classes: Vec<(String, ClassScores)> = (0..N_CLASSES)
            .map(|c| {
                let tp = m[c][c];
                let predicted: usize = (0..N_CLASSES).map(|r| m[r][c]).sum();
                let support: usize = m[c].iter().sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                let scores = ClassScores {
                    precision,
                    recall,
                    f1,
                    support,
                };
                (CLASS_NAMES[c].to_string(), scores)
            })
            .collect();
        let total = cm.total();
        let macro_avg = average(&classes, &[1.0; N_CLASSES], N_CLASSES as f64, total);
        let weighted_avg = if total > 0 {
            let weights: Vec<f64> = classes.iter().map(|(_, s)| s.support as f64).collect();
            average(&classes, &weights, total as f64, total)
        } else {
            ClassScores::default()
        };
        Self {
            accuracy: ratio(cm.correct(), total),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, name: &str, s: &ClassScores) -> fmt::Result {
    writeln!(
        f,
        "{name:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
        s.precision, s.recall, s.f1, s.support
    )
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for (name, scores) in &self.classes {
            write_row(f, name, scores)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        write_row(f, "macro avg", &self.macro_avg)?;
        write_row(f, "weighted avg", &self.weighted_avg)
    }
}
