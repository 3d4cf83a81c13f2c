//! Weighted CART classification tree with Gini impurity.

use crate::config::N_CLASSES;
use ndarray::{ArrayView1, ArrayView2};
use rand::{rngs::StdRng, seq::index::sample};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Class distribution of the training weight that reached this leaf.
    Leaf { proba: [f64; N_CLASSES] },
    /// Rows with `x[feature] <= threshold` go left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub max_features: usize,
}

/// Nodes are stored flat; index 0 is the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

type Counts = [f64; N_CLASSES];

/// Threshold strictly separating `here < next`, or `None` when either side
/// is not finite.
fn midpoint(here: f64, next: f64) -> Option<f64> {
    if !here.is_finite() || !next.is_finite() {
        return None;
    }
    // halve first so the sum cannot overflow
    let mid = here / 2.0 + next / 2.0;
    Some(if mid >= next { here } else { mid })
}

fn gini(counts: &Counts) -> f64 {
    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

struct Builder<'a, 'b> {
    x: ArrayView2<'a, f64>,
    y: &'b [u8],
    weight: &'b [f64],
    params: TreeParams,
    rng: &'b mut StdRng,
    nodes: Vec<TreeNode>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl Builder<'_, '_> {
    fn counts(&self, rows: &[usize]) -> Counts {
        let mut counts = [0.0; N_CLASSES];
        for &r in rows {
            counts[self.y[r] as usize] += self.weight[r];
        }
        counts
    }

    fn leaf(&mut self, counts: &Counts) -> usize {
        let total: f64 = counts.iter().sum();
        let mut proba = [0.0; N_CLASSES];
        if total > 0.0 {
            for (p, c) in proba.iter_mut().zip(counts) {
                *p = c / total;
            }
        }
        self.nodes.push(TreeNode::Leaf { proba });
        self.nodes.len() - 1
    }

    fn best_split(&mut self, rows: &[usize], parent: &Counts) -> Option<BestSplit> {
        let n_features = self.x.ncols();
        let candidates = sample(&mut *self.rng, n_features, self.params.max_features.min(n_features));
        let total: f64 = parent.iter().sum();
        let mut best: Option<BestSplit> = None;
        let mut sorted = rows.to_vec();
        for feature in candidates.iter() {
            let column = self.x.column(feature);
            sorted.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
            let mut left = [0.0; N_CLASSES];
            for pos in 0..sorted.len() - 1 {
                let r = sorted[pos];
                left[self.y[r] as usize] += self.weight[r];
                let (here, next) = (column[r], column[sorted[pos + 1]]);
                if here == next {
                    continue;
                }
                let Some(threshold) = midpoint(here, next) else {
                    continue;
                };
                let mut right = *parent;
                for (rc, lc) in right.iter_mut().zip(&left) {
                    *rc -= lc;
                }
                let w_left: f64 = left.iter().sum();
                let impurity = (w_left * gini(&left) + (total - w_left) * gini(&right)) / total;
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    best = Some(BestSplit {
                        feature,
                        threshold,
                        impurity,
                    });
                }
            }
        }
        best
    }

    fn grow(&mut self, rows: &[usize], depth: usize) -> usize {
        let counts = self.counts(rows);
        let parent_impurity = gini(&counts);
        let at_depth_limit = self.params.max_depth.is_some_and(|d| depth >= d);
        if parent_impurity == 0.0 || at_depth_limit || rows.len() < self.params.min_samples_split.max(2) {
            return self.leaf(&counts);
        }
        let split = match self.best_split(rows, &counts) {
            Some(split) if split.impurity < parent_impurity => split,
            _ => return self.leaf(&counts),
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&r| self.x[[r, split.feature]] <= split.threshold);
        if left_rows.is_empty() || right_rows.is_empty() {
            return self.leaf(&counts);
        }
        // placeholder until both children exist
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf {
            proba: [0.0; N_CLASSES],
        });
        let left = self.grow(&left_rows, depth + 1);
        let right = self.grow(&right_rows, depth + 1);
        self.nodes[idx] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }
}

impl DecisionTree {
    /// Fit on the rows listed in `rows` (repeats allowed, as from a bootstrap
    /// draw), each weighted by `weight[row]`.
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: &[u8],
        weight: &[f64],
        rows: &[usize],
        params: TreeParams,
        rng: &mut StdRng,
    ) -> Self {
        let mut builder = Builder {
            x,
            y,
            weight,
            params,
            rng,
            nodes: Vec::new(),
        };
        builder.grow(rows, 0);
        Self {
            nodes: builder.nodes,
        }
    }

    pub fn predict_proba_row(&self, row: ArrayView1<'_, f64>) -> [f64; N_CLASSES] {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { proba }) => return *proba,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => return [0.0; N_CLASSES],
            }
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(TreeNode::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn params() -> TreeParams {
        TreeParams {
            max_depth: None,
            min_samples_split: 2,
            max_features: 2,
        }
    }

    #[test]
    fn gini_of_pure_and_even_nodes() {
        assert_eq!(gini(&[4.0, 0.0]), 0.0);
        assert!((gini(&[2.0, 2.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn separable_data_fits_exactly() {
        let x = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [10.0, 5.0], [11.0, 5.0]];
        let y = [0, 0, 0, 1, 1];
        let w = [1.0; 5];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = DecisionTree::fit(x.view(), &y, &w, &[0, 1, 2, 3, 4], params(), &mut rng);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.n_nodes(), 3);
        assert_eq!(tree.predict_proba_row(array![1.5, 0.0].view()), [1.0, 0.0]);
        assert_eq!(tree.predict_proba_row(array![6.1, 0.0].view()), [0.0, 1.0]);
    }

    #[test]
    fn depth_limit_produces_mixed_leaf() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = [0, 1, 0, 1];
        let w = [1.0; 4];
        let mut rng = StdRng::seed_from_u64(0);
        let p = TreeParams {
            max_depth: Some(0),
            ..params()
        };
        let tree = DecisionTree::fit(x.view(), &y, &w, &[0, 1, 2, 3], p, &mut rng);
        assert_eq!(tree.predict_proba_row(array![0.0].view()), [0.5, 0.5]);
    }

    #[test]
    fn sample_weights_shift_leaf_distribution() {
        let x = array![[0.0], [0.0], [0.0]];
        let y = [0, 0, 1];
        let w = [1.0, 1.0, 2.0];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = DecisionTree::fit(x.view(), &y, &w, &[0, 1, 2], params(), &mut rng);
        // constant feature cannot split
        assert_eq!(tree.predict_proba_row(array![0.0].view()), [0.5, 0.5]);
    }

    #[test]
    fn midpoint_stays_between_extreme_values() {
        assert_eq!(midpoint(-1e308, 1e308), Some(0.0));
        assert_eq!(midpoint(1.0, 3.0), Some(2.0));
        let next = 1.0f64;
        let here = f64::from_bits(next.to_bits() - 1);
        assert_eq!(midpoint(here, next), Some(here));
        assert_eq!(midpoint(0.0, f64::NAN), None);
        assert_eq!(midpoint(f64::NEG_INFINITY, 0.0), None);
    }

    #[test]
    fn extreme_finite_range_splits_once() {
        let x = array![[-1e308], [-1e308], [1e308]];
        let y = [0, 0, 1];
        let w = [1.0; 3];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = DecisionTree::fit(x.view(), &y, &w, &[0, 1, 2], params(), &mut rng);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict_proba_row(array![-1e308].view()), [1.0, 0.0]);
        assert_eq!(tree.predict_proba_row(array![1e308].view()), [0.0, 1.0]);
    }

    #[test]
    fn non_finite_values_end_in_a_leaf() {
        let x = array![[0.0], [f64::NAN], [f64::INFINITY]];
        let y = [0, 1, 1];
        let w = [1.0; 3];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = DecisionTree::fit(x.view(), &y, &w, &[0, 1, 2], params(), &mut rng);
        assert_eq!(tree.n_nodes(), 1);
    }
}
