//! Isolation-forest outlier model.
//!
//! A forest of randomized binary trees, each grown on a subsample of the
//! training window. A tree isolates points by recursive random splits; the
//! score of a point is a function of its mean path depth across trees.
//! Points that isolate in fewer splits than the training cohort score
//! negative.
//!
//! Score calibration: the fit computes the mean depth of every training row,
//! takes the contamination-quantile of those depths as the decision offset,
//! and normalizes by the depth spread below the offset. Approximately
//! `contamination` of the training window therefore scores below zero, and
//! a point that isolates faster than anything seen in training saturates
//! at -1.

use crate::error::DetectorError;
use crate::metrics::{FeatureVector, FEATURE_COUNT};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default number of trees in the ensemble.
pub const DEFAULT_TREES: usize = 100;

/// Default per-tree subsample ceiling.
pub const DEFAULT_SUBSAMPLE: usize = 256;

/// Floor on the depth-normalization span, so a near-constant training window
/// does not turn tiny depth differences into saturated scores.
const MIN_DEPTH_SPAN: f64 = 0.5;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Fit-time parameters of the forest.
#[derive(Clone, Copy, Debug)]
pub struct ForestConfig {
    pub trees: usize,
    pub subsample: usize,
    /// Expected anomaly fraction; sets the decision offset on the training
    /// depth distribution.
    pub contamination: f64,
    /// Master seed; fit is fully deterministic for a fixed seed and input.
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            trees: DEFAULT_TREES,
            subsample: DEFAULT_SUBSAMPLE,
            contamination: 0.05,
            seed: 42,
        }
    }
}

/// Verdict for one scored sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Score {
    /// Signed decision value; smaller is more anomalous, 0 is the boundary.
    pub raw_score: f64,
    /// True iff `raw_score < 0`.
    pub is_anomaly: bool,
}

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

struct Tree {
    root: Node,
}

impl Tree {
    fn path_depth(&self, x: &FeatureVector) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] < *threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Trained forest state. Replaced as a whole on retrain; scoring is
/// read-only and lock-free once a reference is taken.
pub struct IsolationForest {
    trees: Vec<Tree>,
    offset_depth: f64,
    depth_span: f64,
    trained_at: DateTime<Utc>,
    sample_count_at_fit: usize,
}

impl IsolationForest {
    /// Fit a forest on the training window.
    ///
    /// Fails on degenerate input: fewer than two rows, or no feature with
    /// any spread (an all-constant window cannot be split).
    pub fn fit(
        data: &[FeatureVector],
        config: &ForestConfig,
        trained_at: DateTime<Utc>,
    ) -> Result<Self, DetectorError> {
        let n = data.len();
        let varying = varying_features(data);
        if n < 2 || varying.is_empty() {
            return Err(DetectorError::DegenerateTrainingData {
                rows: n,
                varying_features: varying.len(),
            });
        }

        let subsample = config.subsample.min(n).max(2);
        let height_limit = (subsample as f64).log2().ceil() as usize;
        let mut master = StdRng::seed_from_u64(config.seed);

        let mut trees = Vec::with_capacity(config.trees);
        for _ in 0..config.trees {
            let mut rng = StdRng::seed_from_u64(master.gen());
            let rows = rand::seq::index::sample(&mut rng, n, subsample).into_vec();
            let root = build_node(data, rows, 0, height_limit, &mut rng);
            trees.push(Tree { root });
        }

        let mut forest = IsolationForest {
            trees,
            offset_depth: 0.0,
            depth_span: MIN_DEPTH_SPAN,
            trained_at,
            sample_count_at_fit: n,
        };

        // Calibrate the decision boundary on the training depth distribution.
        let mut depths: Vec<f64> = data.iter().map(|x| forest.mean_depth(x)).collect();
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let offset_idx = ((config.contamination * n as f64).floor() as usize).min(n - 1);
        forest.offset_depth = depths[offset_idx];
        forest.depth_span = (forest.offset_depth - depths[0]).max(MIN_DEPTH_SPAN);

        Ok(forest)
    }

    /// Mean isolation depth of a point across all trees.
    fn mean_depth(&self, x: &FeatureVector) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_depth(x)).sum();
        total / self.trees.len() as f64
    }

    /// Score one sample. Deterministic for identical model state and input.
    pub fn score(&self, x: &FeatureVector) -> Score {
        let depth = self.mean_depth(x);
        let raw_score = ((depth - self.offset_depth) / self.depth_span).clamp(-1.0, 1.0);
        Score {
            raw_score,
            is_anomaly: raw_score < 0.0,
        }
    }

    /// Timestamp of the fit that produced this model.
    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Size of the training window used by the fit.
    pub fn sample_count_at_fit(&self) -> usize {
        self.sample_count_at_fit
    }
}

/// Indices of features with any spread across the dataset.
fn varying_features(data: &[FeatureVector]) -> Vec<usize> {
    let mut result = Vec::new();
    for f in 0..FEATURE_COUNT {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for row in data {
            min = min.min(row[f]);
            max = max.max(row[f]);
        }
        if max > min {
            result.push(f);
        }
    }
    result
}

fn build_node(
    data: &[FeatureVector],
    rows: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if rows.len() <= 1 || depth >= height_limit {
        return Node::Leaf { size: rows.len() };
    }

    // Split features with spread inside this partition only.
    let mut candidates: Vec<(usize, f64, f64)> = Vec::new();
    for f in 0..FEATURE_COUNT {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &row in &rows {
            min = min.min(data[row][f]);
            max = max.max(data[row][f]);
        }
        if max > min {
            candidates.push((f, min, max));
        }
    }
    if candidates.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.into_iter().partition(|&row| data[row][feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_node(data, left_rows, depth + 1, height_limit, rng)),
        right: Box::new(build_node(data, right_rows, depth + 1, height_limit, rng)),
    }
}

/// Expected path length of an unsuccessful BST search over `n` points,
/// used to adjust for unexpanded subtrees at the depth limit.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
