//! A small from-scratch isolation forest.
//!
//! No ML crate in the dependency stack offers isolation forests without
//! pulling in a BLAS/ndarray toolchain far heavier than this detector needs,
//! so the ensemble's isolation-style method is implemented directly: points
//! that separate from the rest of the training sample in few random splits
//! score as anomalous.

use rand::Rng;

const DEFAULT_TREES: usize = 64;
const DEFAULT_SUBSAMPLE: usize = 256;

enum Node {
    Leaf { size: usize },
    Split { feature: usize, value: f64, left: Box<Node>, right: Box<Node> },
}

/// Average path length of an unsuccessful BST search with `n` items —
/// the standard isolation-forest normalization constant.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.5772156649015329) - 2.0 * (n - 1.0) / n
}

fn build_node(samples: &[&[f64]], depth: u32, max_depth: u32, rng: &mut impl Rng) -> Node {
    if samples.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: samples.len() };
    }
    let features = samples[0].len();
    if features == 0 {
        return Node::Leaf { size: samples.len() };
    }
    let feature = rng.random_range(0..features);
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for sample in samples {
        let v = sample[feature];
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !(lo < hi) {
        return Node::Leaf { size: samples.len() };
    }
    let split = rng.random_range(lo..hi);
    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
        samples.iter().partition(|s| s[feature] < split);
    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: samples.len() };
    }
    Node::Split {
        feature,
        value: split,
        left: Box::new(build_node(&left, depth + 1, max_depth, rng)),
        right: Box::new(build_node(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &[f64], depth: u32) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { feature, value, left, right } => {
            if point[*feature] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Ensemble of isolation trees trained on a sample of feature vectors.
pub struct IsolationForest {
    trees: Vec<Node>,
    subsample_size: usize,
}

impl IsolationForest {
    /// Trains a forest on `samples`, each a fixed-length feature vector.
    /// Returns `None` if there isn't enough data to build a meaningful tree.
    pub fn train(samples: &[Vec<f64>], rng: &mut impl Rng) -> Option<Self> {
        if samples.len() < 8 {
            return None;
        }
        let subsample_size = samples.len().min(DEFAULT_SUBSAMPLE);
        let max_depth = (subsample_size as f64).log2().ceil() as u32 + 1;
        let refs: Vec<&[f64]> = samples.iter().map(|s| s.as_slice()).collect();

        let mut trees = Vec::with_capacity(DEFAULT_TREES);
        for _ in 0..DEFAULT_TREES {
            let subsample: Vec<&[f64]> = (0..subsample_size)
                .map(|_| refs[rng.random_range(0..refs.len())])
                .collect();
            trees.push(build_node(&subsample, 0, max_depth, rng));
        }
        Some(Self { trees, subsample_size })
    }

    /// Anomaly score in `[0, 1]`; values near 1 indicate strong isolation
    /// (few splits needed to separate the point), i.e. likely anomalous.
    pub fn score(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let avg_path = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.subsample_size);
        if c <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg_path / c).clamp(0.0, 1.0)
    }
}
