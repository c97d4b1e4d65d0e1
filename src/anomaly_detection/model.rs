//! Isolation forest anomaly model
//!
//! Anomalies are isolated by fewer random axis-aligned splits than normal
//! points, so a short average path length across the ensemble means a high
//! score. Trees are independent and built in parallel; each one is seeded
//! from a per-tree seed drawn up front, so a seeded fit is reproducible no
//! matter how rayon schedules the work.
//!
//! Liu, Ting & Zhou (2008), "Isolation Forest", ICDM.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use super::config::ModelConfig;
use super::errors::{AnomalyDetectionError, Result};
use super::features::{FeatureMatrix, FeatureSchema, FeatureVector};

pub const DEFAULT_N_ESTIMATORS: usize = 100;
pub const DEFAULT_MAX_SAMPLES: usize = 256;
pub const DEFAULT_CONTAMINATION: f64 = 0.01;
/// Upper bound on the contamination rate (inclusive)
pub const MAX_CONTAMINATION: f64 = 0.5;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Expected path length of an unsuccessful BST search over `n` points,
/// `c(n) = 2 H(n-1) - 2 (n-1) / n`
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n1 = (n - 1) as f64;
            2.0 * (n1.ln() + EULER_GAMMA) - 2.0 * n1 / n as f64
        }
    }
}

/// `2^(-mean_path / c)`; a single-point ensemble (c = 0) scores neutral 0.5
pub fn score_from_path_length(mean_path: f64, normalizer: f64) -> f64 {
    if normalizer <= 0.0 {
        return 0.5;
    }
    2f64.powf(-mean_path / normalizer)
}

/// Node of an isolation tree; `size` is the number of training points
/// that reached it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IsolationNode {
    Split {
        feature: usize,
        threshold: f64,
        size: usize,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

impl IsolationNode {
    pub fn size(&self) -> usize {
        match self {
            IsolationNode::Split { size, .. } | IsolationNode::Leaf { size } => *size,
        }
    }

    fn path_length(&self, x: &[f64], depth: usize) -> f64 {
        match self {
            IsolationNode::Split {
                feature,
                threshold,
                left,
                right,
                ..
            } => {
                if x[*feature] < *threshold {
                    left.path_length(x, depth + 1)
                } else {
                    right.path_length(x, depth + 1)
                }
            }
            IsolationNode::Leaf { size } => depth as f64 + average_path_length(*size),
        }
    }

    /// Path length when only the features flagged in `known` are observed;
    /// splits on unknown features average both children by training cover
    fn conditional_path_length(&self, x: &[f64], known: &[bool], depth: usize) -> f64 {
        match self {
            IsolationNode::Split {
                feature,
                threshold,
                size,
                left,
                right,
            } => {
                if known[*feature] {
                    if x[*feature] < *threshold {
                        left.conditional_path_length(x, known, depth + 1)
                    } else {
                        right.conditional_path_length(x, known, depth + 1)
                    }
                } else {
                    let l = left.conditional_path_length(x, known, depth + 1);
                    let r = right.conditional_path_length(x, known, depth + 1);
                    (left.size() as f64 * l + right.size() as f64 * r) / *size as f64
                }
            }
            IsolationNode::Leaf { size } => depth as f64 + average_path_length(*size),
        }
    }

    /// Collect, per leaf, the expected path term for every pattern of known
    /// features among those split on along the path.
    ///
    /// `terms` is keyed by the bitmask of path features; entry `sub` of the
    /// table holds the term when exactly the path features selected by `sub`
    /// (in ascending feature order) are known. A leaf's term for any coalition
    /// depends only on its path features, so the full `2^width` table is
    /// expanded once per record instead of once per node.
    fn collect_leaf_terms(
        &self,
        x: &[f64],
        depth: usize,
        path: &mut Vec<PathStep>,
        terms: &mut BTreeMap<usize, Vec<f64>>,
    ) {
        match self {
            IsolationNode::Split {
                feature,
                threshold,
                size,
                left,
                right,
            } => {
                let goes_left = x[*feature] < *threshold;
                for (is_left, child) in [(true, left), (false, right)] {
                    path.push(PathStep {
                        feature: *feature,
                        followed: is_left == goes_left,
                        cover: child.size() as f64 / *size as f64,
                    });
                    child.collect_leaf_terms(x, depth + 1, path, terms);
                    path.pop();
                }
            }
            IsolationNode::Leaf { size } => {
                let length = depth as f64 + average_path_length(*size);
                let key = path.iter().fold(0usize, |key, step| key | 1 << step.feature);
                let features = bit_positions(key);
                let table = terms
                    .entry(key)
                    .or_insert_with(|| vec![0.0; 1 << features.len()]);

                for (sub, slot) in table.iter_mut().enumerate() {
                    let mut reach = 1.0;
                    for step in path.iter() {
                        let local = features.partition_point(|&f| f < step.feature);
                        reach *= if sub & (1 << local) != 0 {
                            if step.followed {
                                1.0
                            } else {
                                0.0
                            }
                        } else {
                            step.cover
                        };
                        if reach == 0.0 {
                            break;
                        }
                    }
                    *slot += reach * length;
                }
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            IsolationNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
            IsolationNode::Leaf { .. } => 0,
        }
    }
}

/// One split on the way from the root to a leaf
#[derive(Debug, Clone, Copy)]
struct PathStep {
    feature: usize,
    /// The record itself takes this branch
    followed: bool,
    /// Share of the parent's training points on this branch
    cover: f64,
}

/// Ascending positions of the set bits of `mask`
fn bit_positions(mask: usize) -> Vec<usize> {
    (0..usize::BITS as usize).filter(|&b| mask & (1 << b) != 0).collect()
}

/// Add every leaf-term table into the full per-coalition vector
fn expand_leaf_terms(terms: &BTreeMap<usize, Vec<f64>>, n_subsets: usize) -> Vec<f64> {
    let mut total = vec![0.0; n_subsets];
    for (&key, table) in terms {
        let features = bit_positions(key);
        for (mask, acc) in total.iter_mut().enumerate() {
            let sub = features
                .iter()
                .enumerate()
                .filter(|&(_, &f)| mask & (1 << f) != 0)
                .fold(0usize, |sub, (local, _)| sub | 1 << local);
            *acc += table[sub];
        }
    }
    total
}

/// Single isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    /// Build a tree on a subsample of `rows` drawn without replacement
    fn build(rows: &[FeatureVector], subsample: usize, max_depth: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let indices = rand::seq::index::sample(&mut rng, rows.len(), subsample).into_vec();
        let root = Self::build_node(rows, indices, 0, max_depth, &mut rng);
        IsolationTree { root }
    }

    fn build_node(
        rows: &[FeatureVector],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> IsolationNode {
        let size = indices.len();
        if depth >= max_depth || size <= 1 {
            return IsolationNode::Leaf { size };
        }

        // (feature, min, max) for every feature that still varies in the node
        let width = rows[indices[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..width)
            .filter_map(|f| {
                let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                    let v = rows[i].0[f];
                    (lo.min(v), hi.max(v))
                });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();

        if candidates.is_empty() {
            return IsolationNode::Leaf { size };
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);

        let (left, right): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&i| rows[i].0[feature] < threshold);

        // threshold landed exactly on the minimum
        if left.is_empty() || right.is_empty() {
            return IsolationNode::Leaf { size };
        }

        IsolationNode::Split {
            feature,
            threshold,
            size,
            left: Box::new(Self::build_node(rows, left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(rows, right, depth + 1, max_depth, rng)),
        }
    }

    pub fn root(&self) -> &IsolationNode {
        &self.root
    }

    pub fn path_length(&self, x: &[f64]) -> f64 {
        self.root.path_length(x, 0)
    }

    pub fn conditional_path_length(&self, x: &[f64], known: &[bool]) -> f64 {
        self.root.conditional_path_length(x, known, 0)
    }

    /// Conditional path length for every subset of known features, indexed
    /// by bitmask over the feature positions
    pub fn subset_path_lengths(&self, x: &[f64]) -> Vec<f64> {
        let mut terms = BTreeMap::new();
        self.root.collect_leaf_terms(x, 0, &mut Vec::new(), &mut terms);
        expand_leaf_terms(&terms, 1 << x.len())
    }

    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

/// Isolation forest over normalized feature vectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    n_estimators: usize,
    max_samples: usize,
    seed: Option<u64>,
    schema: Option<FeatureSchema>,
    subsample_size: usize,
    trees: Vec<IsolationTree>,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(DEFAULT_N_ESTIMATORS, DEFAULT_MAX_SAMPLES)
    }
}

impl IsolationForest {
    pub fn new(n_estimators: usize, max_samples: usize) -> Self {
        Self {
            n_estimators,
            max_samples,
            seed: None,
            schema: None,
            subsample_size: 0,
            trees: Vec::new(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.n_estimators, config.max_samples).with_seed(config.seed)
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Fit the ensemble on a (normalized) matrix
    pub fn fit(&mut self, matrix: &FeatureMatrix) -> Result<()> {
        if matrix.is_empty() {
            return Err(AnomalyDetectionError::EmptyBatch { component: "forest" });
        }
        if self.n_estimators == 0 || self.max_samples == 0 {
            return Err(AnomalyDetectionError::Configuration(
                "n_estimators and max_samples must be greater than 0".to_string(),
            ));
        }

        // rows are public, so a matrix may bypass `FeatureMatrix::new`
        if let Some(row) = matrix.rows.iter().find(|r| r.len() != matrix.width()) {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} values {}", matrix.width(), matrix.schema),
                format!("{} values", row.len()),
            ));
        }

        let subsample = self.max_samples.min(matrix.len());
        let max_depth = (subsample as f64).log2().ceil() as usize;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let tree_seeds: Vec<u64> = (0..self.n_estimators).map(|_| rng.gen()).collect();

        let rows = &matrix.rows;
        let trees: Vec<IsolationTree> = tree_seeds
            .par_iter()
            .map(|&seed| IsolationTree::build(rows, subsample, max_depth, seed))
            .collect();

        debug!(
            deepest = trees.iter().map(IsolationTree::depth).max().unwrap_or(0),
            max_depth,
            "isolation trees built"
        );
        info!(
            trees = trees.len(),
            subsample,
            rows = matrix.len(),
            "isolation forest fitted"
        );

        self.schema = Some(matrix.schema.clone());
        self.subsample_size = subsample;
        self.trees = trees;
        Ok(())
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn trees(&self) -> &[IsolationTree] {
        &self.trees
    }

    pub fn schema(&self) -> Result<&FeatureSchema> {
        self.schema
            .as_ref()
            .ok_or(AnomalyDetectionError::NotFitted("isolation forest"))
    }

    /// `c(subsample)`, the path length that maps to score 0.5
    pub fn normalizer(&self) -> f64 {
        average_path_length(self.subsample_size)
    }

    pub(crate) fn check_vector(&self, x: &[f64]) -> Result<()> {
        let schema = self.schema()?;
        if x.len() != schema.len() {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} values {schema}", schema.len()),
                format!("{} values", x.len()),
            ));
        }
        Ok(())
    }

    pub fn mean_path_length(&self, x: &[f64]) -> Result<f64> {
        self.check_vector(x)?;
        let total: f64 = self.trees.iter().map(|t| t.path_length(x)).sum();
        Ok(total / self.trees.len() as f64)
    }

    /// Mean over trees of the path length with only `known` features observed
    pub fn conditional_path_length(&self, x: &[f64], known: &[bool]) -> Result<f64> {
        self.check_vector(x)?;
        if known.len() != x.len() {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} known flags", x.len()),
                format!("{} known flags", known.len()),
            ));
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|t| t.conditional_path_length(x, known))
            .sum();
        Ok(total / self.trees.len() as f64)
    }

    /// Mean conditional path length for all `2^width` subsets of known
    /// features; bit `i` of the index marks feature `i` as known
    pub fn subset_path_lengths(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.check_vector(x)?;
        if x.len() >= usize::BITS as usize - 1 {
            return Err(AnomalyDetectionError::InvalidInput(format!(
                "{} features is too many for subset enumeration",
                x.len()
            )));
        }
        // leaves sharing a set of path features merge across trees
        let mut terms = BTreeMap::new();
        let mut path = Vec::new();
        for tree in &self.trees {
            tree.root.collect_leaf_terms(x, 0, &mut path, &mut terms);
        }
        let n_trees = self.trees.len() as f64;
        Ok(expand_leaf_terms(&terms, 1 << x.len())
            .into_iter()
            .map(|t| t / n_trees)
            .collect())
    }

    /// Anomaly score in (0, 1]; higher is more anomalous
    pub fn score(&self, x: &[f64]) -> Result<f64> {
        let mean = self.mean_path_length(x)?;
        Ok(score_from_path_length(mean, self.normalizer()))
    }

    /// Score every row in parallel; the matrix schema must match the fitted one
    pub fn score_batch(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        let schema = self.schema()?;
        if &matrix.schema != schema {
            return Err(AnomalyDetectionError::schema_mismatch(schema, &matrix.schema));
        }
        matrix
            .rows
            .par_iter()
            .map(|row| self.score(row.values()))
            .collect()
    }
}

/// Binary anomaly label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Normal,
    Anomalous,
}

impl Label {
    /// `1` for anomalous, `0` for normal
    pub fn as_flag(self) -> u8 {
        match self {
            Label::Normal => 0,
            Label::Anomalous => 1,
        }
    }

    pub fn is_anomalous(self) -> bool {
        self == Label::Anomalous
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Normal => write!(f, "normal"),
            Label::Anomalous => write!(f, "anomalous"),
        }
    }
}

/// Per-record detection outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    #[serde(rename = "hash_transaction")]
    pub id: String,
    pub label: Label,
    pub score: f64,
}

/// Check a contamination rate lies in `(0, 0.5]`
pub fn validate_contamination(contamination: f64) -> Result<()> {
    if !(contamination > 0.0 && contamination <= MAX_CONTAMINATION) {
        return Err(AnomalyDetectionError::Configuration(format!(
            "contamination must be in (0, {MAX_CONTAMINATION}], got {contamination}"
        )));
    }
    Ok(())
}

/// Label exactly `round(contamination * N)` records anomalous: the highest
/// scores, ties broken by record order
pub fn label(scores: &[f64], contamination: f64) -> Result<Vec<Label>> {
    validate_contamination(contamination)?;

    let n_anomalous = (contamination * scores.len() as f64).round() as usize;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

    let mut labels = vec![Label::Normal; scores.len()];
    for &i in order.iter().take(n_anomalous) {
        labels[i] = Label::Anomalous;
    }
    debug!(n_anomalous, total = scores.len(), contamination, "labels assigned");
    Ok(labels)
}
