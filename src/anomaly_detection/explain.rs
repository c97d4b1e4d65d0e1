//! Shapley attribution of isolation forest scores
//!
//! The value of a coalition `S` of features is the score the forest would
//! give when only the features in `S` are observed: splits on observed
//! features follow the record, splits on the others average both children
//! weighted by training cover. `v(all)` is the record's score and `v(∅)` is
//! a baseline shared by every record, so the contributions of one record
//! always add up to `score - baseline`.
//!
//! Small schemas are attributed exactly by enumerating every coalition.
//! Wider schemas fall back to averaging marginal contributions over sampled
//! feature orderings; each ordering telescopes from `v(∅)` to `v(all)`, so
//! the sum stays exact there as well.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::AttributionConfig;
use super::errors::{AnomalyDetectionError, Result};
use super::features::{Feature, FeatureMatrix, FeatureSchema};
use super::model::{score_from_path_length, IsolationForest};

/// Per-record decomposition of the score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAttribution {
    pub score: f64,
    pub baseline: f64,
    /// One value per schema feature, in schema order
    pub contributions: Vec<f64>,
}

impl RecordAttribution {
    /// `baseline + Σ contributions`; equals `score` up to rounding
    pub fn reconstructed_score(&self) -> f64 {
        self.baseline + self.contributions.iter().sum::<f64>()
    }
}

/// Global importance of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub variable: Feature,
    pub value: f64,
}

/// Global attribution over a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub schema: FeatureSchema,
    pub baseline: f64,
    /// Mean absolute contribution per feature, in schema order
    pub importances: Vec<FeatureImportance>,
    #[serde(skip)]
    pub records: Vec<RecordAttribution>,
}

impl AttributionReport {
    /// Importances sorted by value descending; ties keep schema order
    pub fn ranked(&self) -> Vec<FeatureImportance> {
        let mut ranked = self.importances.clone();
        ranked.sort_by(|a, b| b.value.total_cmp(&a.value));
        ranked
    }

    pub fn top(&self) -> Option<FeatureImportance> {
        self.ranked().into_iter().next()
    }

    pub fn importance(&self, feature: Feature) -> Option<f64> {
        self.importances
            .iter()
            .find(|i| i.variable == feature)
            .map(|i| i.value)
    }
}

/// Attribution engine; read-only with respect to the forest
#[derive(Debug, Clone)]
pub struct AttributionEngine {
    max_exact_features: usize,
    permutations: usize,
    seed: Option<u64>,
}

impl Default for AttributionEngine {
    fn default() -> Self {
        Self::from_config(&AttributionConfig::default())
    }
}

impl AttributionEngine {
    pub fn from_config(config: &AttributionConfig) -> Self {
        Self {
            max_exact_features: config.max_exact_features,
            permutations: config.permutations,
            seed: config.seed,
        }
    }

    fn is_exact(&self, width: usize) -> bool {
        width <= self.max_exact_features
    }

    /// Decompose the score of one normalized vector
    pub fn explain_record(
        &self,
        forest: &IsolationForest,
        x: &[f64],
        index: usize,
    ) -> Result<RecordAttribution> {
        if self.is_exact(x.len()) {
            exact_shapley(forest, x)
        } else {
            sampled_shapley(forest, x, self.permutations, self.seed, index)
        }
    }

    /// Explain every record of `matrix` in parallel and aggregate importances
    pub fn explain(
        &self,
        forest: &IsolationForest,
        matrix: &FeatureMatrix,
    ) -> Result<AttributionReport> {
        if matrix.is_empty() {
            return Err(AnomalyDetectionError::EmptyBatch {
                component: "attribution",
            });
        }
        let schema = forest.schema()?;
        if &matrix.schema != schema {
            return Err(AnomalyDetectionError::schema_mismatch(schema, &matrix.schema));
        }
        if !self.is_exact(matrix.width()) && self.permutations == 0 {
            return Err(AnomalyDetectionError::Configuration(
                "attribution permutations must be greater than 0".to_string(),
            ));
        }

        debug!(
            exact = self.is_exact(matrix.width()),
            features = matrix.width(),
            "explaining records"
        );

        let records = matrix
            .rows
            .par_iter()
            .enumerate()
            .map(|(i, row)| self.explain_record(forest, row.values(), i))
            .collect::<Result<Vec<_>>>()?;

        let n = records.len() as f64;
        let importances = schema
            .features()
            .iter()
            .enumerate()
            .map(|(i, &feature)| FeatureImportance {
                variable: feature,
                value: records.iter().map(|r| r.contributions[i].abs()).sum::<f64>() / n,
            })
            .collect();

        let report = AttributionReport {
            schema: schema.clone(),
            baseline: records[0].baseline,
            importances,
            records,
        };
        if let Some(top) = report.top() {
            info!(feature = %top.variable, importance = top.value, "attribution complete");
        }
        Ok(report)
    }
}

/// `s! (m - s - 1)! / m!` for every coalition size `s < m`
fn shapley_weights(m: usize) -> Vec<f64> {
    let mut factorial = vec![1.0f64; m + 1];
    for k in 1..=m {
        factorial[k] = factorial[k - 1] * k as f64;
    }
    (0..m)
        .map(|s| factorial[s] * factorial[m - s - 1] / factorial[m])
        .collect()
}

fn exact_shapley(forest: &IsolationForest, x: &[f64]) -> Result<RecordAttribution> {
    let m = x.len();
    let c = forest.normalizer();
    let values: Vec<f64> = forest
        .subset_path_lengths(x)?
        .into_iter()
        .map(|path| score_from_path_length(path, c))
        .collect();
    let weights = shapley_weights(m);

    let contributions = (0..m)
        .map(|i| {
            let bit = 1usize << i;
            (0..values.len())
                .filter(|mask| mask & bit == 0)
                .map(|mask| weights[mask.count_ones() as usize] * (values[mask | bit] - values[mask]))
                .sum::<f64>()
        })
        .collect();

    Ok(RecordAttribution {
        score: values[values.len() - 1],
        baseline: values[0],
        contributions,
    })
}

fn sampled_shapley(
    forest: &IsolationForest,
    x: &[f64],
    permutations: usize,
    seed: Option<u64>,
    index: usize,
) -> Result<RecordAttribution> {
    let m = x.len();
    let c = forest.normalizer();
    let value = |known: &[bool]| -> Result<f64> {
        Ok(score_from_path_length(forest.conditional_path_length(x, known)?, c))
    };

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
        None => StdRng::from_entropy(),
    };

    let baseline = value(&vec![false; m])?;
    let score = value(&vec![true; m])?;
    let mut contributions = vec![0.0; m];
    let mut order: Vec<usize> = (0..m).collect();

    for _ in 0..permutations {
        order.shuffle(&mut rng);
        let mut known = vec![false; m];
        let mut previous = baseline;
        for &feature in &order {
            known[feature] = true;
            let current = value(&known)?;
            contributions[feature] += current - previous;
            previous = current;
        }
    }
    for phi in &mut contributions {
        *phi /= permutations as f64;
    }

    Ok(RecordAttribution {
        score,
        baseline,
        contributions,
    })
}
