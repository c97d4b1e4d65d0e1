//! Z-score normalization fitted over one batch

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::errors::{AnomalyDetectionError, Result};
use super::features::{Feature, FeatureMatrix, FeatureSchema, FeatureVector};

/// Relative tolerance below which a column's std counts as zero
const DEGENERATE_TOLERANCE: f64 = 1e-12;

/// Per-feature mean and population std fitted over a batch.
///
/// Immutable once fitted. Persisted as a JSON sidecar so a later run can
/// apply the exact same scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParameters {
    pub schema: FeatureSchema,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    /// Zero-variance features; their normalized output is always 0.0
    #[serde(default)]
    pub degenerate: Vec<Feature>,
}

impl NormalizationParameters {
    /// Fit mean and population std per column
    pub fn fit(matrix: &FeatureMatrix) -> Result<Self> {
        if matrix.is_empty() {
            return Err(AnomalyDetectionError::EmptyBatch {
                component: "normalizer",
            });
        }

        let n = matrix.len() as f64;
        let width = matrix.width();
        let mut mean = vec![0.0; width];
        let mut std = vec![0.0; width];
        let mut degenerate = Vec::new();

        for (i, feature) in matrix.schema.features().iter().enumerate() {
            let column = matrix.column(i);
            let mu = column.iter().sum::<f64>() / n;
            let variance = column.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / n;
            let sigma = variance.sqrt();

            if sigma <= DEGENERATE_TOLERANCE * mu.abs().max(1.0) {
                warn!(feature = %feature, value = mu, "zero-variance feature, normalized to 0.0");
                degenerate.push(*feature);
            }
            mean[i] = mu;
            std[i] = sigma;
        }

        debug!(
            features = width,
            rows = matrix.len(),
            degenerate = degenerate.len(),
            "fitted normalization parameters"
        );

        Ok(Self {
            schema: matrix.schema.clone(),
            mean,
            std,
            degenerate,
        })
    }

    pub fn is_degenerate(&self, index: usize) -> bool {
        self.schema
            .features()
            .get(index)
            .is_some_and(|f| self.degenerate.contains(f))
    }

    fn check_schema(&self, schema: &FeatureSchema) -> Result<()> {
        if schema != &self.schema {
            return Err(AnomalyDetectionError::schema_mismatch(&self.schema, schema));
        }
        Ok(())
    }

    fn check_width(&self, vector: &[f64]) -> Result<()> {
        if vector.len() != self.schema.len() {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} values {}", self.schema.len(), self.schema),
                format!("{} values", vector.len()),
            ));
        }
        Ok(())
    }

    /// `(x - mean) / std`; degenerate columns map to exactly 0.0
    pub fn normalize(&self, raw: &[f64]) -> Result<Vec<f64>> {
        self.check_width(raw)?;
        Ok(raw
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                if self.is_degenerate(i) {
                    0.0
                } else {
                    (x - self.mean[i]) / self.std[i]
                }
            })
            .collect())
    }

    /// Exact inverse of [`normalize`](Self::normalize); degenerate columns
    /// reconstruct to their constant
    pub fn denormalize(&self, normalized: &[f64]) -> Result<Vec<f64>> {
        self.check_width(normalized)?;
        Ok(normalized
            .iter()
            .enumerate()
            .map(|(i, &z)| {
                if self.is_degenerate(i) {
                    self.mean[i]
                } else {
                    z * self.std[i] + self.mean[i]
                }
            })
            .collect())
    }

    /// Normalize a whole matrix; the schema must match the fitted one
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.check_schema(&matrix.schema)?;
        let rows = matrix
            .rows
            .iter()
            .map(|r| self.normalize(r.values()).map(FeatureVector))
            .collect::<Result<Vec<_>>>()?;
        Ok(FeatureMatrix {
            schema: self.schema.clone(),
            rows,
        })
    }

    pub fn inverse_transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.check_schema(&matrix.schema)?;
        let rows = matrix
            .rows
            .iter()
            .map(|r| self.denormalize(r.values()).map(FeatureVector))
            .collect::<Result<Vec<_>>>()?;
        Ok(FeatureMatrix {
            schema: self.schema.clone(),
            rows,
        })
    }

    /// Load parameters from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let params: NormalizationParameters = serde_json::from_str(&data)?;
        if params.mean.len() != params.schema.len() || params.std.len() != params.schema.len() {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} mean/std values", params.schema.len()),
                format!("{}/{}", params.mean.len(), params.std.len()),
            ));
        }
        Ok(params)
    }

    /// Save parameters to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Fit-once normalizer for a single run
#[derive(Debug, Default)]
pub struct FeatureNormalizer {
    params: Option<NormalizationParameters>,
}

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizer with previously saved parameters
    pub fn with_parameters(params: NormalizationParameters) -> Self {
        Self {
            params: Some(params),
        }
    }

    /// Fit on `matrix` and return it normalized
    pub fn fit_transform(&mut self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        if self.params.is_some() {
            return Err(AnomalyDetectionError::InvalidInput(
                "normalizer already fitted for this run".to_string(),
            ));
        }
        let params = NormalizationParameters::fit(matrix)?;
        let normalized = params.transform(matrix)?;
        self.params = Some(params);
        Ok(normalized)
    }

    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.parameters()?.transform(matrix)
    }

    pub fn inverse_transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.parameters()?.inverse_transform(matrix)
    }

    pub fn parameters(&self) -> Result<&NormalizationParameters> {
        self.params
            .as_ref()
            .ok_or(AnomalyDetectionError::NotFitted("normalizer"))
    }

    pub fn into_parameters(self) -> Option<NormalizationParameters> {
        self.params
    }
}
