//! Anomaly detection configuration
//!
//! Defaults, file loading (JSON or TOML by extension) and environment
//! overrides. Command-line flags are layered on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::{AnomalyDetectionError, Result};
use super::features::FeatureSchema;
use super::ingest::DEFAULT_TX_PER_BLOCK;
use super::model::{
    validate_contamination, DEFAULT_CONTAMINATION, DEFAULT_MAX_SAMPLES, DEFAULT_N_ESTIMATORS,
};

/// Widest schema attributed by full coalition enumeration
pub const DEFAULT_MAX_EXACT_FEATURES: usize = 12;
/// Hard cap for exact enumeration (2^20 coalitions per record)
pub const MAX_EXACT_FEATURES_LIMIT: usize = 20;
pub const DEFAULT_PERMUTATIONS: usize = 64;

/// Anomaly detection configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyDetectionConfig {
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub attribution: AttributionConfig,
    pub output: OutputConfig,
    pub events: EventConfig,
}

/// Feature extraction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Ordered features fed to the model
    pub schema: FeatureSchema,

    /// Transactions taken from each raw block on conversion
    pub limit_per_block: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            schema: FeatureSchema::default(),
            limit_per_block: DEFAULT_TX_PER_BLOCK,
        }
    }
}

/// Isolation forest configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Expected share of anomalies, in (0, 0.5]
    pub contamination: f64,

    pub n_estimators: usize,

    /// Subsample size per tree (capped at the batch size)
    pub max_samples: usize,

    /// Seed for reproducible forests; drawn from OS entropy when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            contamination: DEFAULT_CONTAMINATION,
            n_estimators: DEFAULT_N_ESTIMATORS,
            max_samples: DEFAULT_MAX_SAMPLES,
            seed: None,
        }
    }
}

/// Attribution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Schemas up to this width are attributed exactly
    pub max_exact_features: usize,

    /// Sampled orderings per record for wider schemas
    pub permutations: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            max_exact_features: DEFAULT_MAX_EXACT_FEATURES,
            permutations: DEFAULT_PERMUTATIONS,
            seed: None,
        }
    }
}

/// Output file layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub out_dir: PathBuf,

    /// `[{hash_transaction, anomaly}]`
    pub verdicts_file: String,

    /// `[{variable, value}]`
    pub importance_file: String,

    /// Per-record audit rows
    pub audit_file: String,

    /// Where to persist normalization parameters, if anywhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization_file: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("./output"),
            verdicts_file: "result.json".to_string(),
            importance_file: "variable.json".to_string(),
            audit_file: "result.csv".to_string(),
            normalization_file: None,
        }
    }
}

/// Event configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Recent events kept in memory
    pub buffer_size: usize,

    /// Publish one event per degraded record
    pub record_events: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            record_events: true,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AnomalyDetectionError::Configuration(format!("{key}: cannot parse '{raw}'"))
    })
}

impl AnomalyDetectionConfig {
    /// Load configuration from a JSON or TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if is_toml(path) {
            toml::from_str(&content)
                .map_err(|e| AnomalyDetectionError::Configuration(e.to_string()))?
        } else {
            serde_json::from_str(&content)?
        };
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Save configuration to a JSON or TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| AnomalyDetectionError::Serialization(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `ANOMALY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `ANOMALY_*` overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ANOMALY_CONTAMINATION") {
            self.model.contamination = parse_env("ANOMALY_CONTAMINATION", &raw)?;
        }
        if let Some(raw) = lookup("ANOMALY_N_ESTIMATORS") {
            self.model.n_estimators = parse_env("ANOMALY_N_ESTIMATORS", &raw)?;
        }
        if let Some(raw) = lookup("ANOMALY_MAX_SAMPLES") {
            self.model.max_samples = parse_env("ANOMALY_MAX_SAMPLES", &raw)?;
        }
        if let Some(raw) = lookup("ANOMALY_SEED") {
            let seed = parse_env("ANOMALY_SEED", &raw)?;
            self.model.seed = Some(seed);
            self.attribution.seed = Some(seed);
        }
        if let Some(raw) = lookup("ANOMALY_FEATURES") {
            self.features.schema = FeatureSchema::parse_list(&raw)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_contamination(self.model.contamination)?;

        if self.model.n_estimators == 0 {
            return Err(AnomalyDetectionError::Configuration(
                "n_estimators must be greater than 0".to_string(),
            ));
        }
        if self.model.max_samples == 0 {
            return Err(AnomalyDetectionError::Configuration(
                "max_samples must be greater than 0".to_string(),
            ));
        }
        if self.attribution.max_exact_features > MAX_EXACT_FEATURES_LIMIT {
            return Err(AnomalyDetectionError::Configuration(format!(
                "max_exact_features must not exceed {MAX_EXACT_FEATURES_LIMIT}"
            )));
        }
        if self.attribution.permutations == 0
            && self.features.schema.len() > self.attribution.max_exact_features
        {
            return Err(AnomalyDetectionError::Configuration(
                "permutations must be greater than 0 for sampled attribution".to_string(),
            ));
        }
        if self.features.limit_per_block == 0 {
            return Err(AnomalyDetectionError::Configuration(
                "limit_per_block must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of one output file under `out_dir`
    pub fn output_path(&self, file: &str) -> PathBuf {
        self.output.out_dir.join(file)
    }
}
