//! Anomaly detection error types
//!
//! One error enum for the whole pipeline. Record-level problems never show up
//! here: they degrade the record and are reported as `RecordIssue`s instead.

use thiserror::Error;

use crate::anomaly_detection::detector::PipelineStage;

/// Anomaly detection error type
#[derive(Debug, Error)]
pub enum AnomalyDetectionError {
    /// Fitting the normalizer or the forest on zero records
    #[error("Empty batch: cannot fit {component} on zero records")]
    EmptyBatch { component: &'static str },

    /// A vector or matrix whose schema disagrees with the fitted one
    #[error("Schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    /// Unknown feature name in a schema declaration
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    /// Operation requires a fitted model
    #[error("Model not fitted: {0}")]
    NotFitted(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Pipeline moved out of order
    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: PipelineStage, to: PipelineStage },

    /// A pipeline stage failed; wraps the underlying cause
    #[error("Stage {stage} failed: {source}")]
    StageFailed {
        stage: PipelineStage,
        #[source]
        source: Box<AnomalyDetectionError>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Export error
    #[error("Export error: {0}")]
    Export(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anomaly detection result type
pub type Result<T> = std::result::Result<T, AnomalyDetectionError>;

impl AnomalyDetectionError {
    /// Build a schema mismatch error from two displayable schemas
    pub fn schema_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Self::SchemaMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Attach the failing stage to an error (idempotent)
    pub fn at_stage(self, stage: PipelineStage) -> Self {
        match self {
            already @ Self::StageFailed { .. } => already,
            other => Self::StageFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage at which the run aborted, if known
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost cause, unwrapping stage context
    pub fn root_cause(&self) -> &AnomalyDetectionError {
        match self {
            Self::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the error aborts a batch run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::EmptyBatch { .. }
                | Self::SchemaMismatch { .. }
                | Self::NotFitted(_)
                | Self::InvalidTransition { .. }
        )
    }

    /// Whether the caller can fix the input/config and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::UnknownFeature(_) | Self::Configuration(_) | Self::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for AnomalyDetectionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<csv::Error> for AnomalyDetectionError {
    fn from(err: csv::Error) -> Self {
        Self::Export(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnomalyDetectionError::EmptyBatch { component: "normalizer" };
        assert_eq!(
            err.to_string(),
            "Empty batch: cannot fit normalizer on zero records"
        );
    }

    #[test]
    fn test_stage_context() {
        let err = AnomalyDetectionError::schema_mismatch("[a, b]", "[a]")
            .at_stage(PipelineStage::Scored);
        assert_eq!(err.stage(), Some(PipelineStage::Scored));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Schema mismatch"));

        // wrapping twice keeps the first stage
        let err = err.at_stage(PipelineStage::Explained);
        assert_eq!(err.stage(), Some(PipelineStage::Scored));
    }

    #[test]
    fn test_error_is_recoverable() {
        let recoverable = AnomalyDetectionError::UnknownFeature("volume".to_string());
        assert!(recoverable.is_recoverable());
        assert!(!recoverable.is_fatal());

        let fatal = AnomalyDetectionError::EmptyBatch { component: "forest" };
        assert!(!fatal.is_recoverable());
        assert!(fatal.is_fatal());
    }
}
