//! Transaction anomaly detection
//!
//! Scores a batch of ledger transactions with an isolation forest over
//! entropy-based graph features and explains each score feature by feature.
//!
//! ## Pipeline
//! - ingest: raw block/transaction payloads → `TransactionRecord`
//! - features: per-transaction enrichment and schema projection
//! - normalize: z-score scaling fitted per batch
//! - model: isolation forest scoring and contamination labeling
//! - explain: Shapley attribution and global importances
//! - detector: stage machine tying the above together
//! - storage: JSON/CSV export of the run artifacts

pub mod config;
pub mod detector;
pub mod entropy;
pub mod errors;
pub mod events;
pub mod explain;
pub mod features;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod record;
pub mod storage;

pub use config::{AnomalyDetectionConfig, AttributionConfig, FeatureConfig, ModelConfig, OutputConfig};
pub use detector::{AnomalyPipeline, AuditRow, PipelineReport, PipelineStage, RunSummary};
pub use entropy::shannon_entropy;
pub use errors::{AnomalyDetectionError, Result};
pub use events::{EventBus, EventSubscriber, LoggingSubscriber, PipelineEvent, StatisticsSubscriber};
pub use explain::{AttributionEngine, AttributionReport, FeatureImportance, RecordAttribution};
pub use features::{
    EnrichedRecord, Feature, FeatureExtractor, FeatureMatrix, FeatureSchema, FeatureVector,
    RecordIssue,
};
pub use model::{label, AnomalyVerdict, IsolationForest, Label};
pub use normalize::{FeatureNormalizer, NormalizationParameters};
pub use record::{Contribution, TransactionRecord};
pub use storage::{FileExporter, ReportExporter};
