//! Anomaly detection pipeline - main entry
//!
//! Runs one in-memory batch through enrichment, normalization, scoring and
//! attribution, publishing stage events along the way.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anomaly_detection::{
    config::AnomalyDetectionConfig,
    errors::{AnomalyDetectionError, Result},
    events::{EventBus, PipelineEvent},
    explain::{AttributionEngine, AttributionReport},
    features::{EnrichedRecord, Feature, FeatureExtractor, FeatureSchema},
    model::{self, AnomalyVerdict, IsolationForest, Label},
    normalize::{FeatureNormalizer, NormalizationParameters},
    record::TransactionRecord,
};

/// Pipeline stage; a run moves through them strictly in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Empty,
    Enriched,
    Normalized,
    Scored,
    Explained,
}

impl PipelineStage {
    /// The only stage reachable from this one
    pub fn next(self) -> Option<Self> {
        match self {
            PipelineStage::Empty => Some(PipelineStage::Enriched),
            PipelineStage::Enriched => Some(PipelineStage::Normalized),
            PipelineStage::Normalized => Some(PipelineStage::Scored),
            PipelineStage::Scored => Some(PipelineStage::Explained),
            PipelineStage::Explained => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::Empty => "empty",
            PipelineStage::Enriched => "enriched",
            PipelineStage::Normalized => "normalized",
            PipelineStage::Scored => "scored",
            PipelineStage::Explained => "explained",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current position in the stage sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineState {
    stage: PipelineStage,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            stage: PipelineStage::Empty,
        }
    }
}

impl PipelineState {
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Check that `to` directly follows the current stage
    pub fn check(&self, to: PipelineStage) -> Result<()> {
        if self.stage.next() == Some(to) {
            Ok(())
        } else {
            Err(AnomalyDetectionError::InvalidTransition {
                from: self.stage,
                to,
            })
        }
    }

    pub fn advance(&mut self, to: PipelineStage) -> Result<()> {
        self.check(to)?;
        self.stage = to;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.stage = PipelineStage::Empty;
    }
}

/// Per-record export row: enriched fields, denormalized features, outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    pub record: EnrichedRecord,
    /// Feature values reconstructed from the normalized matrix, schema order
    pub features: Vec<f64>,
    pub score: f64,
    pub label: Label,
}

/// Batch-level summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total_records: usize,
    pub anomalies: usize,
    pub degraded_records: usize,
    pub degenerate_features: Vec<Feature>,
    pub top_feature: Option<Feature>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} anomalous, {} degraded",
            self.total_records, self.anomalies, self.degraded_records
        )?;
        if !self.degenerate_features.is_empty() {
            let names: Vec<&str> = self.degenerate_features.iter().map(|f| f.name()).collect();
            write!(f, ", degenerate features: {}", names.join(", "))?;
        }
        if let Some(top) = self.top_feature {
            write!(f, ", top feature: {top}")?;
        }
        Ok(())
    }
}

/// Everything one run produces
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub schema: FeatureSchema,
    pub verdicts: Vec<AnomalyVerdict>,
    pub attribution: AttributionReport,
    pub audit: Vec<AuditRow>,
    pub normalization: NormalizationParameters,
    pub summary: RunSummary,
}

impl PipelineReport {
    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyVerdict> {
        self.verdicts.iter().filter(|v| v.label.is_anomalous())
    }
}

/// Anomaly detection pipeline
pub struct AnomalyPipeline {
    config: AnomalyDetectionConfig,
    extractor: FeatureExtractor,
    event_bus: Arc<EventBus>,
    state: PipelineState,
}

impl AnomalyPipeline {
    /// Create a pipeline; the configuration is validated up front
    pub fn with_config(config: AnomalyDetectionConfig) -> Result<Self> {
        config.validate()?;
        let event_bus = Arc::new(EventBus::new(config.events.buffer_size));
        Ok(Self {
            config,
            extractor: FeatureExtractor::new(),
            event_bus,
            state: PipelineState::default(),
        })
    }

    pub fn new() -> Result<Self> {
        Self::with_config(AnomalyDetectionConfig::default())
    }

    /// Share an existing event bus
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &AnomalyDetectionConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn stage(&self) -> PipelineStage {
        self.state.stage()
    }

    /// Return to `Empty` so the pipeline can take another batch
    pub fn reset(&mut self) {
        self.state.reset();
    }

    fn enter(&self, stage: PipelineStage, records: usize) -> Result<Instant> {
        self.state.check(stage)?;
        self.event_bus.publish(PipelineEvent::StageStarted {
            stage,
            records,
            timestamp: Utc::now(),
        });
        Ok(Instant::now())
    }

    fn complete(&mut self, stage: PipelineStage, started: Instant) -> Result<()> {
        self.state.advance(stage)?;
        self.event_bus.publish(PipelineEvent::StageCompleted {
            stage,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn fail(&self, stage: PipelineStage, err: AnomalyDetectionError) -> AnomalyDetectionError {
        self.event_bus.publish(PipelineEvent::StageFailed {
            stage,
            error: err.to_string(),
            timestamp: Utc::now(),
        });
        err.at_stage(stage)
    }

    /// Enrich raw records and run the rest of the pipeline
    pub fn run(&mut self, records: &[TransactionRecord]) -> Result<PipelineReport> {
        let stage = PipelineStage::Enriched;
        let started = self.enter(stage, records.len())?;
        if records.is_empty() {
            return Err(self.fail(stage, AnomalyDetectionError::EmptyBatch { component: "pipeline" }));
        }

        let enriched = self.extractor.enrich_batch(records);
        if self.config.events.record_events {
            for record in enriched.iter().filter(|r| r.is_degraded()) {
                self.event_bus.publish(PipelineEvent::RecordDegraded {
                    transaction_hash: record.id.clone(),
                    issues: record.issues.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.complete(stage, started)?;

        self.run_from_enriched(enriched)
    }

    /// Run normalization, scoring and attribution on already enriched records
    pub fn run_enriched(&mut self, enriched: Vec<EnrichedRecord>) -> Result<PipelineReport> {
        let stage = PipelineStage::Enriched;
        let started = self.enter(stage, enriched.len())?;
        if enriched.is_empty() {
            return Err(self.fail(stage, AnomalyDetectionError::EmptyBatch { component: "pipeline" }));
        }
        self.complete(stage, started)?;
        self.run_from_enriched(enriched)
    }

    fn run_from_enriched(&mut self, enriched: Vec<EnrichedRecord>) -> Result<PipelineReport> {
        let schema = self.config.features.schema.clone();
        let n = enriched.len();

        // normalize
        let stage = PipelineStage::Normalized;
        let started = self.enter(stage, n)?;
        let matrix = schema.project(&enriched);
        let mut normalizer = FeatureNormalizer::new();
        let normalized = normalizer
            .fit_transform(&matrix)
            .map_err(|e| self.fail(stage, e))?;
        let params = normalizer
            .into_parameters()
            .ok_or_else(|| self.fail(stage, AnomalyDetectionError::NotFitted("normalizer")))?;
        for (i, feature) in schema.features().iter().enumerate() {
            if params.is_degenerate(i) {
                self.event_bus.publish(PipelineEvent::DegenerateFeature {
                    feature: *feature,
                    value: params.mean[i],
                    timestamp: Utc::now(),
                });
            }
        }
        self.complete(stage, started)?;

        // fit, score, label
        let stage = PipelineStage::Scored;
        let started = self.enter(stage, n)?;
        let mut forest = IsolationForest::from_config(&self.config.model);
        forest.fit(&normalized).map_err(|e| self.fail(stage, e))?;
        let scores = forest
            .score_batch(&normalized)
            .map_err(|e| self.fail(stage, e))?;
        let labels = model::label(&scores, self.config.model.contamination)
            .map_err(|e| self.fail(stage, e))?;
        self.complete(stage, started)?;

        // explain
        let stage = PipelineStage::Explained;
        let started = self.enter(stage, n)?;
        let attribution = AttributionEngine::from_config(&self.config.attribution)
            .explain(&forest, &normalized)
            .map_err(|e| self.fail(stage, e))?;
        let restored = params
            .inverse_transform(&normalized)
            .map_err(|e| self.fail(stage, e))?;
        self.complete(stage, started)?;

        let verdicts: Vec<AnomalyVerdict> = enriched
            .iter()
            .zip(scores.iter().zip(&labels))
            .map(|(record, (&score, &label))| AnomalyVerdict {
                id: record.id.clone(),
                label,
                score,
            })
            .collect();

        let summary = RunSummary {
            total_records: n,
            anomalies: labels.iter().filter(|l| l.is_anomalous()).count(),
            degraded_records: enriched.iter().filter(|r| r.is_degraded()).count(),
            degenerate_features: params.degenerate.clone(),
            top_feature: attribution.top().map(|t| t.variable),
        };
        if summary.degraded_records > 0 {
            warn!(degraded = summary.degraded_records, "batch contained degraded records");
        }
        info!(%summary, "pipeline run complete");

        let audit = enriched
            .into_iter()
            .zip(restored.rows)
            .zip(scores.into_iter().zip(labels))
            .map(|((record, features), (score, label))| AuditRow {
                record,
                features: features.0,
                score,
                label,
            })
            .collect();

        Ok(PipelineReport {
            schema,
            verdicts,
            attribution,
            audit,
            normalization: params,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly_detection::events::StatisticsSubscriber;
    use crate::anomaly_detection::record::Contribution;

    fn batch() -> Vec<TransactionRecord> {
        let mut records: Vec<TransactionRecord> = (0..30)
            .map(|i| {
                TransactionRecord::new(format!("tx{i}"))
                    .with_time("2024-03-01 10:00:00")
                    .with_input(Contribution::new(1.0 + (i % 4) as f64 * 0.1, format!("s{i}")))
                    .with_output(Contribution::new(0.9, format!("r{i}")))
            })
            .collect();
        let mut fan_in = TransactionRecord::new("fan-in");
        for k in 0..40 {
            fan_in = fan_in.with_input(Contribution::new(0.05, format!("f{k}")));
        }
        records.push(fan_in.with_output(Contribution::new(1.9, "sink")));
        records
    }

    fn seeded_config(contamination: f64) -> AnomalyDetectionConfig {
        let mut config = AnomalyDetectionConfig::default();
        config.model.contamination = contamination;
        config.model.seed = Some(42);
        config.model.n_estimators = 50;
        config
    }

    #[test]
    fn test_stage_sequence() {
        let mut state = PipelineState::default();
        assert!(state.advance(PipelineStage::Normalized).is_err());
        for stage in [
            PipelineStage::Enriched,
            PipelineStage::Normalized,
            PipelineStage::Scored,
            PipelineStage::Explained,
        ] {
            state.advance(stage).unwrap();
        }
        let err = state.advance(PipelineStage::Enriched).unwrap_err();
        assert!(matches!(
            err,
            AnomalyDetectionError::InvalidTransition {
                from: PipelineStage::Explained,
                to: PipelineStage::Enriched
            }
        ));
    }

    #[test]
    fn test_run_flags_fan_in() {
        let mut pipeline = AnomalyPipeline::with_config(seeded_config(0.04)).unwrap();
        let report = pipeline.run(&batch()).unwrap();

        assert_eq!(pipeline.stage(), PipelineStage::Explained);
        assert_eq!(report.summary.total_records, 31);
        // round(0.04 * 31) = 1
        assert_eq!(report.summary.anomalies, 1);
        let flagged: Vec<_> = report.anomalies().map(|v| v.id.as_str()).collect();
        assert_eq!(flagged, vec!["fan-in"]);
        assert_eq!(report.audit.len(), 31);
        assert_eq!(report.attribution.importances.len(), 9);
    }

    #[test]
    fn test_audit_features_are_denormalized() {
        let mut pipeline = AnomalyPipeline::with_config(seeded_config(0.04)).unwrap();
        let report = pipeline.run(&batch()).unwrap();
        let indegree = report.schema.position(Feature::Indegree).unwrap();
        let row = report.audit.iter().find(|r| r.record.id == "fan-in").unwrap();
        assert!((row.features[indegree] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_features_reported() {
        let mut pipeline = AnomalyPipeline::with_config(seeded_config(0.04)).unwrap();
        let report = pipeline.run(&batch()).unwrap();
        // every record has a single output
        assert!(report.summary.degenerate_features.contains(&Feature::Outdegree));
    }

    #[test]
    fn test_second_run_requires_reset() {
        let mut pipeline = AnomalyPipeline::with_config(seeded_config(0.04)).unwrap();
        pipeline.run(&batch()).unwrap();

        let err = pipeline.run(&batch()).unwrap_err();
        assert!(matches!(err, AnomalyDetectionError::InvalidTransition { .. }));

        pipeline.reset();
        assert!(pipeline.run(&batch()).is_ok());
    }

    #[test]
    fn test_empty_batch_fails_at_enrichment() {
        let mut pipeline = AnomalyPipeline::new().unwrap();
        let stats = Arc::new(StatisticsSubscriber::new("stats"));
        pipeline.event_bus().subscribe(stats.clone());

        let err = pipeline.run(&[]).unwrap_err();
        assert_eq!(err.stage(), Some(PipelineStage::Enriched));
        assert!(err.is_fatal());
        assert_eq!(pipeline.stage(), PipelineStage::Empty);
        assert_eq!(stats.get_statistics().stages_failed, 1);
    }

    #[test]
    fn test_events_published() {
        let mut pipeline = AnomalyPipeline::with_config(seeded_config(0.04)).unwrap();
        let stats = Arc::new(StatisticsSubscriber::new("stats"));
        pipeline.event_bus().subscribe(stats.clone());

        let mut records = batch();
        records.push(TransactionRecord::new("bad-time").with_time("not a time"));
        pipeline.run(&records).unwrap();

        let stats = stats.get_statistics();
        assert_eq!(stats.stages_completed, 4);
        assert_eq!(stats.degraded_records, 1);
        assert_eq!(stats.invalid_timestamps, 1);
        assert!(stats.degenerate_features >= 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AnomalyDetectionConfig::default();
        config.model.contamination = 0.0;
        assert!(AnomalyPipeline::with_config(config).is_err());
    }
}
