//! Pipeline event system
//!
//! Publish/subscribe for stage progress and data-quality notices.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::anomaly_detection::detector::PipelineStage;
use crate::anomaly_detection::features::{Feature, RecordIssue};

/// Pipeline event
#[derive(Debug, Clone, Serialize)]
pub enum PipelineEvent {
    /// Stage started
    StageStarted {
        stage: PipelineStage,
        records: usize,
        timestamp: DateTime<Utc>,
    },

    /// Stage completed
    StageCompleted {
        stage: PipelineStage,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Stage failed; the run is aborted
    StageFailed {
        stage: PipelineStage,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Zero-variance feature found while fitting the normalizer
    DegenerateFeature {
        feature: Feature,
        value: f64,
        timestamp: DateTime<Utc>,
    },

    /// Record enriched with defaults
    RecordDegraded {
        transaction_hash: String,
        issues: Vec<RecordIssue>,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::StageCompleted { .. } => "stage_completed",
            PipelineEvent::StageFailed { .. } => "stage_failed",
            PipelineEvent::DegenerateFeature { .. } => "degenerate_feature",
            PipelineEvent::RecordDegraded { .. } => "record_degraded",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::StageStarted { timestamp, .. }
            | PipelineEvent::StageCompleted { timestamp, .. }
            | PipelineEvent::StageFailed { timestamp, .. }
            | PipelineEvent::DegenerateFeature { timestamp, .. }
            | PipelineEvent::RecordDegraded { timestamp, .. } => *timestamp,
        }
    }
}

/// Event subscriber
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);

    fn name(&self) -> &str;

    /// Event types of interest; empty means all
    fn interested_events(&self) -> Vec<&'static str> {
        vec![]
    }
}

/// Event bus with a bounded buffer of recent events
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
    event_buffer: Mutex<VecDeque<PipelineEvent>>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            event_buffer: Mutex::new(VecDeque::with_capacity(buffer_size)),
            buffer_size,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn unsubscribe(&self, subscriber_name: &str) {
        self.subscribers.lock().retain(|s| s.name() != subscriber_name);
    }

    pub fn publish(&self, event: PipelineEvent) {
        if self.buffer_size > 0 {
            let mut buffer = self.event_buffer.lock();
            if buffer.len() >= self.buffer_size {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // snapshot so a subscriber may publish without deadlocking
        let subscribers = self.subscribers.lock().clone();
        for subscriber in &subscribers {
            let interested = subscriber.interested_events();
            if interested.is_empty() || interested.contains(&event.event_type()) {
                subscriber.on_event(&event);
            }
        }
    }

    /// Most recent `count` events, oldest first
    pub fn get_recent_events(&self, count: usize) -> Vec<PipelineEvent> {
        let buffer = self.event_buffer.lock();
        let start = buffer.len().saturating_sub(count);
        buffer.iter().skip(start).cloned().collect()
    }

    pub fn clear_buffer(&self) {
        self.event_buffer.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Forwards events to `tracing`
pub struct LoggingSubscriber {
    name: String,
}

impl LoggingSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventSubscriber for LoggingSubscriber {
    fn on_event(&self, event: &PipelineEvent) {
        use tracing::{debug, error, info, warn};

        match event {
            PipelineEvent::StageStarted { stage, records, .. } => {
                debug!(%stage, records, "stage started");
            }
            PipelineEvent::StageCompleted { stage, duration_ms, .. } => {
                info!(%stage, duration_ms, "stage completed");
            }
            PipelineEvent::StageFailed { stage, error, .. } => {
                error!(%stage, error = %error, "stage failed");
            }
            PipelineEvent::DegenerateFeature { feature, value, .. } => {
                warn!(%feature, value, "degenerate feature");
            }
            PipelineEvent::RecordDegraded {
                transaction_hash,
                issues,
                ..
            } => {
                debug!(
                    transaction_hash = transaction_hash.get(..16).unwrap_or(transaction_hash.as_str()),
                    issues = ?issues,
                    "record degraded"
                );
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Counts events per kind
pub struct StatisticsSubscriber {
    name: String,
    stats: Mutex<PipelineStatistics>,
}

impl StatisticsSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Mutex::new(PipelineStatistics::default()),
        }
    }

    pub fn get_statistics(&self) -> PipelineStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = PipelineStatistics::default();
    }
}

impl EventSubscriber for StatisticsSubscriber {
    fn on_event(&self, event: &PipelineEvent) {
        let mut stats = self.stats.lock();

        match event {
            PipelineEvent::StageStarted { .. } => {}
            PipelineEvent::StageCompleted { duration_ms, .. } => {
                stats.stages_completed += 1;
                stats.total_duration_ms += duration_ms;
            }
            PipelineEvent::StageFailed { .. } => stats.stages_failed += 1,
            PipelineEvent::DegenerateFeature { .. } => stats.degenerate_features += 1,
            PipelineEvent::RecordDegraded { issues, .. } => {
                stats.degraded_records += 1;
                for issue in issues {
                    match issue {
                        RecordIssue::MissingIdentifier => stats.missing_identifiers += 1,
                        RecordIssue::MissingAmount => stats.missing_amounts += 1,
                        RecordIssue::InvalidTimestamp => stats.invalid_timestamps += 1,
                        RecordIssue::MalformedField => stats.malformed_fields += 1,
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn interested_events(&self) -> Vec<&'static str> {
        vec![
            "stage_completed",
            "stage_failed",
            "degenerate_feature",
            "record_degraded",
        ]
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatistics {
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub total_duration_ms: u64,
    pub degenerate_features: u64,
    pub degraded_records: u64,
    pub missing_identifiers: u64,
    pub missing_amounts: u64,
    pub invalid_timestamps: u64,
    pub malformed_fields: u64,
}

impl PipelineStatistics {
    pub fn average_stage_duration_ms(&self) -> f64 {
        if self.stages_completed == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.stages_completed as f64
        }
    }
}
