//! Transaction feature extraction
//!
//! Derives graph, value and temporal features from one `TransactionRecord`
//! and projects enriched records onto a fixed feature schema.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::entropy::shannon_entropy;
use super::errors::{AnomalyDetectionError, Result};
use super::record::{TransactionRecord, TIMESTAMP_FORMAT};

/// Fractional digits kept for fee values
const FEE_DECIMALS: i32 = 8;
/// Fractional digits kept for entropy values
const ENTROPY_DECIMALS: i32 = 4;

/// Round to a fixed number of fractional digits
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Problem found while enriching a record; the record is still scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordIssue {
    /// Transaction identifier empty
    MissingIdentifier,
    /// One or more contributions carried no amount
    MissingAmount,
    /// Timestamp present but not in `YYYY-MM-DD HH:MM:SS`
    InvalidTimestamp,
    /// A field had the wrong JSON type and was dropped on read
    MalformedField,
}

impl RecordIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordIssue::MissingIdentifier => "missing_identifier",
            RecordIssue::MissingAmount => "missing_amount",
            RecordIssue::InvalidTimestamp => "invalid_timestamp",
            RecordIssue::MalformedField => "malformed_field",
        }
    }
}

/// Transaction enriched with derived features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(rename = "hash_transaction")]
    pub id: String,
    pub time: Option<String>,
    pub indegree: usize,
    pub outdegree: usize,
    pub in_btc: Vec<f64>,
    pub out_btc: Vec<f64>,
    pub total_in: f64,
    pub total_out: f64,
    pub mean_in_btc: f64,
    pub mean_out_btc: f64,
    pub senders: Vec<String>,
    pub receivers: Vec<String>,
    /// `total_in - total_out`; negative on partial data, never clamped
    pub fee_btc: f64,
    pub unique_senders: usize,
    pub unique_receivers: usize,
    pub is_self_churn: bool,
    pub sender_entropy: f64,
    pub receiver_entropy: f64,
    /// Hour of day, absent when the timestamp is missing or unparseable
    pub hour: Option<u32>,
    /// Weekday name (`Monday`..), absent with the hour
    pub day_of_week: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<RecordIssue>,
}

impl EnrichedRecord {
    /// Whether enrichment had to fall back to defaults
    pub fn is_degraded(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn total_btc(&self) -> f64 {
        self.total_in + self.total_out
    }

    /// Numeric value of one feature; `None` for absent temporal fields
    pub fn feature(&self, feature: Feature) -> Option<f64> {
        let value = match feature {
            Feature::TotalBtc => self.total_btc(),
            Feature::TotalIn => self.total_in,
            Feature::TotalOut => self.total_out,
            Feature::MeanInBtc => self.mean_in_btc,
            Feature::MeanOutBtc => self.mean_out_btc,
            Feature::Indegree => self.indegree as f64,
            Feature::Outdegree => self.outdegree as f64,
            Feature::FeeBtc => self.fee_btc,
            Feature::UniqueSenders => self.unique_senders as f64,
            Feature::UniqueReceivers => self.unique_receivers as f64,
            Feature::IsSelfChurn => {
                if self.is_self_churn {
                    1.0
                } else {
                    0.0
                }
            }
            Feature::SenderEntropy => self.sender_entropy,
            Feature::ReceiverEntropy => self.receiver_entropy,
            Feature::Hour => return self.hour.map(f64::from),
            Feature::DayOfWeek => {
                return self
                    .day_of_week
                    .as_deref()
                    .and_then(|d| d.parse::<chrono::Weekday>().ok())
                    .map(|d| f64::from(d.num_days_from_monday()))
            }
        };
        Some(value)
    }
}

/// Numeric feature selectable in a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    TotalBtc,
    MeanInBtc,
    MeanOutBtc,
    Indegree,
    Outdegree,
    TotalIn,
    TotalOut,
    SenderEntropy,
    ReceiverEntropy,
    FeeBtc,
    UniqueSenders,
    UniqueReceivers,
    IsSelfChurn,
    Hour,
    DayOfWeek,
}

impl Feature {
    pub const ALL: [Feature; 15] = [
        Feature::TotalBtc,
        Feature::MeanInBtc,
        Feature::MeanOutBtc,
        Feature::Indegree,
        Feature::Outdegree,
        Feature::TotalIn,
        Feature::TotalOut,
        Feature::SenderEntropy,
        Feature::ReceiverEntropy,
        Feature::FeeBtc,
        Feature::UniqueSenders,
        Feature::UniqueReceivers,
        Feature::IsSelfChurn,
        Feature::Hour,
        Feature::DayOfWeek,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::TotalBtc => "total_btc",
            Feature::MeanInBtc => "mean_in_btc",
            Feature::MeanOutBtc => "mean_out_btc",
            Feature::Indegree => "indegree",
            Feature::Outdegree => "outdegree",
            Feature::TotalIn => "total_in",
            Feature::TotalOut => "total_out",
            Feature::SenderEntropy => "sender_entropy",
            Feature::ReceiverEntropy => "receiver_entropy",
            Feature::FeeBtc => "fee_btc",
            Feature::UniqueSenders => "unique_senders",
            Feature::UniqueReceivers => "unique_receivers",
            Feature::IsSelfChurn => "is_self_churn",
            Feature::Hour => "hour",
            Feature::DayOfWeek => "day_of_week",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = AnomalyDetectionError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Feature::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| AnomalyDetectionError::UnknownFeature(wanted.to_string()))
    }
}

/// Ordered list of features; identical across every stage of one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Feature>", into = "Vec<Feature>")]
pub struct FeatureSchema(Vec<Feature>);

impl FeatureSchema {
    /// Schema from a feature list; empty or duplicated lists are rejected
    pub fn new(features: Vec<Feature>) -> Result<Self> {
        if features.is_empty() {
            return Err(AnomalyDetectionError::Configuration(
                "feature schema must not be empty".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for f in &features {
            if !seen.insert(f.name()) {
                return Err(AnomalyDetectionError::Configuration(format!(
                    "feature '{f}' listed twice in schema"
                )));
            }
        }
        Ok(Self(features))
    }

    /// Parse comma-separated feature names
    pub fn parse_list(list: &str) -> Result<Self> {
        let features = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Feature::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::new(features)
    }

    pub fn features(&self) -> &[Feature] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|f| f.name()).collect()
    }

    pub fn position(&self, feature: Feature) -> Option<usize> {
        self.0.iter().position(|&f| f == feature)
    }

    /// Project enriched records onto this schema, imputing absent values to 0.0
    pub fn project(&self, records: &[EnrichedRecord]) -> FeatureMatrix {
        let rows = records
            .iter()
            .map(|r| {
                FeatureVector(
                    self.0
                        .iter()
                        .map(|&f| r.feature(f).filter(|v| v.is_finite()).unwrap_or(0.0))
                        .collect(),
                )
            })
            .collect();
        FeatureMatrix {
            schema: self.clone(),
            rows,
        }
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self(vec![
            Feature::TotalBtc,
            Feature::MeanInBtc,
            Feature::MeanOutBtc,
            Feature::Indegree,
            Feature::Outdegree,
            Feature::TotalIn,
            Feature::TotalOut,
            Feature::SenderEntropy,
            Feature::ReceiverEntropy,
        ])
    }
}

impl TryFrom<Vec<Feature>> for FeatureSchema {
    type Error = AnomalyDetectionError;

    fn try_from(features: Vec<Feature>) -> Result<Self> {
        Self::new(features)
    }
}

impl From<FeatureSchema> for Vec<Feature> {
    fn from(schema: FeatureSchema) -> Self {
        schema.0
    }
}

impl fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(", "))
    }
}

/// One record projected onto a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Batch of feature vectors sharing one schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureVector>,
}

impl FeatureMatrix {
    /// Build a matrix, checking every row against the schema width
    pub fn new(schema: FeatureSchema, rows: Vec<Vec<f64>>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| r.len() != schema.len()) {
            return Err(AnomalyDetectionError::schema_mismatch(
                format!("{} values {schema}", schema.len()),
                format!("{} values", bad.len()),
            ));
        }
        Ok(Self {
            schema,
            rows: rows.into_iter().map(FeatureVector).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.schema.len()
    }

    /// Values of one column
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r.0[index]).collect()
    }
}

/// Feature extractor
///
/// Stateless: every record is enriched on its own, so batches run in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Enrich one transaction record
    pub fn enrich(&self, record: &TransactionRecord) -> EnrichedRecord {
        let mut issues = Vec::new();
        if record.id.trim().is_empty() {
            issues.push(RecordIssue::MissingIdentifier);
        }

        let in_btc: Vec<f64> = record.inputs.iter().filter_map(|c| c.amount).collect();
        let out_btc: Vec<f64> = record.outputs.iter().filter_map(|c| c.amount).collect();
        if in_btc.len() < record.inputs.len() || out_btc.len() < record.outputs.len() {
            issues.push(RecordIssue::MissingAmount);
        }
        if !record.malformed.is_empty() {
            debug!(id = %record.id, fields = ?record.malformed, "malformed fields dropped");
            issues.push(RecordIssue::MalformedField);
        }

        let total_in: f64 = in_btc.iter().sum();
        let total_out: f64 = out_btc.iter().sum();
        let mean_in_btc = mean(total_in, in_btc.len());
        let mean_out_btc = mean(total_out, out_btc.len());

        let senders = record.senders();
        let receivers = record.receivers();
        let unique_sender_set: BTreeSet<&str> = senders.iter().copied().collect();
        let unique_receiver_set: BTreeSet<&str> = receivers.iter().copied().collect();

        let is_self_churn = match (
            single(&unique_sender_set),
            single(&unique_receiver_set),
        ) {
            (Some(sender), Some(receiver)) => sender == receiver,
            _ => false,
        };

        let (hour, day_of_week) = match record.time.as_deref() {
            Some(raw) => match NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT) {
                Ok(dt) => (Some(dt.hour()), Some(dt.format("%A").to_string())),
                Err(e) => {
                    debug!(id = %record.id, time = raw, error = %e, "unparseable timestamp");
                    issues.push(RecordIssue::InvalidTimestamp);
                    (None, None)
                }
            },
            None => (None, None),
        };

        EnrichedRecord {
            id: if record.id.trim().is_empty() {
                fallback_id(record)
            } else {
                record.id.clone()
            },
            time: record.time.clone(),
            indegree: record.inputs.len(),
            outdegree: record.outputs.len(),
            total_in,
            total_out,
            mean_in_btc,
            mean_out_btc,
            fee_btc: round_to(total_in - total_out, FEE_DECIMALS),
            unique_senders: unique_sender_set.len(),
            unique_receivers: unique_receiver_set.len(),
            is_self_churn,
            sender_entropy: round_to(shannon_entropy(&senders), ENTROPY_DECIMALS),
            receiver_entropy: round_to(shannon_entropy(&receivers), ENTROPY_DECIMALS),
            hour,
            day_of_week,
            senders: senders.into_iter().map(str::to_string).collect(),
            receivers: receivers.into_iter().map(str::to_string).collect(),
            in_btc,
            out_btc,
            issues,
        }
    }

    /// Enrich a batch in parallel; output order follows input order
    pub fn enrich_batch(&self, records: &[TransactionRecord]) -> Vec<EnrichedRecord> {
        let enriched: Vec<EnrichedRecord> = records.par_iter().map(|r| self.enrich(r)).collect();

        let degraded = enriched.iter().filter(|r| r.is_degraded()).count();
        if degraded > 0 {
            warn!(degraded, total = enriched.len(), "records enriched with defaults");
        }
        enriched
    }
}

/// Stable stand-in identifier derived from the record content
fn fallback_id(record: &TransactionRecord) -> String {
    let mut hasher = Sha256::new();
    if let Some(time) = &record.time {
        hasher.update(time.as_bytes());
    }
    for (tag, side) in [(b'i', &record.inputs), (b'o', &record.outputs)] {
        for c in side {
            hasher.update([tag]);
            hasher.update(c.amount.unwrap_or(f64::NAN).to_le_bytes());
            hasher.update(c.address.as_deref().unwrap_or("").as_bytes());
            hasher.update([0u8]);
        }
    }
    format!("anon-{}", &hex::encode(hasher.finalize())[..16])
}

fn mean(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn single<'a>(set: &BTreeSet<&'a str>) -> Option<&'a str> {
    if set.len() == 1 {
        set.iter().next().copied()
    } else {
        None
    }
}
