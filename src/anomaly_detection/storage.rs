//! Result export
//!
//! Writes the three run artifacts: verdicts and global importances as JSON,
//! and the per-record audit table as CSV.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anomaly_detection::{
    config::OutputConfig,
    detector::{AuditRow, PipelineReport},
    errors::Result,
    explain::FeatureImportance,
    features::FeatureSchema,
    model::AnomalyVerdict,
};

/// One entry of the verdicts file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRow {
    pub hash_transaction: String,
    pub anomaly: u8,
}

impl From<&AnomalyVerdict> for VerdictRow {
    fn from(verdict: &AnomalyVerdict) -> Self {
        Self {
            hash_transaction: verdict.id.clone(),
            anomaly: verdict.label.as_flag(),
        }
    }
}

/// Export target for a finished run
pub trait ReportExporter {
    /// Write the report; returns the files written
    fn export(&self, report: &PipelineReport) -> Result<Vec<PathBuf>>;
}

/// Writes run artifacts into a directory
pub struct FileExporter {
    config: OutputConfig,
}

impl FileExporter {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.config.out_dir.join(file)
    }
}

impl ReportExporter for FileExporter {
    fn export(&self, report: &PipelineReport) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.config.out_dir)?;

        let verdicts = self.path(&self.config.verdicts_file);
        write_verdicts(&verdicts, &report.verdicts)?;

        let importances = self.path(&self.config.importance_file);
        write_importances(&importances, &report.attribution.importances)?;

        let audit = self.path(&self.config.audit_file);
        write_audit_csv(&audit, &report.schema, &report.audit)?;

        let mut written = vec![verdicts, importances, audit];
        if let Some(file) = &self.config.normalization_file {
            let path = self.path(file);
            report.normalization.save(&path)?;
            written.push(path);
        }

        info!(
            out_dir = %self.config.out_dir.display(),
            files = written.len(),
            "results exported"
        );
        Ok(written)
    }
}

/// Write any serializable value as pretty JSON
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// `[{hash_transaction, anomaly: 0|1}]`
pub fn write_verdicts(path: &Path, verdicts: &[AnomalyVerdict]) -> Result<()> {
    let rows: Vec<VerdictRow> = verdicts.iter().map(VerdictRow::from).collect();
    write_json(path, &rows)
}

/// `[{variable, value}]`, schema order
pub fn write_importances(path: &Path, importances: &[FeatureImportance]) -> Result<()> {
    write_json(path, importances)
}

const AUDIT_COLUMNS: [&str; 18] = [
    "hash_transaction",
    "time",
    "indegree",
    "outdegree",
    "total_in",
    "total_out",
    "mean_in_btc",
    "mean_out_btc",
    "fee_btc",
    "unique_senders",
    "unique_receivers",
    "is_self_churn",
    "sender_entropy",
    "receiver_entropy",
    "hour",
    "day_of_week",
    "issues",
    "score",
];

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// One CSV row per record: enriched fields, `feature_*` columns with the
/// denormalized model inputs, then score and label
pub fn write_audit_csv(path: &Path, schema: &FeatureSchema, rows: &[AuditRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header: Vec<String> = AUDIT_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(schema.names().into_iter().map(|n| format!("feature_{n}")));
    header.push("anomaly".to_string());
    writer.write_record(&header)?;

    for row in rows {
        let r = &row.record;
        let issues: Vec<&str> = r.issues.iter().map(|i| i.as_str()).collect();

        let mut fields = vec![
            r.id.clone(),
            opt(&r.time),
            r.indegree.to_string(),
            r.outdegree.to_string(),
            r.total_in.to_string(),
            r.total_out.to_string(),
            r.mean_in_btc.to_string(),
            r.mean_out_btc.to_string(),
            r.fee_btc.to_string(),
            r.unique_senders.to_string(),
            r.unique_receivers.to_string(),
            r.is_self_churn.to_string(),
            r.sender_entropy.to_string(),
            r.receiver_entropy.to_string(),
            opt(&r.hour),
            opt(&r.day_of_week),
            issues.join(";"),
            row.score.to_string(),
        ];
        fields.extend(row.features.iter().map(f64::to_string));
        fields.push(row.label.as_flag().to_string());
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}
