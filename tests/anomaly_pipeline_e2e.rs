// tests/anomaly_pipeline_e2e.rs
//! End-to-end runs of the detection pipeline on small synthetic batches

use chain_anomaly::anomaly_detection::{
    storage::{read_json, VerdictRow},
    AnomalyDetectionConfig, AnomalyPipeline, Contribution, Feature, FileExporter, RecordIssue,
    ReportExporter, TransactionRecord,
};
use pretty_assertions::assert_eq;

/// plain pair, 50-sender fan-in, and a copy of the first with a negative fee
fn three_transactions() -> Vec<TransactionRecord> {
    let plain = TransactionRecord::new("plain")
        .with_time("2024-05-06 12:00:00")
        .with_input(Contribution::new(1.0, "X"))
        .with_output(Contribution::new(1.0, "Y"));

    let mut fan_in = TransactionRecord::new("fan-in").with_time("2024-05-06 12:05:00");
    for i in 0..50 {
        fan_in = fan_in.with_input(Contribution::new(0.03, format!("sender-{i}")));
    }
    let fan_in = fan_in.with_output(Contribution::new(1.0, "Y"));

    let negative_fee = TransactionRecord::new("negative-fee")
        .with_time("2024-05-06 12:10:00")
        .with_input(Contribution::new(0.5, "X"))
        .with_output(Contribution::new(1.0, "Y"));

    vec![plain, fan_in, negative_fee]
}

fn config() -> AnomalyDetectionConfig {
    let mut config = AnomalyDetectionConfig::default();
    config.model.contamination = 0.33;
    config.model.n_estimators = 100;
    config.model.seed = Some(42);
    config
}

#[test]
fn test_fan_in_is_the_single_anomaly() {
    let mut pipeline = AnomalyPipeline::with_config(config()).unwrap();
    let report = pipeline.run(&three_transactions()).unwrap();

    let flags: Vec<(&str, u8)> = report
        .verdicts
        .iter()
        .map(|v| (v.id.as_str(), v.label.as_flag()))
        .collect();
    assert_eq!(flags, vec![("plain", 0), ("fan-in", 1), ("negative-fee", 0)]);
    assert_eq!(report.summary.anomalies, 1);

    let fan_in_score = report.verdicts[1].score;
    assert!(report.verdicts.iter().all(|v| v.score <= fan_in_score));
}

#[test]
fn test_top_attribution_is_a_fan_in_feature() {
    let mut pipeline = AnomalyPipeline::with_config(config()).unwrap();
    let report = pipeline.run(&three_transactions()).unwrap();

    let top = report.attribution.top().unwrap().variable;
    assert!(
        top == Feature::Indegree || top == Feature::SenderEntropy,
        "top feature was {top}"
    );

    // features constant across the batch never split a tree
    for constant in [
        Feature::MeanOutBtc,
        Feature::Outdegree,
        Feature::TotalOut,
        Feature::ReceiverEntropy,
    ] {
        assert_eq!(report.attribution.importance(constant), Some(0.0));
        assert!(report.summary.degenerate_features.contains(&constant));
    }
}

#[test]
fn test_contributions_reconstruct_scores() {
    let mut pipeline = AnomalyPipeline::with_config(config()).unwrap();
    let report = pipeline.run(&three_transactions()).unwrap();

    for (verdict, attribution) in report.verdicts.iter().zip(&report.attribution.records) {
        let reconstructed = attribution.reconstructed_score();
        assert!(
            (reconstructed - verdict.score).abs() < 1e-9,
            "{}: {reconstructed} vs {}",
            verdict.id,
            verdict.score
        );
    }
}

#[test]
fn test_enriched_fields_in_audit() {
    let mut pipeline = AnomalyPipeline::with_config(config()).unwrap();
    let report = pipeline.run(&three_transactions()).unwrap();

    let plain = &report.audit[0].record;
    assert_eq!(plain.fee_btc, 0.0);
    assert!(!plain.is_self_churn);

    let fan_in = &report.audit[1].record;
    assert_eq!(fan_in.indegree, 50);
    assert_eq!(fan_in.unique_senders, 50);
    assert_eq!(fan_in.sender_entropy, 5.6439);
    assert_eq!(fan_in.fee_btc, 0.5);

    let negative = &report.audit[2].record;
    assert_eq!(negative.fee_btc, -0.5);
    assert_eq!(negative.hour, Some(12));
    assert_eq!(negative.day_of_week.as_deref(), Some("Monday"));
}

#[test]
fn test_seeded_runs_are_identical() {
    let records = three_transactions();
    let first = AnomalyPipeline::with_config(config()).unwrap().run(&records).unwrap();
    let second = AnomalyPipeline::with_config(config()).unwrap().run(&records).unwrap();
    assert_eq!(first.verdicts, second.verdicts);
    assert_eq!(first.attribution.importances, second.attribution.importances);
}

#[test]
fn test_export_writes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.output.out_dir = dir.path().join("out");
    config.output.normalization_file = Some("normalization.json".to_string());

    let mut pipeline = AnomalyPipeline::with_config(config.clone()).unwrap();
    let report = pipeline.run(&three_transactions()).unwrap();
    let written = FileExporter::new(config.output.clone()).export(&report).unwrap();
    assert_eq!(written.len(), 4);

    let verdicts: Vec<VerdictRow> = read_json(&config.output_path("result.json")).unwrap();
    assert_eq!(verdicts.len(), 3);
    assert_eq!(verdicts[1].hash_transaction, "fan-in");
    assert_eq!(verdicts[1].anomaly, 1);

    let importances: serde_json::Value = read_json(&config.output_path("variable.json")).unwrap();
    let names: Vec<&str> = importances
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["variable"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "total_btc",
            "mean_in_btc",
            "mean_out_btc",
            "indegree",
            "outdegree",
            "total_in",
            "total_out",
            "sender_entropy",
            "receiver_entropy"
        ]
    );

    let csv = std::fs::read_to_string(config.output_path("result.csv")).unwrap();
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.lines().next().unwrap().ends_with("feature_receiver_entropy,anomaly"));
}

#[test]
fn test_wrongly_typed_record_degrades_instead_of_aborting() {
    let mut values: Vec<serde_json::Value> = three_transactions()
        .iter()
        .map(|r| serde_json::to_value(r).unwrap())
        .collect();
    values.push(serde_json::json!({
        "hash_transaction": "bad",
        "time": 1700000000,
        "inputs": [{"amount": "1.0", "address": "X"}],
        "outputs": [{"amount": 1.0, "address": "Y"}]
    }));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.json");
    std::fs::write(&path, serde_json::to_string(&values).unwrap()).unwrap();
    let records: Vec<TransactionRecord> = read_json(&path).unwrap();
    assert_eq!(records.len(), 4);

    let mut pipeline = AnomalyPipeline::with_config(config()).unwrap();
    let report = pipeline.run(&records).unwrap();
    assert_eq!(report.summary.total_records, 4);
    assert_eq!(report.summary.degraded_records, 1);

    let bad = &report.audit[3].record;
    assert_eq!(bad.id, "bad");
    assert_eq!(
        bad.issues,
        vec![RecordIssue::MissingAmount, RecordIssue::InvalidTimestamp]
    );
    assert_eq!(bad.total_in, 0.0);
    assert_eq!(bad.indegree, 1);
}
