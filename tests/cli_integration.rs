use assert_cmd::Command;
use serde_json::{json, Value};
use std::path::Path;

/// one block of ordinary 1-in 2-out payments plus a 40-input consolidation
fn raw_block() -> Value {
    let mut txs: Vec<Value> = (0..19)
        .map(|i| {
            json!({
                "hash": format!("tx{i:02}"),
                "time": 1_700_000_000 + i * 60,
                "inputs": [{"prev_out": {"value": 100_000_000 + i * 1_000, "addr": format!("in{i}")}}],
                "out": [
                    {"value": 60_000_000, "addr": format!("pay{i}")},
                    {"value": 39_990_000 + i * 1_000, "addr": format!("change{i}")}
                ]
            })
        })
        .collect();

    let inputs: Vec<Value> = (0..40)
        .map(|i| json!({"prev_out": {"value": 2_500_000, "addr": format!("dust{i}")}}))
        .collect();
    txs.push(json!({
        "hash": "consolidation",
        "time": 1_700_003_600,
        "inputs": inputs,
        "out": [{"value": 99_000_000, "addr": "sink"}]
    }));

    json!({"hash": "block", "prev_block": "parent", "tx": txs})
}

fn write(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn read(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_cli_convert_enrich_detect() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw.json");
    let records = dir.path().join("records.json");
    let enriched = dir.path().join("enriched.json");
    let out_dir = dir.path().join("out");
    write(&raw, &raw_block());

    Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["convert", "--input"])
        .arg(&raw)
        .arg("--output")
        .arg(&records)
        .assert()
        .success();
    let converted = read(&records);
    assert_eq!(converted.as_array().unwrap().len(), 20);
    assert_eq!(converted[0]["hash_transaction"], "tx00");

    Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["enrich", "--input"])
        .arg(&records)
        .arg("--output")
        .arg(&enriched)
        .assert()
        .success();
    let rows = read(&enriched);
    assert_eq!(rows[19]["hash_transaction"], "consolidation");
    assert_eq!(rows[19]["indegree"], 40);

    let output = Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["detect", "--contamination", "0.05", "--seed", "7", "--input"])
        .arg(&records)
        .arg("--out-dir")
        .arg(&out_dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("wrote"));

    let verdicts = read(&out_dir.join("result.json"));
    let flagged: Vec<&str> = verdicts
        .as_array()
        .unwrap()
        .iter()
        .filter(|v| v["anomaly"] == 1)
        .map(|v| v["hash_transaction"].as_str().unwrap())
        .collect();
    assert_eq!(flagged, vec!["consolidation"]);
    assert!(out_dir.join("variable.json").exists());
    assert!(out_dir.join("result.csv").exists());
}

#[test]
fn test_cli_detect_raw_input() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw.json");
    let out_dir = dir.path().join("out");
    write(&raw, &raw_block());

    Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["detect", "--raw", "--seed", "7", "--features", "indegree,fee_btc", "--input"])
        .arg(&raw)
        .arg("--out-dir")
        .arg(&out_dir)
        .assert()
        .success();

    let importances = read(&out_dir.join("variable.json"));
    assert_eq!(importances.as_array().unwrap().len(), 2);
    assert_eq!(importances[0]["variable"], "indegree");
}

#[test]
fn test_cli_rejects_bad_contamination() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("records.json");
    std::fs::write(&records, "[]").unwrap();

    Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["detect", "--contamination", "0.9", "--input"])
        .arg(&records)
        .arg("--out-dir")
        .arg(dir.path())
        .assert()
        .failure();
}

#[test]
fn test_cli_empty_batch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("records.json");
    std::fs::write(&records, "[]").unwrap();

    Command::cargo_bin("chain-anomaly")
        .unwrap()
        .args(["detect", "--input"])
        .arg(&records)
        .arg("--out-dir")
        .arg(dir.path().join("out"))
        .assert()
        .failure();
}
