//! Raw ledger payloads → `TransactionRecord`
//!
//! Accepts the `rawblock` / `rawtx` JSON shape of the public Bitcoin block
//! explorer API. Fetching is out of scope; callers hand in parsed payloads.

use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use super::record::{Contribution, TransactionRecord, TIMESTAMP_FORMAT};

/// Ledger subunits per canonical unit (satoshi per BTC)
pub const SATOSHI_PER_BTC: f64 = 100_000_000.0;

/// Default number of transactions taken from each block
pub const DEFAULT_TX_PER_BLOCK: usize = 200;

/// Output spent by an input, or an output of the transaction itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOutput {
    /// Amount in satoshi; negative or fractional values read as absent
    #[serde(default, deserialize_with = "lenient")]
    pub value: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default, deserialize_with = "lenient")]
    pub prev_out: Option<RawOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub hash: String,
    /// Unix epoch seconds
    #[serde(default, deserialize_with = "lenient")]
    pub time: Option<i64>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub inputs: Vec<RawInput>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub out: Vec<RawOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBlock {
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub hash: String,
    #[serde(default, deserialize_with = "lenient")]
    pub prev_block: Option<String>,
    /// Required: distinguishes a block from a bare transaction
    #[serde(deserialize_with = "lenient_list")]
    pub tx: Vec<RawTransaction>,
}

/// Wrongly typed field → `None`
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

/// Non-list → empty; malformed entries keep their slot as defaults
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap_or_default())
            .collect(),
        _ => Vec::new(),
    })
}

/// Payload accepted by [`records_from_json`]
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPayload {
    Blocks(Vec<RawBlock>),
    Block(RawBlock),
    Transactions(Vec<RawTransaction>),
}

/// Convert satoshi to BTC
pub fn satoshi_to_btc(value: u64) -> f64 {
    value as f64 / SATOSHI_PER_BTC
}

/// Format epoch seconds on the input-boundary layout (UTC)
pub fn format_epoch(epoch: i64) -> Option<String> {
    DateTime::from_timestamp(epoch, 0).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

impl From<&RawOutput> for Contribution {
    fn from(raw: &RawOutput) -> Self {
        Contribution {
            amount: raw.value.map(satoshi_to_btc),
            address: raw.addr.clone().filter(|a| !a.is_empty()),
        }
    }
}

impl From<&RawTransaction> for TransactionRecord {
    fn from(raw: &RawTransaction) -> Self {
        // inputs without a previous output (coinbase) keep their slot so the
        // indegree still counts them
        let inputs = raw
            .inputs
            .iter()
            .map(|input| input.prev_out.as_ref().map(Contribution::from).unwrap_or_default())
            .collect();
        let outputs = raw.out.iter().map(Contribution::from).collect();

        TransactionRecord {
            id: raw.hash.clone(),
            time: raw.time.filter(|&t| t > 0).and_then(format_epoch),
            inputs,
            outputs,
            malformed: Vec::new(),
        }
    }
}

impl RawBlock {
    /// Records for the first `limit` transactions of the block
    pub fn records(&self, limit: usize) -> Vec<TransactionRecord> {
        self.tx.iter().take(limit).map(TransactionRecord::from).collect()
    }
}

/// Flatten blocks into records, at most `limit_per_block` from each
pub fn records_from_blocks(blocks: &[RawBlock], limit_per_block: usize) -> Vec<TransactionRecord> {
    let records: Vec<TransactionRecord> = blocks
        .iter()
        .flat_map(|block| block.records(limit_per_block))
        .collect();
    debug!(blocks = blocks.len(), records = records.len(), "converted raw blocks");
    records
}

/// Parse a raw ledger payload (blocks, a block, or bare transactions)
pub fn records_from_json(
    json: &str,
    limit_per_block: usize,
) -> super::Result<Vec<TransactionRecord>> {
    let payload: RawPayload = serde_json::from_str(json)?;
    Ok(match payload {
        RawPayload::Blocks(blocks) => records_from_blocks(&blocks, limit_per_block),
        RawPayload::Block(block) => block.records(limit_per_block),
        RawPayload::Transactions(txs) => txs.iter().map(TransactionRecord::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw_tx() -> RawTransaction {
        serde_json::from_str(
            r#"{
                "hash": "tx1",
                "time": 1700000000,
                "inputs": [
                    {"prev_out": {"value": 150000000, "addr": "A"}},
                    {"prev_out": null}
                ],
                "out": [
                    {"value": 100000000, "addr": "B"},
                    {"value": 49990000}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_convert_transaction() {
        let record = TransactionRecord::from(&raw_tx());
        assert_eq!(record.id, "tx1");
        assert_eq!(record.time.as_deref(), Some("2023-11-14 22:13:20"));
        assert_eq!(record.inputs.len(), 2);
        assert_eq!(record.inputs[0], Contribution::new(1.5, "A"));
        assert_eq!(record.inputs[1], Contribution::default());
        assert_eq!(record.outputs[1], Contribution::anonymous(0.4999));
    }

    #[test]
    fn test_missing_time() {
        let mut raw = raw_tx();
        raw.time = None;
        assert!(TransactionRecord::from(&raw).time.is_none());
    }

    #[test]
    fn test_block_limit() {
        let block = RawBlock {
            hash: "b".into(),
            prev_block: None,
            tx: vec![raw_tx(); 5],
        };
        assert_eq!(block.records(3).len(), 3);
        assert_eq!(records_from_blocks(&[block.clone(), block], 2).len(), 4);
    }

    #[test]
    fn test_payload_shapes() {
        let txs = r#"[{"hash": "a", "inputs": [], "out": []}]"#;
        assert_eq!(records_from_json(txs, 10).unwrap().len(), 1);

        let block = r#"{"hash": "b", "prev_block": "p", "tx": [{"hash": "a"}, {"hash": "c"}]}"#;
        assert_eq!(records_from_json(block, 1).unwrap().len(), 1);

        assert!(records_from_json("42", 1).is_err());
    }

    #[test]
    fn test_wrongly_typed_fields_degrade() {
        let txs = r#"[
            {"hash": "good", "time": 1700000000,
             "inputs": [{"prev_out": {"value": 100000000, "addr": "A"}}],
             "out": [{"value": 90000000, "addr": "B"}]},
            {"hash": "bad", "time": "yesterday",
             "inputs": [{"prev_out": {"value": -5, "addr": 7}}, 3],
             "out": [{"value": 1.5}]}
        ]"#;
        let records = records_from_json(txs, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].inputs[0], Contribution::new(1.0, "A"));

        let bad = &records[1];
        assert!(bad.time.is_none());
        assert_eq!(bad.inputs, vec![Contribution::default(), Contribution::default()]);
        assert_eq!(bad.outputs, vec![Contribution::default()]);
    }
}
