//! Transaction records as handed over by the ingestion layer

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Timestamp layout used on the input boundary
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One side of a transaction: an input (sender) or an output (receiver)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Amount in canonical currency units (BTC). `None` when the ledger
    /// omitted it, e.g. an input without a previous output.
    #[serde(default)]
    pub amount: Option<f64>,
    /// Sender or receiver address, absent for non-standard scripts
    #[serde(default)]
    pub address: Option<String>,
}

impl Contribution {
    pub fn new(amount: f64, address: impl Into<String>) -> Self {
        Self {
            amount: Some(amount),
            address: Some(address.into()),
        }
    }

    /// Contribution with a known amount but no address
    pub fn anonymous(amount: f64) -> Self {
        Self {
            amount: Some(amount),
            address: None,
        }
    }
}

/// Immutable transaction record consumed by the feature enricher
///
/// Deserialization never fails on a single record: wrongly typed fields
/// degrade (see [`TransactionRecord::from_value`]) and the enricher flags them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct TransactionRecord {
    /// Transaction identifier (hash)
    #[serde(rename = "hash_transaction")]
    pub id: String,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    pub time: Option<String>,
    pub inputs: Vec<Contribution>,
    pub outputs: Vec<Contribution>,
    /// Paths of fields dropped while reading, e.g. `inputs[2].address`
    #[serde(skip)]
    pub malformed: Vec<String>,
}

impl From<Value> for TransactionRecord {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl TransactionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    pub fn with_input(mut self, input: Contribution) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: Contribution) -> Self {
        self.outputs.push(output);
        self
    }

    /// Lenient conversion from one JSON record.
    ///
    /// - numeric identifiers are stringified, other non-strings become empty
    /// - a non-string `time` keeps its JSON text so it fails timestamp parsing
    /// - a non-numeric `amount` becomes `None`
    /// - non-list sides, non-object contributions and non-string addresses
    ///   are dropped and recorded in `malformed`
    pub fn from_value(value: Value) -> Self {
        let mut malformed = Vec::new();
        let mut fields = match value {
            Value::Object(fields) => fields,
            _ => {
                malformed.push("record".to_string());
                Map::new()
            }
        };

        let id = match fields.remove("hash_transaction").or_else(|| fields.remove("hash")) {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => String::new(),
        };
        let time = match fields.remove("time") {
            None | Some(Value::Null) => None,
            Some(Value::String(time)) => Some(time),
            Some(other) => Some(other.to_string()),
        };
        let inputs = contributions_from_value(fields.remove("inputs"), "inputs", &mut malformed);
        let outputs = contributions_from_value(fields.remove("outputs"), "outputs", &mut malformed);

        Self {
            id,
            time,
            inputs,
            outputs,
            malformed,
        }
    }

    /// Sender addresses in input order, nulls dropped, duplicates kept
    pub fn senders(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter_map(|c| c.address.as_deref())
            .collect()
    }

    /// Receiver addresses in output order, nulls dropped, duplicates kept
    pub fn receivers(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter_map(|c| c.address.as_deref())
            .collect()
    }
}

fn contributions_from_value(
    value: Option<Value>,
    side: &str,
    malformed: &mut Vec<String>,
) -> Vec<Contribution> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| contribution_from_value(item, &format!("{side}[{i}]"), malformed))
            .collect(),
        Some(_) => {
            malformed.push(side.to_string());
            Vec::new()
        }
    }
}

/// A non-object entry still counts toward the degree, with no amount
fn contribution_from_value(value: Value, path: &str, malformed: &mut Vec<String>) -> Contribution {
    let Value::Object(mut fields) = value else {
        malformed.push(path.to_string());
        return Contribution::default();
    };

    let amount = fields
        .remove("amount")
        .and_then(|a| a.as_f64())
        .filter(|a| a.is_finite());
    let address = match fields.remove("address") {
        None | Some(Value::Null) => None,
        Some(Value::String(address)) => Some(address).filter(|a| !a.is_empty()),
        Some(_) => {
            malformed.push(format!("{path}.address"));
            None
        }
    };
    Contribution { amount, address }
}
