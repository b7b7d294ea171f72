//! Parity-style trace objects rendered from indexed rows
//!
//! Nesting is not reconstructed: every trace reports `subtraces: 0` and the
//! stored trace address as is.

use serde::Serialize;
use tracegate_storage::{
    TraceRow,
    normalize::{EMPTY_BYTES, EMPTY_QUANTITY, normalize_address, normalize_bytes, normalize_hex, parse_trace_address},
};

/// Trace kind reported in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Call,
    Create,
}

/// Action of a message call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAction {
    pub call_type: String,
    pub from: Option<String>,
    pub gas: String,
    pub value: String,
    pub to: Option<String>,
    pub input: String,
}

/// Action of a contract creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAction {
    /// `create` or `create2`, as stored
    pub call_type: String,
    pub from: Option<String>,
    pub gas: String,
    pub value: String,
    pub init: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TraceAction {
    Call(CallAction),
    Create(CreateAction),
}

impl TraceAction {
    pub fn kind(&self) -> TraceKind {
        match self {
            TraceAction::Call(_) => TraceKind::Call,
            TraceAction::Create(_) => TraceKind::Create,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceResult {
    pub gas_used: String,
    pub output: String,
    /// Created contract, only for creations that recorded one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One trace in the wire format expected by Ethereum tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceObject {
    pub action: TraceAction,
    pub block_hash: String,
    pub block_number: i64,
    pub result: TraceResult,
    pub subtraces: u64,
    pub trace_address: Vec<i64>,
    pub transaction_hash: String,
    pub transaction_position: i64,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_creation(call_type: &str) -> bool {
    matches!(call_type, "create" | "create2")
}

/// Render one row. `create2` is reported as kind `create` while
/// `action.callType` keeps the stored value.
pub fn format_trace_row(row: &TraceRow) -> TraceObject {
    let call_type = row
        .call_type
        .as_deref()
        .filter(|call_type| !call_type.is_empty())
        .unwrap_or("call")
        .to_string();
    let from = normalize_address(&row.from_address);
    let to = normalize_address(&row.to_address);
    let gas = normalize_hex(&row.gas, EMPTY_QUANTITY);
    let value = normalize_hex(&row.value, EMPTY_QUANTITY);
    let input = normalize_bytes(&row.input);

    let (action, address) = if is_creation(&call_type) {
        let action = TraceAction::Create(CreateAction {
            call_type,
            from,
            gas,
            value,
            init: input,
        });
        (action, to)
    } else {
        let action = TraceAction::Call(CallAction {
            call_type,
            from,
            gas,
            value,
            to,
            input,
        });
        (action, None)
    };

    TraceObject {
        kind: action.kind(),
        action,
        block_hash: normalize_hex(&row.block_hash, EMPTY_BYTES),
        block_number: row.block_number,
        result: TraceResult {
            gas_used: normalize_hex(&row.gas_used, EMPTY_QUANTITY),
            output: normalize_bytes(&row.output),
            address,
        },
        subtraces: 0,
        trace_address: parse_trace_address(&row.trace_address),
        transaction_hash: normalize_hex(&row.transaction_hash, EMPTY_BYTES),
        transaction_position: row.transaction_position,
        error: row.error.clone().filter(|error| !error.is_empty()),
    }
}

/// Render rows in the order the store returned them
pub fn format_trace_rows(rows: &[TraceRow]) -> Vec<TraceObject> {
    rows.iter().map(format_trace_row).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracegate_storage::StoredValue;

    use super::*;

    fn row(call_type: Option<&str>) -> TraceRow {
        TraceRow {
            transaction_hash: StoredValue::Bytes(vec![0x11; 32]),
            block_hash: StoredValue::Bytes(vec![0x22; 32]),
            block_number: 5,
            transaction_position: 2,
            call_type: call_type.map(str::to_string),
            from_address: StoredValue::Bytes(vec![0xaa; 20]),
            to_address: StoredValue::Bytes(vec![0xbb; 20]),
            value: "1000".into(),
            gas: "21000".into(),
            gas_used: "0".into(),
            input: StoredValue::Bytes(vec![0xa9, 0x05, 0x9c, 0xbb]),
            output: StoredValue::Null,
            error: None,
            trace_address: "{0,1}".into(),
            trace_index: 3,
        }
    }

    #[test]
    fn test_call_shape() {
        let value = serde_json::to_value(format_trace_row(&row(Some("delegatecall")))).unwrap();
        assert_eq!(
            value,
            json!({
                "action": {
                    "callType": "delegatecall",
                    "from": format!("0x{}", "aa".repeat(20)),
                    "gas": "0x5208",
                    "value": "0x3e8",
                    "to": format!("0x{}", "bb".repeat(20)),
                    "input": "0xa9059cbb",
                },
                "blockHash": format!("0x{}", "22".repeat(32)),
                "blockNumber": 5,
                "result": { "gasUsed": "0x0", "output": "0x" },
                "subtraces": 0,
                "traceAddress": [0, 1],
                "transactionHash": format!("0x{}", "11".repeat(32)),
                "transactionPosition": 2,
                "type": "call",
            })
        );
    }

    #[test]
    fn test_create2_shape() {
        let trace = format_trace_row(&row(Some("create2")));
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["type"], "create");
        assert_eq!(value["action"]["callType"], "create2");
        assert_eq!(value["action"]["init"], "0xa9059cbb");
        assert!(value["action"].get("to").is_none());
        assert!(value["action"].get("input").is_none());
        assert_eq!(value["result"]["address"], format!("0x{}", "bb".repeat(20)));
    }

    #[test]
    fn test_create_without_recorded_address() {
        let mut create = row(Some("create"));
        create.to_address = StoredValue::Null;
        let value = serde_json::to_value(format_trace_row(&create)).unwrap();
        assert_eq!(value["type"], "create");
        assert!(value["result"].get("address").is_none());
    }

    #[test]
    fn test_missing_call_type_defaults_to_call() {
        let trace = format_trace_row(&row(None));
        assert_eq!(trace.kind, TraceKind::Call);
        let TraceAction::Call(action) = &trace.action else {
            panic!("expected a call action");
        };
        assert_eq!(action.call_type, "call");
    }

    #[test]
    fn test_error_is_reported_when_present() {
        let mut failed = row(Some("call"));
        failed.error = Some("Reverted".to_string());
        let value = serde_json::to_value(format_trace_row(&failed)).unwrap();
        assert_eq!(value["error"], "Reverted");

        let ok = serde_json::to_value(format_trace_row(&row(Some("call")))).unwrap();
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn test_formatting_is_idempotent() {
        let source = row(Some("staticcall"));
        let first = serde_json::to_vec(&format_trace_row(&source)).unwrap();
        let second = serde_json::to_vec(&format_trace_row(&source)).unwrap();
        assert_eq!(first, second);
    }
}
