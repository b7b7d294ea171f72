//! JSON-RPC envelope types and trace method parameters

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JsonRpcError, TraceError};

pub const TRACE_BLOCK: &str = "trace_block";
pub const TRACE_TRANSACTION: &str = "trace_transaction";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC response carrying either a result or an error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(error),
        }
    }
}

fn first_param(params: Option<&Value>) -> Option<&str> {
    params?.as_array()?.first()?.as_str()
}

/// Parse `params[0]` of `trace_block`: `0x` followed by one or more hex digits.
pub fn parse_block_param(params: Option<&Value>) -> Result<u64, TraceError> {
    const INVALID: TraceError = TraceError::InvalidParams("expected hex block number");

    let digits = first_param(params)
        .and_then(|s| s.strip_prefix("0x"))
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or(INVALID)?;

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(0);
    }
    // saturates; the store rejects numbers outside its range
    Ok(u64::from_str_radix(significant, 16).unwrap_or(u64::MAX))
}

/// Parse `params[0]` of `trace_transaction`: `0x` followed by exactly 64 hex digits.
pub fn parse_transaction_param(params: Option<&Value>) -> Result<B256, TraceError> {
    let digits = first_param(params)
        .and_then(|s| s.strip_prefix("0x"))
        .filter(|d| d.len() == 64 && d.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or(TraceError::InvalidParams("expected transaction hash"))?;

    let mut bytes = [0u8; 32];
    hex::decode_to_slice(digits, &mut bytes)
        .map_err(|_| TraceError::InvalidParams("expected transaction hash"))?;
    Ok(B256::from(bytes))
}
