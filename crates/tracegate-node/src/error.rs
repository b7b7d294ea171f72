use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Invalid method parameters
pub const INVALID_PARAMS: i64 = -32602;
/// Malformed request envelope
pub const INVALID_REQUEST: i64 = -32600;
/// Unparsable request body
pub const PARSE_ERROR: i64 = -32700;
/// Internal failure outside any handler
pub const INTERNAL_ERROR: i64 = -32603;
/// Store query failed or timed out
pub const QUERY_FAILED: i64 = -32000;
/// Block or transaction confirmed absent on chain
pub const NOT_FOUND: i64 = -32001;
/// Forwarded call returned a body that is not JSON
pub const UPSTREAM_INVALID_JSON: i64 = -32002;
/// Forwarded call failed in transport
pub const UPSTREAM_FAILED: i64 = -32003;
/// Index lags behind the chain; retry later
pub const NOT_READY: i64 = -32010;

/// Failure of a trace request
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Invalid params: {0}")]
    InvalidParams(&'static str),
    #[error("Block not found")]
    BlockNotFound,
    #[error("Transaction not found")]
    TransactionNotFound,
    /// Carries the diagnostic payload reported to the caller, if any
    #[error("Trace data not ready")]
    NotReady(Option<Value>),
    #[error("store query timed out after {0:?}")]
    QueryTimeout(Duration),
    #[error("store query failed: {0:#}")]
    Store(eyre::Report),
}

impl From<eyre::Report> for TraceError {
    fn from(err: eyre::Report) -> Self {
        TraceError::Store(err)
    }
}

impl TraceError {
    pub fn code(&self) -> i64 {
        match self {
            TraceError::InvalidParams(_) => INVALID_PARAMS,
            TraceError::BlockNotFound | TraceError::TransactionNotFound => NOT_FOUND,
            TraceError::NotReady(_) => NOT_READY,
            TraceError::QueryTimeout(_) | TraceError::Store(_) => QUERY_FAILED,
        }
    }

    /// Whether the failure is internal and should be logged as such
    pub fn is_internal(&self) -> bool {
        matches!(self, TraceError::QueryTimeout(_) | TraceError::Store(_))
    }

    /// Wire form of the error; internal details stay out of the message.
    pub fn to_rpc_error(&self, method: &str) -> JsonRpcError {
        match self {
            TraceError::QueryTimeout(_) | TraceError::Store(_) => {
                JsonRpcError::new(self.code(), format!("{method} query failed"))
            }
            TraceError::NotReady(data) => JsonRpcError {
                code: self.code(),
                message: self.to_string(),
                data: data.clone(),
            },
            _ => JsonRpcError::new(self.code(), self.to_string()),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
