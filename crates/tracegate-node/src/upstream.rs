//! Upstream node access
//!
//! The upstream node is the source of truth when the indexer store is
//! inconclusive. Failures never surface to callers: they become
//! [`Existence::Unknown`] / [`Lookup::Unavailable`], which callers read
//! permissively.

use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use eyre::{Context, Result};
use serde_json::{Value, json};
use tracegate_config::UpstreamConfig;
use tracing::{debug, warn};

use crate::error::{JsonRpcError, UPSTREAM_FAILED, UPSTREAM_INVALID_JSON};

/// Whether the chain has an entity, as far as the upstream node can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Exists,
    Missing,
    /// The upstream failed, timed out or answered malformed data
    Unknown,
}

impl Existence {
    /// Only a definitive answer counts as absent; `Unknown` is read as present.
    pub fn assume_exists(self) -> bool {
        !matches!(self, Existence::Missing)
    }
}

/// Outcome of fetching an entity from the upstream node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Missing,
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn existence(&self) -> Existence {
        match self {
            Lookup::Found(_) => Existence::Exists,
            Lookup::Missing => Existence::Missing,
            Lookup::Unavailable => Existence::Unknown,
        }
    }
}

/// Block summary as reported by `eth_getBlockByNumber`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamBlock {
    pub transaction_count: usize,
}

/// Transaction summary as reported by `eth_getTransactionByHash`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTransaction {
    /// `None` while the transaction is pending
    pub block_number: Option<u64>,
}

/// Live chain queries used to disambiguate empty store results
#[async_trait]
pub trait ChainOracle: Send + Sync + 'static {
    async fn block(&self, number: u64) -> Lookup<UpstreamBlock>;

    async fn transaction(&self, hash: B256) -> Lookup<UpstreamTransaction>;

    /// Current head height, `None` if it cannot be fetched
    async fn head_height(&self) -> Option<u64>;

    async fn block_exists(&self, number: u64) -> Existence {
        self.block(number).await.existence()
    }

    async fn transaction_exists(&self, hash: B256) -> Existence {
        self.transaction(hash).await.existence()
    }
}

fn parse_quantity(value: &Value) -> Option<u64> {
    let digits = value.as_str()?.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

/// JSON-RPC client for the upstream node
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    /// Create a client whose requests are aborted after `config.timeout_ms`
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one call and return its `result` member, which may be `null`.
    ///
    /// `None` when the call fails, times out, or the reply carries no result.
    async fn call(&self, method: &str, params: Value) -> Option<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(method, %err, "Upstream request failed");
                return None;
            }
        };

        let mut body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!(method, %err, "Upstream returned invalid JSON");
                return None;
            }
        };

        if let Some(error) = body.get("error") {
            warn!(method, %error, "Upstream returned an error");
            return None;
        }
        let result = body.get_mut("result").map(Value::take);
        if result.is_none() {
            warn!(method, "Upstream reply has no result");
        }
        result
    }

    /// Forward a request verbatim and return the upstream's reply.
    ///
    /// `timeout` overrides the client's default for this call.
    pub async fn forward(&self, payload: &Value, timeout: Duration) -> Result<Value, JsonRpcError> {
        let method = payload.get("method").and_then(Value::as_str).unwrap_or_default();
        debug!(method, "Forwarding request upstream");

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(method, %err, "Forwarded request failed");
                JsonRpcError::new(UPSTREAM_FAILED, "Upstream request failed")
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            warn!(method, %err, "Failed to read forwarded response");
            JsonRpcError::new(UPSTREAM_FAILED, "Upstream request failed")
        })?;

        serde_json::from_str(&text).map_err(|_| {
            JsonRpcError::new(UPSTREAM_INVALID_JSON, "Upstream returned invalid JSON")
                .with_data(json!({ "status": status.as_u16() }))
        })
    }
}

#[async_trait]
impl ChainOracle for HttpUpstream {
    async fn block(&self, number: u64) -> Lookup<UpstreamBlock> {
        match self
            .call("eth_getBlockByNumber", json!([format!("0x{number:x}"), false]))
            .await
        {
            None => Lookup::Unavailable,
            Some(Value::Null) => Lookup::Missing,
            Some(block) => Lookup::Found(UpstreamBlock {
                transaction_count: block
                    .get("transactions")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len),
            }),
        }
    }

    async fn transaction(&self, hash: B256) -> Lookup<UpstreamTransaction> {
        let hash = format!("0x{}", hex::encode(hash.as_slice()));
        match self.call("eth_getTransactionByHash", json!([hash])).await {
            None => Lookup::Unavailable,
            Some(Value::Null) => Lookup::Missing,
            Some(tx) => Lookup::Found(UpstreamTransaction {
                block_number: tx.get("blockNumber").and_then(parse_quantity),
            }),
        }
    }

    async fn head_height(&self) -> Option<u64> {
        let head = self.call("eth_blockNumber", json!([])).await?;
        let height = parse_quantity(&head);
        if height.is_none() {
            warn!(%head, "Upstream head height is not a quantity");
        }
        height
    }
}
