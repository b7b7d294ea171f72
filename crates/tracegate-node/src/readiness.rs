//! Readiness decisions for empty trace results
//!
//! When a block or transaction has no indexed internal calls, the readiness
//! oracle decides whether that is final or whether the indexer is lagging.

use std::sync::Arc;

use alloy_primitives::B256;
use eyre::Result;
use serde::Serialize;
use serde_json::json;
use tracegate_config::{ReadinessConfig, ReadinessMode};
use tracegate_storage::TraceStore;
use tracing::{debug, info};

use crate::{
    error::TraceError,
    upstream::{ChainOracle, Lookup},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessReason {
    /// The store has no transactions for the block
    EmptyBlock,
    /// Some indexed transactions have no indexed internal calls yet
    TracesPending,
    /// The upstream block has transactions the store has not ingested
    DbMissingTransactions,
    /// The upstream knows a mined transaction the store has not ingested
    DbMissingTransaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessDecision {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReadinessReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_tx_count: Option<usize>,
}

impl ReadinessDecision {
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Default::default()
        }
    }

    pub fn not_ready(reason: ReadinessReason) -> Self {
        Self {
            ready: false,
            reason: Some(reason),
            ..Default::default()
        }
    }

    /// The `-32010` error for a not-ready decision.
    ///
    /// Height decisions report `traceReadyHeight`; count decisions report the
    /// decision itself.
    pub fn into_error(self) -> TraceError {
        let data = match (self.ready_height, self.reason) {
            (Some(height), _) => Some(json!({ "traceReadyHeight": height })),
            (None, Some(_)) => serde_json::to_value(&self).ok(),
            (None, None) => None,
        };
        TraceError::NotReady(data)
    }
}

/// Decides whether an empty result reflects the chain or indexer lag
pub struct ReadinessOracle {
    config: ReadinessConfig,
    mode: ReadinessMode,
    store: Arc<dyn TraceStore>,
    upstream: Arc<dyn ChainOracle>,
}

impl ReadinessOracle {
    pub fn new(
        config: ReadinessConfig,
        store: Arc<dyn TraceStore>,
        upstream: Arc<dyn ChainOracle>,
    ) -> Self {
        let mode = config.effective_mode();
        info!(mode = mode.as_str(), "Trace readiness mode resolved");
        Self {
            config,
            mode,
            store,
            upstream,
        }
    }

    pub fn mode(&self) -> ReadinessMode {
        self.mode
    }

    /// Decide for a block with zero indexed internal calls
    pub async fn check_block(&self, block_number: u64) -> Result<ReadinessDecision> {
        let decision = match self.mode {
            ReadinessMode::None => ReadinessDecision::ready(),
            ReadinessMode::Height => self.check_height(block_number).await,
            ReadinessMode::Counts => self.check_counts(block_number).await?,
        };
        self.log_decision("block", block_number, &decision);
        Ok(decision)
    }

    /// Decide for an indexed transaction with zero indexed internal calls.
    ///
    /// In counts mode the transaction is ready iff at least one internal call
    /// is indexed for it, which cannot tell a call-free transaction from an
    /// unindexed one. Other modes defer to the transaction's block.
    pub async fn check_transaction(
        &self,
        tx_hash: B256,
        block_number: Option<u64>,
    ) -> Result<ReadinessDecision> {
        if self.mode == ReadinessMode::Counts {
            let decision = if self.store.transaction_has_traces(tx_hash).await? {
                ReadinessDecision::ready()
            } else {
                ReadinessDecision::default()
            };
            if !decision.ready {
                self.log(format_args!("transaction {tx_hash} has no indexed calls"));
            }
            return Ok(decision);
        }

        match block_number {
            Some(block_number) => self.check_block(block_number).await,
            None => Ok(ReadinessDecision::ready()),
        }
    }

    /// Highest block considered fully traced, `None` when no guard applies
    /// or the upstream head is unavailable.
    async fn ready_height(&self) -> Option<u64> {
        if let Some(height) = self.config.ready_height {
            return Some(height);
        }
        let lag = self.config.lag?;
        let head = self.upstream.head_height().await?;
        Some(head.saturating_sub(lag))
    }

    async fn check_height(&self, block_number: u64) -> ReadinessDecision {
        match self.ready_height().await {
            Some(ready_height) if block_number > ready_height => ReadinessDecision {
                ready: false,
                ready_height: Some(ready_height),
                ..Default::default()
            },
            _ => ReadinessDecision::ready(),
        }
    }

    async fn check_counts(&self, block_number: u64) -> Result<ReadinessDecision> {
        let total = self.store.block_transaction_count(block_number).await?;
        if total == 0 {
            if let Lookup::Found(block) = self.upstream.block(block_number).await {
                if block.transaction_count > 0 {
                    return Ok(ReadinessDecision {
                        upstream_tx_count: Some(block.transaction_count),
                        ..ReadinessDecision::not_ready(ReadinessReason::DbMissingTransactions)
                    });
                }
            }
            return Ok(ReadinessDecision {
                ready: true,
                reason: Some(ReadinessReason::EmptyBlock),
                ..Default::default()
            });
        }

        let traced = self
            .store
            .block_traced_transaction_count(block_number)
            .await?;
        if traced >= total {
            Ok(ReadinessDecision::ready())
        } else {
            Ok(ReadinessDecision::not_ready(ReadinessReason::TracesPending))
        }
    }

    fn log_decision(&self, scope: &str, block_number: u64, decision: &ReadinessDecision) {
        if decision.ready {
            debug!(scope, block_number, ?decision, "Trace data ready");
        } else {
            self.log(format_args!(
                "{scope} {block_number} not ready ({} mode): {decision:?}",
                self.mode.as_str()
            ));
        }
    }

    fn log(&self, message: std::fmt::Arguments<'_>) {
        if self.config.debug {
            info!("trace_ready {message}");
        } else {
            debug!("trace_ready {message}");
        }
    }
}
