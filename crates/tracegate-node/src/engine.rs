//! Trace query engine
//!
//! Runs the primary trace query for a block or transaction and, when it comes
//! back empty, walks the fallback tree: store existence, the optional blocks
//! table, the upstream node and finally the readiness oracle.

use std::{future::Future, sync::Arc, time::Duration};

use alloy_primitives::B256;
use serde_json::json;
use tracegate_config::{ReadinessConfig, ReadinessMode};
use tracegate_storage::{TraceRow, TraceStore};
use tracing::{debug, error};

use crate::{
    error::TraceError,
    format::{TraceObject, format_trace_rows},
    readiness::{ReadinessOracle, ReadinessReason},
    rpc::{
        JsonRpcRequest, JsonRpcResponse, TRACE_BLOCK, TRACE_TRANSACTION, parse_block_param,
        parse_transaction_param,
    },
    upstream::{ChainOracle, Lookup, UpstreamTransaction},
};

/// Answers `trace_block` and `trace_transaction`
pub struct TraceEngine {
    store: Arc<dyn TraceStore>,
    upstream: Arc<dyn ChainOracle>,
    readiness: ReadinessOracle,
    query_timeout: Duration,
}

impl TraceEngine {
    pub fn new(
        store: Arc<dyn TraceStore>,
        upstream: Arc<dyn ChainOracle>,
        readiness: ReadinessConfig,
        query_timeout: Duration,
    ) -> Self {
        let readiness = ReadinessOracle::new(readiness, store.clone(), upstream.clone());
        Self {
            store,
            upstream,
            readiness,
            query_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Whether `method` is answered here rather than forwarded upstream
    pub fn handles(method: &str) -> bool {
        matches!(method, TRACE_BLOCK | TRACE_TRANSACTION)
    }

    /// Answer a trace request; `None` for methods this engine does not serve.
    pub async fn handle(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let method = request.method.as_str();
        let params = request.params.as_ref();
        let result = match method {
            TRACE_BLOCK => match parse_block_param(params) {
                Ok(number) => self.trace_block(number).await,
                Err(err) => Err(err),
            },
            TRACE_TRANSACTION => match parse_transaction_param(params) {
                Ok(hash) => self.trace_transaction(hash).await,
                Err(err) => Err(err),
            },
            _ => return None,
        };

        let response = match result.and_then(|traces| {
            serde_json::to_value(traces).map_err(|err| TraceError::Store(err.into()))
        }) {
            Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
            Err(err) => {
                if err.is_internal() {
                    error!(method, error = %err, "Trace request failed");
                } else {
                    debug!(method, error = %err, "Trace request rejected");
                }
                JsonRpcResponse::failure(request.id.clone(), err.to_rpc_error(method))
            }
        };
        Some(response)
    }

    /// Traces of every indexed transaction in block `number`
    pub async fn trace_block(&self, number: u64) -> Result<Vec<TraceObject>, TraceError> {
        let store = self.store.clone();
        let rows = self
            .primary(async move { store.block_traces(number).await })
            .await?;
        if !rows.is_empty() {
            debug!(block_number = number, traces = rows.len(), "Block traces found");
            return Ok(format_trace_rows(&rows));
        }

        if !self.block_exists(number).await? {
            return Err(TraceError::BlockNotFound);
        }
        self.ensure_block_ready(number).await?;
        Ok(Vec::new())
    }

    /// Traces of transaction `hash`
    pub async fn trace_transaction(&self, hash: B256) -> Result<Vec<TraceObject>, TraceError> {
        let store = self.store.clone();
        let rows = self
            .primary(async move { store.transaction_traces(hash).await })
            .await?;
        if !rows.is_empty() {
            debug!(tx_hash = %hash, traces = rows.len(), "Transaction traces found");
            return Ok(format_trace_rows(&rows));
        }

        if let Some(tx) = self.store.transaction(hash).await? {
            let decision = self
                .readiness
                .check_transaction(hash, tx.block_number)
                .await?;
            if !decision.ready {
                return Err(decision.into_error());
            }
            return Ok(Vec::new());
        }

        match self.upstream.transaction(hash).await {
            Lookup::Missing => return Err(TraceError::TransactionNotFound),
            Lookup::Found(UpstreamTransaction {
                block_number: Some(block_number),
            }) => {
                if self.readiness.mode() == ReadinessMode::Counts {
                    return Err(TraceError::NotReady(Some(
                        json!({ "reason": ReadinessReason::DbMissingTransaction }),
                    )));
                }
                self.ensure_block_ready(block_number).await?;
            }
            // pending on chain, or the upstream could not tell
            Lookup::Found(_) | Lookup::Unavailable => {}
        }
        Ok(Vec::new())
    }

    /// Run a primary query against the timeout.
    ///
    /// The query runs on its own task, so a timed-out query keeps going at the
    /// store until it settles.
    async fn primary<F>(&self, query: F) -> Result<Vec<TraceRow>, TraceError>
    where
        F: Future<Output = eyre::Result<Vec<TraceRow>>> + Send + 'static,
    {
        let task = tokio::spawn(query);
        match tokio::time::timeout(self.query_timeout, task).await {
            Ok(Ok(rows)) => Ok(rows?),
            Ok(Err(err)) => Err(TraceError::Store(eyre::eyre!("trace query task failed: {err}"))),
            Err(_) => Err(TraceError::QueryTimeout(self.query_timeout)),
        }
    }

    /// Whether block `number` exists, assuming it does unless the upstream
    /// definitively says otherwise.
    async fn block_exists(&self, number: u64) -> Result<bool, TraceError> {
        if self.store.block_has_transactions(number).await? {
            return Ok(true);
        }
        if self.store.block_in_blocks_table(number).await? == Some(true) {
            return Ok(true);
        }
        Ok(self.upstream.block_exists(number).await.assume_exists())
    }

    async fn ensure_block_ready(&self, number: u64) -> Result<(), TraceError> {
        let decision = self.readiness.check_block(number).await?;
        if decision.ready {
            Ok(())
        } else {
            Err(decision.into_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy_primitives::{Address, U256};
    use async_trait::async_trait;
    use serde_json::Value;
    use tracegate_storage::memory::{IndexedTransaction, InternalCall, MemoryTraceStore};

    use super::*;
    use crate::upstream::UpstreamBlock;

    struct StubChain {
        block: Lookup<UpstreamBlock>,
        transaction: Lookup<UpstreamTransaction>,
        calls: AtomicUsize,
    }

    impl StubChain {
        fn new(block: Lookup<UpstreamBlock>, transaction: Lookup<UpstreamTransaction>) -> Self {
            Self {
                block,
                transaction,
                calls: AtomicUsize::new(0),
            }
        }

        fn unavailable() -> Self {
            Self::new(Lookup::Unavailable, Lookup::Unavailable)
        }
    }

    #[async_trait]
    impl ChainOracle for StubChain {
        async fn block(&self, _number: u64) -> Lookup<UpstreamBlock> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.block.clone()
        }

        async fn transaction(&self, _hash: B256) -> Lookup<UpstreamTransaction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.transaction.clone()
        }

        async fn head_height(&self) -> Option<u64> {
            None
        }
    }

    fn mode(mode: ReadinessMode) -> ReadinessConfig {
        ReadinessConfig {
            mode: Some(mode),
            ..Default::default()
        }
    }

    fn engine(
        store: Arc<MemoryTraceStore>,
        chain: Arc<StubChain>,
        readiness: ReadinessConfig,
    ) -> TraceEngine {
        TraceEngine::new(store, chain, readiness, Duration::from_secs(5))
    }

    fn tx_hash(n: u8) -> B256 {
        B256::from([n; 32])
    }

    /// Block with `total` transactions, the first `traced` of which carry
    /// two internal calls each, inserted out of order.
    async fn seed_block(store: &MemoryTraceStore, number: u64, total: u8, traced: u8) {
        for i in (0..total).rev() {
            let hash = tx_hash(i + 1);
            store
                .insert_transaction(IndexedTransaction {
                    hash,
                    block_number: Some(number),
                    block_hash: B256::from([0xbb; 32]),
                    index: i64::from(i),
                })
                .await;
            if i < traced {
                for index in (0..2).rev() {
                    store
                        .insert_call(
                            hash,
                            InternalCall {
                                call_type: Some("call".to_string()),
                                from: Some(Address::repeat_byte(0xaa)),
                                to: Some(Address::repeat_byte(0xcc)),
                                value: U256::from(index),
                                gas: 21_000,
                                trace_address: if index == 0 { vec![] } else { vec![0] },
                                index,
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        }
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_block_is_not_found() {
        let chain = Arc::new(StubChain::new(Lookup::Missing, Lookup::Unavailable));
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            chain,
            mode(ReadinessMode::None),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x1"])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32001);
        assert_eq!(error.message, "Block not found");
    }

    #[tokio::test]
    async fn test_unknown_upstream_assumes_block_exists() {
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::None),
        );
        assert!(engine.trace_block(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocks_table_confirms_existence() {
        let store = Arc::new(MemoryTraceStore::new());
        store.insert_block(7).await;
        let chain = Arc::new(StubChain::new(Lookup::Missing, Lookup::Unavailable));
        let engine = engine(store, chain.clone(), mode(ReadinessMode::None));

        assert!(engine.trace_block(7).await.unwrap().is_empty());
        assert_eq!(chain.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            engine.trace_block(8).await,
            Err(TraceError::BlockNotFound)
        ));
    }

    #[tokio::test]
    async fn test_traces_pending() {
        let store = Arc::new(MemoryTraceStore::new());
        seed_block(&store, 5, 3, 0).await;
        let engine = engine(
            store,
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::Counts),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x5"])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32010);
        assert_eq!(error.message, "Trace data not ready");
        assert_eq!(error.data.unwrap()["reason"], "traces_pending");
    }

    #[tokio::test]
    async fn test_unindexed_block_known_upstream() {
        let chain = Arc::new(StubChain::new(
            Lookup::Found(UpstreamBlock {
                transaction_count: 3,
            }),
            Lookup::Unavailable,
        ));
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            chain,
            mode(ReadinessMode::Counts),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x9"])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32010);
        assert_eq!(
            error.data.unwrap(),
            json!({ "ready": false, "reason": "db_missing_transactions", "upstreamTxCount": 3 })
        );
    }

    #[tokio::test]
    async fn test_block_number_beyond_store_range() {
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::None),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x8000000000000000"])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "trace_block query failed");
    }

    #[tokio::test]
    async fn test_partially_traced_block_returns_indexed_rows() {
        let store = Arc::new(MemoryTraceStore::new());
        seed_block(&store, 5, 3, 2).await;
        let engine = engine(
            store,
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::Counts),
        );

        // rows exist, so readiness is not consulted
        assert_eq!(engine.trace_block(5).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fully_traced_block_is_ordered() {
        let store = Arc::new(MemoryTraceStore::new());
        seed_block(&store, 5, 3, 3).await;
        let engine = engine(
            store,
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::Counts),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x5"])))
            .await
            .unwrap();
        assert!(response.error.is_none());
        let traces = response.result.unwrap();
        let order: Vec<(i64, Value)> = traces
            .as_array()
            .unwrap()
            .iter()
            .map(|trace| {
                (
                    trace["transactionPosition"].as_i64().unwrap(),
                    trace["traceAddress"].clone(),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                (0, json!([])),
                (0, json!([0])),
                (1, json!([])),
                (1, json!([0])),
                (2, json!([])),
                (2, json!([0])),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_transaction_pending_upstream_is_empty() {
        let chain = Arc::new(StubChain::new(
            Lookup::Unavailable,
            Lookup::Found(UpstreamTransaction { block_number: None }),
        ));
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            chain,
            mode(ReadinessMode::Counts),
        );

        let hash = format!("0x{}", "ab".repeat(32));
        let response = engine
            .handle(&request(TRACE_TRANSACTION, json!([hash])))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!([])));
    }

    #[tokio::test]
    async fn test_transaction_lookup_outcomes() {
        let store = Arc::new(MemoryTraceStore::new());

        let missing = engine(
            store.clone(),
            Arc::new(StubChain::new(Lookup::Unavailable, Lookup::Missing)),
            mode(ReadinessMode::None),
        );
        assert!(matches!(
            missing.trace_transaction(tx_hash(9)).await,
            Err(TraceError::TransactionNotFound)
        ));

        let unavailable = engine(
            store.clone(),
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::None),
        );
        assert!(unavailable.trace_transaction(tx_hash(9)).await.unwrap().is_empty());

        let mined = Arc::new(StubChain::new(
            Lookup::Unavailable,
            Lookup::Found(UpstreamTransaction {
                block_number: Some(12),
            }),
        ));
        let counts = engine(store.clone(), mined.clone(), mode(ReadinessMode::Counts));
        let Err(TraceError::NotReady(Some(data))) = counts.trace_transaction(tx_hash(9)).await else {
            panic!("expected not ready");
        };
        assert_eq!(data, json!({ "reason": "db_missing_transaction" }));

        let height = engine(
            store,
            mined,
            ReadinessConfig {
                ready_height: Some(10),
                ..Default::default()
            },
        );
        let Err(TraceError::NotReady(Some(data))) = height.trace_transaction(tx_hash(9)).await else {
            panic!("expected not ready");
        };
        assert_eq!(data, json!({ "traceReadyHeight": 10 }));
    }

    #[tokio::test]
    async fn test_indexed_transaction_without_calls() {
        let store = Arc::new(MemoryTraceStore::new());
        seed_block(&store, 5, 2, 1).await;

        let counts = engine(
            store.clone(),
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::Counts),
        );
        assert_eq!(counts.trace_transaction(tx_hash(1)).await.unwrap().len(), 2);
        assert!(matches!(
            counts.trace_transaction(tx_hash(2)).await,
            Err(TraceError::NotReady(None))
        ));

        let none = engine(
            store,
            Arc::new(StubChain::unavailable()),
            mode(ReadinessMode::None),
        );
        assert!(none.trace_transaction(tx_hash(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_timeout_is_internal_failure() {
        let store = Arc::new(MemoryTraceStore::new());
        store.delay_queries(Duration::from_millis(500)).await;
        let engine = TraceEngine::new(
            store,
            Arc::new(StubChain::unavailable()),
            ReadinessConfig::default(),
            Duration::from_millis(20),
        );

        assert!(matches!(
            engine.trace_block(1).await,
            Err(TraceError::QueryTimeout(_))
        ));
        let response = engine
            .handle(&request(TRACE_TRANSACTION, json!([format!("0x{}", "00".repeat(32))])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "trace_transaction query failed");
    }

    #[tokio::test]
    async fn test_store_failure_hides_details() {
        let store = Arc::new(MemoryTraceStore::new());
        store.fail_queries("relation \"internal_transactions\" does not exist").await;
        let engine = engine(
            store,
            Arc::new(StubChain::unavailable()),
            ReadinessConfig::default(),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["0x1"])))
            .await
            .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "trace_block query failed");
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn test_invalid_params_and_other_methods() {
        let engine = engine(
            Arc::new(MemoryTraceStore::new()),
            Arc::new(StubChain::unavailable()),
            ReadinessConfig::default(),
        );

        let response = engine
            .handle(&request(TRACE_BLOCK, json!(["latest"])))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);

        assert!(engine.handle(&request("eth_chainId", json!([]))).await.is_none());
        assert!(TraceEngine::handles(TRACE_TRANSACTION));
        assert!(!TraceEngine::handles("eth_blockNumber"));
    }
}
