//! In-memory [`TraceStore`] for tests
//!
//! Mirrors the join the Postgres queries perform: internal calls only count
//! when their parent transaction is indexed.

use std::{collections::BTreeSet, time::Duration};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use eyre::Result;
use tokio::sync::RwLock;

use crate::{StoredTransaction, StoredValue, TraceRow, TraceStore, block_param};

/// An indexed top-level transaction
#[derive(Debug, Clone, Default)]
pub struct IndexedTransaction {
    pub hash: B256,
    pub block_number: Option<u64>,
    pub block_hash: B256,
    pub index: i64,
}

/// An indexed internal call
#[derive(Debug, Clone, Default)]
pub struct InternalCall {
    pub call_type: Option<String>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub input: Vec<u8>,
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
    pub trace_address: Vec<i64>,
    pub index: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    transactions: Vec<IndexedTransaction>,
    calls: Vec<(B256, InternalCall)>,
    blocks: Option<BTreeSet<u64>>,
    failure: Option<String>,
    delay: Option<Duration>,
}

/// [`TraceStore`] holding its rows in memory
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    state: RwLock<MemoryState>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transaction(&self, tx: IndexedTransaction) {
        self.state.write().await.transactions.push(tx);
    }

    pub async fn insert_call(&self, tx_hash: B256, call: InternalCall) {
        self.state.write().await.calls.push((tx_hash, call));
    }

    /// Create the `blocks` table (if missing) and list `number` in it
    pub async fn insert_block(&self, number: u64) {
        self.state
            .write()
            .await
            .blocks
            .get_or_insert_with(BTreeSet::new)
            .insert(number);
    }

    /// Create an empty `blocks` table
    pub async fn create_blocks_table(&self) {
        self.state
            .write()
            .await
            .blocks
            .get_or_insert_with(BTreeSet::new);
    }

    /// Make every subsequent query fail with `message`
    pub async fn fail_queries(&self, message: impl Into<String>) {
        self.state.write().await.failure = Some(message.into());
    }

    /// Delay every subsequent query by `delay`
    pub async fn delay_queries(&self, delay: Duration) {
        self.state.write().await.delay = Some(delay);
    }

    async fn read(&self) -> Result<tokio::sync::RwLockReadGuard<'_, MemoryState>> {
        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.read().await;
        if let Some(message) = &state.failure {
            eyre::bail!("{message}");
        }
        Ok(state)
    }
}

impl MemoryState {
    fn rows_where(&self, matches: impl Fn(&IndexedTransaction) -> bool) -> Vec<TraceRow> {
        let mut rows: Vec<TraceRow> = self
            .calls
            .iter()
            .filter_map(|(tx_hash, call)| {
                let tx = self
                    .transactions
                    .iter()
                    .find(|tx| tx.hash == *tx_hash && matches(tx))?;
                Some(trace_row(tx, call))
            })
            .collect();
        rows.sort_by_key(|row| (row.transaction_position, row.trace_index));
        rows
    }

    fn in_block(&self, block_number: u64) -> impl Iterator<Item = &IndexedTransaction> {
        self.transactions
            .iter()
            .filter(move |tx| tx.block_number == Some(block_number))
    }
}

fn trace_row(tx: &IndexedTransaction, call: &InternalCall) -> TraceRow {
    TraceRow {
        transaction_hash: tx.hash.into(),
        block_hash: tx.block_hash.into(),
        block_number: tx
            .block_number
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or_default(),
        transaction_position: tx.index,
        call_type: call.call_type.clone(),
        from_address: call.from.into(),
        to_address: call.to.into(),
        value: call.value.to_string().into(),
        gas: call.gas.to_string().into(),
        gas_used: call.gas_used.to_string().into(),
        input: call.input.clone().into(),
        output: call.output.clone().into(),
        error: call.error.clone(),
        trace_address: StoredValue::IntArray(call.trace_address.clone()),
        trace_index: call.index,
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn block_traces(&self, block_number: u64) -> Result<Vec<TraceRow>> {
        block_param(block_number)?;
        let state = self.read().await?;
        Ok(state.rows_where(|tx| tx.block_number == Some(block_number)))
    }

    async fn transaction_traces(&self, tx_hash: B256) -> Result<Vec<TraceRow>> {
        let state = self.read().await?;
        Ok(state.rows_where(|tx| tx.hash == tx_hash))
    }

    async fn block_has_transactions(&self, block_number: u64) -> Result<bool> {
        let state = self.read().await?;
        Ok(state.in_block(block_number).next().is_some())
    }

    async fn block_in_blocks_table(&self, block_number: u64) -> Result<Option<bool>> {
        let state = self.read().await?;
        Ok(state
            .blocks
            .as_ref()
            .map(|blocks| blocks.contains(&block_number)))
    }

    async fn block_transaction_count(&self, block_number: u64) -> Result<u64> {
        let state = self.read().await?;
        Ok(state.in_block(block_number).count() as u64)
    }

    async fn block_traced_transaction_count(&self, block_number: u64) -> Result<u64> {
        let state = self.read().await?;
        let traced: BTreeSet<B256> = state
            .in_block(block_number)
            .filter(|tx| state.calls.iter().any(|(hash, _)| *hash == tx.hash))
            .map(|tx| tx.hash)
            .collect();
        Ok(traced.len() as u64)
    }

    async fn transaction(&self, tx_hash: B256) -> Result<Option<StoredTransaction>> {
        let state = self.read().await?;
        Ok(state
            .transactions
            .iter()
            .find(|tx| tx.hash == tx_hash)
            .map(|tx| StoredTransaction {
                block_number: tx.block_number,
            }))
    }

    async fn transaction_has_traces(&self, tx_hash: B256) -> Result<bool> {
        let state = self.read().await?;
        Ok(state.calls.iter().any(|(hash, _)| *hash == tx_hash))
    }

    async fn ping(&self) -> Result<()> {
        self.read().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u8, block_number: u64, index: i64) -> IndexedTransaction {
        IndexedTransaction {
            hash: B256::from([n; 32]),
            block_number: Some(block_number),
            block_hash: B256::from([block_number as u8; 32]),
            index,
        }
    }

    #[tokio::test]
    async fn test_block_traces_are_ordered() {
        let store = MemoryTraceStore::new();
        store.insert_transaction(tx(2, 7, 1)).await;
        store.insert_transaction(tx(1, 7, 0)).await;
        for (hash, index) in [(2u8, 1), (1, 1), (2, 0), (1, 0)] {
            store
                .insert_call(
                    B256::from([hash; 32]),
                    InternalCall {
                        index,
                        ..Default::default()
                    },
                )
                .await;
        }

        let rows = store.block_traces(7).await.unwrap();
        let order: Vec<(i64, i64)> = rows
            .iter()
            .map(|row| (row.transaction_position, row.trace_index))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[tokio::test]
    async fn test_counts_follow_the_join() {
        let store = MemoryTraceStore::new();
        store.insert_transaction(tx(1, 5, 0)).await;
        store.insert_transaction(tx(2, 5, 1)).await;
        store.insert_transaction(tx(3, 5, 2)).await;
        store.insert_call(B256::from([1; 32]), InternalCall::default()).await;
        store.insert_call(B256::from([1; 32]), InternalCall::default()).await;
        store.insert_call(B256::from([2; 32]), InternalCall::default()).await;
        // orphan call of an unindexed transaction
        store.insert_call(B256::from([9; 32]), InternalCall::default()).await;

        assert_eq!(store.block_transaction_count(5).await.unwrap(), 3);
        assert_eq!(store.block_traced_transaction_count(5).await.unwrap(), 2);
        assert!(store.transaction_traces(B256::from([9; 32])).await.unwrap().is_empty());
        assert!(store.transaction_has_traces(B256::from([9; 32])).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocks_table_and_failures() {
        let store = MemoryTraceStore::new();
        assert_eq!(store.block_in_blocks_table(1).await.unwrap(), None);
        store.create_blocks_table().await;
        assert_eq!(store.block_in_blocks_table(1).await.unwrap(), Some(false));
        store.insert_block(1).await;
        assert_eq!(store.block_in_blocks_table(1).await.unwrap(), Some(true));

        store.fail_queries("relation does not exist").await;
        assert!(store.ping().await.is_err());
        assert!(store.block_traces(1).await.is_err());
    }

    #[tokio::test]
    async fn test_block_number_out_of_range() {
        let store = MemoryTraceStore::new();
        assert!(store.block_traces(i64::MAX as u64).await.unwrap().is_empty());
        assert!(store.block_traces(u64::MAX).await.is_err());
    }
}
