//! tracegate storage layer
//!
//! Read-only access to an indexer's relational store: the internal calls of a
//! block or transaction, plus the existence and count lookups used to decide
//! whether an empty result is final.

pub mod codec;
pub mod database;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod normalize;
pub mod schema;

use alloy_primitives::B256;
use async_trait::async_trait;
pub use codec::{StoredTransaction, StoredValue, TraceRow};
use eyre::{Context, Result};
pub use schema::{SchemaAdapter, SchemaProfile, Table, TraceQuery};
use sqlx::{
    Postgres, Row,
    postgres::{PgArguments, PgPool},
    query::Query,
};
use tracegate_config::DatabaseConfig;
use tracing::{debug, info};

/// Read access to indexed transactions and internal calls
#[async_trait]
pub trait TraceStore: Send + Sync + 'static {
    /// All internal calls of a block, ordered by `(transaction position, trace index)`
    async fn block_traces(&self, block_number: u64) -> Result<Vec<TraceRow>>;

    /// All internal calls of a transaction, ordered by trace index
    async fn transaction_traces(&self, tx_hash: B256) -> Result<Vec<TraceRow>>;

    /// Whether any transaction is indexed for the block
    async fn block_has_transactions(&self, block_number: u64) -> Result<bool>;

    /// Whether the `blocks` table lists the block; `None` when there is no such table
    async fn block_in_blocks_table(&self, block_number: u64) -> Result<Option<bool>>;

    /// Number of indexed transactions in the block
    async fn block_transaction_count(&self, block_number: u64) -> Result<u64>;

    /// Number of distinct transactions of the block with at least one internal call
    async fn block_traced_transaction_count(&self, block_number: u64) -> Result<u64>;

    /// The indexed transaction, if the store has it
    async fn transaction(&self, tx_hash: B256) -> Result<Option<StoredTransaction>>;

    /// Whether at least one internal call is indexed for the transaction
    async fn transaction_has_traces(&self, tx_hash: B256) -> Result<bool>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<()>;

    /// Release connections on shutdown
    async fn close(&self) {}
}

pub(crate) fn block_param(block_number: u64) -> Result<i64> {
    i64::try_from(block_number).context("Block number exceeds the store's range")
}

fn hash_hex(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash.as_slice()))
}

fn bind_hash<'q>(
    query: Query<'q, Postgres, PgArguments>,
    profile: &SchemaProfile,
    hash: &B256,
) -> Query<'q, Postgres, PgArguments> {
    if profile.transaction_hash_is_binary {
        query.bind(hash.as_slice().to_vec())
    } else {
        query.bind(hash_hex(hash))
    }
}

/// Indexer store backed by a Postgres connection pool
pub struct PgTraceStore {
    pool: PgPool,
    schema: SchemaAdapter,
}

impl PgTraceStore {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: SchemaAdapter::new(),
        }
    }

    /// Create a store with a lazily connecting pool built from `config`
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = database::connect_pool(config)?;
        Ok(Self::new(pool))
    }

    /// The schema capability profile, probed on first use
    pub async fn profile(&self) -> Result<SchemaProfile> {
        self.schema.profile_with(|| self.probe_schema()).await
    }

    async fn probe_schema(&self) -> Result<SchemaProfile> {
        let call_type = sqlx::query(schema::CALL_TYPE_COLUMN_SQL)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to probe internal_transactions.call_type")?;

        let hash_type: Option<String> = sqlx::query_scalar(schema::HASH_COLUMN_TYPE_SQL)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to probe transactions.hash column type")?;

        let blocks = sqlx::query(schema::BLOCKS_TABLE_SQL)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to probe blocks table")?;

        Ok(SchemaProfile {
            has_normalized_call_type_column: call_type.is_some(),
            transaction_hash_is_binary: hash_type.as_deref() == Some("bytea"),
            has_blocks_table: blocks.is_some(),
        })
    }

    async fn count(&self, sql: &'static str, block_number: u64, table: Table) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .bind(block_param(block_number)?)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count rows of {}", table.name()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl TraceStore for PgTraceStore {
    async fn block_traces(&self, block_number: u64) -> Result<Vec<TraceRow>> {
        let profile = self.profile().await?;
        let rows = sqlx::query(TraceQuery::ByBlock.sql(&profile))
            .bind(block_param(block_number)?)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query block traces")?;
        debug!(block_number, rows = rows.len(), "Fetched block traces");
        Ok(rows.iter().map(database::trace_row).collect())
    }

    async fn transaction_traces(&self, tx_hash: B256) -> Result<Vec<TraceRow>> {
        let profile = self.profile().await?;
        let query = sqlx::query(TraceQuery::ByTransaction.sql(&profile));
        let rows = bind_hash(query, &profile, &tx_hash)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query transaction traces")?;
        debug!(%tx_hash, rows = rows.len(), "Fetched transaction traces");
        Ok(rows.iter().map(database::trace_row).collect())
    }

    async fn block_has_transactions(&self, block_number: u64) -> Result<bool> {
        let row = sqlx::query(schema::BLOCK_HAS_TRANSACTIONS_SQL)
            .bind(block_param(block_number)?)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query {}", Table::Transactions.name()))?;
        Ok(row.is_some())
    }

    async fn block_in_blocks_table(&self, block_number: u64) -> Result<Option<bool>> {
        if !self.profile().await?.has_blocks_table {
            return Ok(None);
        }
        let row = sqlx::query(schema::BLOCK_IN_BLOCKS_TABLE_SQL)
            .bind(block_param(block_number)?)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query {}", Table::Blocks.name()))?;
        Ok(Some(row.is_some()))
    }

    async fn block_transaction_count(&self, block_number: u64) -> Result<u64> {
        self.count(schema::BLOCK_TX_COUNT_SQL, block_number, Table::Transactions)
            .await
    }

    async fn block_traced_transaction_count(&self, block_number: u64) -> Result<u64> {
        self.count(
            schema::BLOCK_TRACED_TX_COUNT_SQL,
            block_number,
            Table::InternalTransactions,
        )
        .await
    }

    async fn transaction(&self, tx_hash: B256) -> Result<Option<StoredTransaction>> {
        let profile = self.profile().await?;
        let query = sqlx::query(schema::TRANSACTION_BLOCK_SQL);
        let row = bind_hash(query, &profile, &tx_hash)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query {}", Table::Transactions.name()))?;

        Ok(row.map(|row| {
            let block_number = row
                .try_get::<Option<i64>, _>("block_number")
                .ok()
                .flatten()
                .and_then(|n| u64::try_from(n).ok());
            StoredTransaction { block_number }
        }))
    }

    async fn transaction_has_traces(&self, tx_hash: B256) -> Result<bool> {
        let profile = self.profile().await?;
        let query = sqlx::query(schema::TRANSACTION_HAS_TRACES_SQL);
        let row = bind_hash(query, &profile, &tx_hash)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query {}", Table::InternalTransactions.name()))?;
        Ok(row.is_some())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Waits for checked-out connections to return
    async fn close(&self) {
        info!("Closing indexer database pool");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_param_range() {
        assert_eq!(block_param(5).unwrap(), 5);
        assert!(block_param(u64::MAX).is_err());
    }

    #[test]
    fn test_hash_hex_is_lowercase() {
        let hash = B256::from([0xAB; 32]);
        assert_eq!(hash_hex(&hash), format!("0x{}", "ab".repeat(32)));
    }

    #[tokio::test]
    async fn test_store_over_lazy_pool() {
        let config = DatabaseConfig {
            port: 1,
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let store = PgTraceStore::connect(&config).unwrap();
        assert!(store.schema.cached().is_none());
        // nothing listens on port 1
        assert!(store.ping().await.is_err());
        assert!(store.profile().await.is_err());
        assert!(store.schema.cached().is_none());
    }
}
