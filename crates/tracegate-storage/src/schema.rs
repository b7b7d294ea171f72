//! Indexer schema capabilities and the query variants they select
//!
//! The indexer schema differs between deployments. It is introspected once
//! per process and the resulting [`SchemaProfile`] picks one of a closed set
//! of precompiled statements. Only capability flags select a statement; user
//! input is always bound as a parameter.

use std::future::Future;

use eyre::Result;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Indexer tables read by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Top-level transactions (`hash`, `block_number`, `block_hash`, `index`)
    Transactions,
    /// Indexed internal calls
    InternalTransactions,
    /// Optional block headers table
    Blocks,
}

impl Table {
    /// Get table name as string
    pub fn name(self) -> &'static str {
        match self {
            Table::Transactions => "transactions",
            Table::InternalTransactions => "internal_transactions",
            Table::Blocks => "blocks",
        }
    }
}

/// What the connected indexer schema supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaProfile {
    /// `internal_transactions.call_type` exists next to the legacy `type` column
    pub has_normalized_call_type_column: bool,
    /// `transactions.hash` is `bytea` rather than text
    pub transaction_hash_is_binary: bool,
    /// The optional `blocks` table exists
    pub has_blocks_table: bool,
}

/// Computes the [`SchemaProfile`] at most once per process.
///
/// Concurrent first callers wait on the same in-flight probe. A failed probe
/// leaves the adapter empty so the next caller probes again.
#[derive(Debug, Default)]
pub struct SchemaAdapter {
    profile: OnceCell<SchemaProfile>,
}

impl SchemaAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached profile, running `probe` if none is cached yet.
    pub async fn profile_with<F, Fut>(&self, probe: F) -> Result<SchemaProfile>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaProfile>>,
    {
        let profile = self
            .profile
            .get_or_try_init(|| async {
                debug!("Probing indexer schema");
                let profile = probe().await?;
                info!(?profile, "Indexer schema profile cached");
                Ok::<_, eyre::Report>(profile)
            })
            .await?;
        Ok(*profile)
    }

    /// The cached profile, if a probe has completed.
    pub fn cached(&self) -> Option<SchemaProfile> {
        self.profile.get().copied()
    }
}

pub(crate) const CALL_TYPE_COLUMN_SQL: &str = "SELECT 1 \
     FROM information_schema.columns \
     WHERE table_schema = 'public' \
       AND table_name = 'internal_transactions' \
       AND column_name = 'call_type' \
     LIMIT 1";

pub(crate) const HASH_COLUMN_TYPE_SQL: &str = "SELECT data_type::text \
     FROM information_schema.columns \
     WHERE table_schema = 'public' \
       AND table_name = 'transactions' \
       AND column_name = 'hash' \
     LIMIT 1";

pub(crate) const BLOCKS_TABLE_SQL: &str = "SELECT 1 \
     FROM information_schema.tables \
     WHERE table_schema = 'public' AND table_name = 'blocks' \
     LIMIT 1";

pub(crate) const BLOCK_HAS_TRANSACTIONS_SQL: &str =
    "SELECT 1 FROM transactions WHERE block_number = $1 LIMIT 1";

pub(crate) const BLOCK_IN_BLOCKS_TABLE_SQL: &str =
    "SELECT 1 FROM blocks WHERE number = $1 LIMIT 1";

pub(crate) const BLOCK_TX_COUNT_SQL: &str =
    "SELECT COUNT(*)::bigint AS tx_count FROM transactions WHERE block_number = $1";

pub(crate) const BLOCK_TRACED_TX_COUNT_SQL: &str = "SELECT COUNT(DISTINCT it.transaction_hash)::bigint AS traced_tx_count \
     FROM internal_transactions it \
     JOIN transactions t ON it.transaction_hash = t.hash \
     WHERE t.block_number = $1";

pub(crate) const TRANSACTION_BLOCK_SQL: &str =
    "SELECT block_number::bigint AS block_number FROM transactions WHERE hash = $1 LIMIT 1";

pub(crate) const TRANSACTION_HAS_TRACES_SQL: &str =
    "SELECT 1 FROM internal_transactions WHERE transaction_hash = $1 LIMIT 1";

macro_rules! trace_select {
    ($call_type:literal, $filter:literal) => {
        concat!(
            "SELECT \
               t.hash AS transaction_hash, \
               t.block_hash, \
               t.block_number::bigint AS block_number, \
               t.index::bigint AS transaction_position, ",
            $call_type,
            " AS call_type, \
               it.from_address_hash, \
               it.to_address_hash, \
               it.value::text AS value, \
               it.gas::text AS gas, \
               it.gas_used::text AS gas_used, \
               it.input, \
               it.output, \
               it.error, \
               it.trace_address, \
               it.index::bigint AS trace_index \
             FROM internal_transactions it \
             JOIN transactions t ON it.transaction_hash = t.hash \
             WHERE ",
            $filter,
            " ORDER BY t.index, it.index"
        )
    };
}

const BLOCK_TRACES_NORMALIZED_SQL: &str = trace_select!(
    "COALESCE(it.call_type::text, it.type::text)",
    "t.block_number = $1"
);
const BLOCK_TRACES_LEGACY_SQL: &str = trace_select!("it.type::text", "t.block_number = $1");
const TX_TRACES_NORMALIZED_SQL: &str = trace_select!(
    "COALESCE(it.call_type::text, it.type::text)",
    "t.hash = $1"
);
const TX_TRACES_LEGACY_SQL: &str = trace_select!("it.type::text", "t.hash = $1");

/// Primary trace query, keyed by block or by transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceQuery {
    ByBlock,
    ByTransaction,
}

impl TraceQuery {
    /// The precompiled statement for this query under `profile`.
    ///
    /// Rows are ordered by `(transaction position, trace index)`.
    pub fn sql(self, profile: &SchemaProfile) -> &'static str {
        match (self, profile.has_normalized_call_type_column) {
            (TraceQuery::ByBlock, true) => BLOCK_TRACES_NORMALIZED_SQL,
            (TraceQuery::ByBlock, false) => BLOCK_TRACES_LEGACY_SQL,
            (TraceQuery::ByTransaction, true) => TX_TRACES_NORMALIZED_SQL,
            (TraceQuery::ByTransaction, false) => TX_TRACES_LEGACY_SQL,
        }
    }
}
