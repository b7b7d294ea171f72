//! Postgres connection pool and row decoding
//!
//! The pool connects lazily so the process can start while the indexer
//! database is still coming up; the health endpoint reports the difference.

use std::time::Duration;

use eyre::{Context, Result};
use sqlx::{
    Row,
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode},
};
use tracegate_config::DatabaseConfig;
use tracing::info;

use crate::codec::{StoredValue, TraceRow};

/// Build the shared, size-bounded connection pool for the indexer database
pub fn connect_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let options = connect_options(config)?;

    info!(
        host = %config.host,
        database = %config.name,
        pool_size = config.pool_size,
        ssl = config.ssl,
        "Initializing indexer database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .connect_lazy_with(options);

    Ok(pool)
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    let mut options = match &config.url {
        Some(url) => url
            .parse::<PgConnectOptions>()
            .context("Failed to parse database URL")?,
        None => {
            let mut options = PgConnectOptions::new()
                .host(&config.host)
                .port(config.port)
                .database(&config.name);
            if let Some(user) = &config.user {
                options = options.username(user);
            }
            if let Some(password) = &config.password {
                options = options.password(password);
            }
            options
        }
    };

    options = options.ssl_mode(match (config.ssl, config.ssl_reject_unauthorized) {
        (false, _) => PgSslMode::Disable,
        (true, true) => PgSslMode::VerifyFull,
        (true, false) => PgSslMode::Require,
    });

    Ok(options)
}

/// Decode a column without assuming its Postgres type.
///
/// Each candidate type is tried in turn; a column that matches none of them
/// decodes as [`StoredValue::Null`].
pub(crate) fn stored_value(row: &PgRow, column: &str) -> StoredValue {
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(column) {
        return value.into();
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(column) {
        return value.into();
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(column) {
        return value.map(i64::from).into();
    }
    if let Ok(value) = row.try_get::<Option<Vec<i32>>, _>(column) {
        return value
            .map(|items| items.into_iter().map(i64::from).collect::<Vec<_>>())
            .into();
    }
    if let Ok(value) = row.try_get::<Option<Vec<i64>>, _>(column) {
        return value.into();
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(column) {
        return value.into();
    }
    StoredValue::Null
}

fn optional_text(row: &PgRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column).ok().flatten()
}

fn integer(row: &PgRow, column: &str) -> i64 {
    row.try_get::<Option<i64>, _>(column)
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Decode one row of a primary trace query
pub(crate) fn trace_row(row: &PgRow) -> TraceRow {
    TraceRow {
        transaction_hash: stored_value(row, "transaction_hash"),
        block_hash: stored_value(row, "block_hash"),
        block_number: integer(row, "block_number"),
        transaction_position: integer(row, "transaction_position"),
        call_type: optional_text(row, "call_type"),
        from_address: stored_value(row, "from_address_hash"),
        to_address: stored_value(row, "to_address_hash"),
        value: stored_value(row, "value"),
        gas: stored_value(row, "gas"),
        gas_used: stored_value(row, "gas_used"),
        input: stored_value(row, "input"),
        output: stored_value(row, "output"),
        error: optional_text(row, "error"),
        trace_address: stored_value(row, "trace_address"),
        trace_index: integer(row, "trace_index"),
    }
}
