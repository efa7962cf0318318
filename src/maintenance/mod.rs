//! Database maintenance: idempotent schema statements, live table rebuilds,
//! and system log flushing.

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::statements::{self, QualifiedTable, StatementError};
use crate::db::{EndpointError, SqlEndpoint};

/// Ordered schema statements for the measurement tables.
///
/// Every statement is idempotent (`IF NOT EXISTS`) so the list is safe to
/// run on every invocation.
pub const SCHEMA: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS wspr",
    r"CREATE TABLE IF NOT EXISTS wspr.rx_spots
(
    id        UInt64,
    time      DateTime('UTC') CODEC(Delta, ZSTD(1)),
    band      Int16,
    rx_sign   LowCardinality(String),
    rx_grid   String,
    tx_sign   LowCardinality(String),
    tx_grid   String,
    snr       Int8,
    freq      Float64,
    drift     Int8,
    power     Int8,
    code      Int8,
    version   LowCardinality(String)
)
ENGINE = MergeTree
PARTITION BY toYYYYMM(time)
ORDER BY (band, time, id)
SETTINGS index_granularity = 8192",
    r"CREATE TABLE IF NOT EXISTS wspr.noise_stats
(
    time      DateTime('UTC') CODEC(Delta, ZSTD(1)),
    site      LowCardinality(String),
    receiver  LowCardinality(String),
    band      Int16,
    rms_level Float32,
    c2_level  Float32,
    ov        Int32
)
ENGINE = MergeTree
PARTITION BY toYYYYMM(time)
ORDER BY (site, receiver, band, time)
SETTINGS index_granularity = 8192",
];

/// System log tables truncated by [`flush_logs`].
const LOG_TABLES: &[&str] = &[
    "system.query_log",
    "system.query_thread_log",
    "system.trace_log",
    "system.metric_log",
    "system.asynchronous_metric_log",
    "system.part_log",
];

/// Errors raised by maintenance operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MaintainError {
    /// Raised when a rebuild names a table outside the schema list.
    #[error("no schema definition for table {table}")]
    UnknownTable {
        /// The unmatched qualified name.
        table: String,
    },
    /// Raised when statement construction fails.
    #[error("statement construction failed: {0}")]
    Statement(#[from] StatementError),
    /// Raised when an endpoint rejects a statement.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Outcome of one live table rebuild.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RebuildReport {
    /// Qualified table name.
    pub table: String,
    /// Row count before the swap.
    pub rows_before: u64,
    /// Row count after the swap (duplicates collapse during the copy).
    pub rows_after: u64,
}

/// Applies the schema statement list to `endpoint`.
///
/// # Errors
///
/// Returns [`MaintainError::Endpoint`] when a statement fails.
pub async fn ensure_schema(endpoint: &dyn SqlEndpoint) -> Result<(), MaintainError> {
    for ddl in SCHEMA {
        debug!(endpoint = endpoint.name(), "applying schema statement");
        endpoint.execute(ddl).await?;
    }
    info!(
        endpoint = endpoint.name(),
        statements = SCHEMA.len(),
        "schema ensured"
    );
    Ok(())
}

/// Returns the schema statement defining `table`, when one exists.
#[must_use]
pub fn schema_ddl_for(table: &QualifiedTable) -> Option<&'static str> {
    let marker = format!("TABLE IF NOT EXISTS {table}");
    SCHEMA.iter().copied().find(|ddl| ddl.contains(&marker))
}

/// Rebuilds `table` to its current schema definition via an atomic swap.
///
/// The replacement table is created from the schema list, rows are copied
/// with `SELECT DISTINCT` (collapsing duplicates during the migration), the
/// tables are exchanged, and the retired copy is dropped.
///
/// # Errors
///
/// Returns [`MaintainError::UnknownTable`] when the schema list does not
/// define `table`, and [`MaintainError::Endpoint`] when a statement fails.
pub async fn rebuild_table(
    endpoint: &dyn SqlEndpoint,
    table: &QualifiedTable,
) -> Result<RebuildReport, MaintainError> {
    let suffix = Uuid::new_v4().simple().to_string();
    rebuild_table_with_suffix(endpoint, table, &suffix).await
}

/// Rebuilds with a caller-supplied replacement-table suffix.
///
/// Exposed so tests can pin the replacement name; production callers use
/// [`rebuild_table`], which generates a unique suffix.
///
/// # Errors
///
/// Returns the same errors as [`rebuild_table`].
pub async fn rebuild_table_with_suffix(
    endpoint: &dyn SqlEndpoint,
    table: &QualifiedTable,
    suffix: &str,
) -> Result<RebuildReport, MaintainError> {
    let ddl = schema_ddl_for(table).ok_or_else(|| MaintainError::UnknownTable {
        table: table.to_string(),
    })?;
    let replacement = table.suffixed(&format!("rebuild_{suffix}"))?;
    let create = ddl.replacen(
        &format!("CREATE TABLE IF NOT EXISTS {table}"),
        &format!("CREATE TABLE {replacement}"),
        1,
    );

    let rows_before = endpoint
        .fetch_count(&statements::count_rows(table))
        .await?;
    endpoint.execute(&create).await?;
    endpoint
        .execute(&format!(
            "INSERT INTO {replacement} SELECT DISTINCT * FROM {table}"
        ))
        .await?;
    endpoint
        .execute(&statements::exchange_tables(table, &replacement))
        .await?;
    endpoint
        .execute(&statements::drop_table(&replacement))
        .await?;
    let rows_after = endpoint
        .fetch_count(&statements::count_rows(table))
        .await?;

    info!(
        endpoint = endpoint.name(),
        table = %table,
        rows_before,
        rows_after,
        "table rebuilt"
    );
    Ok(RebuildReport {
        table: table.to_string(),
        rows_before,
        rows_after,
    })
}

/// Flushes ClickHouse system logs and truncates the log tables.
///
/// # Errors
///
/// Returns [`MaintainError::Endpoint`] when a statement fails.
pub async fn flush_logs(endpoint: &dyn SqlEndpoint) -> Result<(), MaintainError> {
    endpoint.execute("SYSTEM FLUSH LOGS").await?;
    for table in LOG_TABLES {
        endpoint
            .execute(&format!("TRUNCATE TABLE IF EXISTS {table}"))
            .await?;
    }
    info!(
        endpoint = endpoint.name(),
        tables = LOG_TABLES.len(),
        "system logs flushed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_are_idempotent() {
        for ddl in SCHEMA {
            assert!(ddl.contains("IF NOT EXISTS"), "not idempotent: {ddl}");
        }
    }

    #[test]
    fn schema_ddl_lookup_matches_qualified_names() {
        let spots = QualifiedTable::new("wspr", "rx_spots")
            .unwrap_or_else(|err| panic!("table: {err}"));
        assert!(schema_ddl_for(&spots).is_some());

        let unknown = QualifiedTable::new("wspr", "unknown")
            .unwrap_or_else(|err| panic!("table: {err}"));
        assert!(schema_ddl_for(&unknown).is_none());
    }
}
