//! Table reconciliation operations: dedupe, transfer, and difference counts.
//!
//! Every operation issues a short, fixed statement sequence against one or
//! both endpoints. The shadow-table swap uses `EXCHANGE TABLES` so the
//! original table name is never absent.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::statements::{self, IdRange, StatementError, TableKey, TableSpec};
use super::{EndpointError, SqlEndpoint};

/// Errors raised during reconciliation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReconcileError {
    /// Raised when the transfer batch size is zero.
    #[error("transfer batch size must be at least one row")]
    InvalidBatchSize,
    /// Raised when statement construction fails.
    #[error("statement construction failed: {0}")]
    Statement(#[from] StatementError),
    /// Raised when an endpoint rejects a statement.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Outcome of one dedupe pass on one endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DedupeReport {
    /// Endpoint the pass ran on.
    pub endpoint: String,
    /// Qualified table name.
    pub table: String,
    /// Row count before the swap.
    pub rows_before: u64,
    /// Row count after the swap.
    pub rows_after: u64,
}

impl DedupeReport {
    /// Number of duplicate rows removed by the pass.
    #[must_use]
    pub const fn rows_removed(&self) -> u64 {
        self.rows_before.saturating_sub(self.rows_after)
    }
}

/// Outcome of one one-way transfer between endpoints.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransferReport {
    /// Endpoint rows were read from.
    pub source: String,
    /// Endpoint rows were inserted into.
    pub target: String,
    /// Qualified table name.
    pub table: String,
    /// One-way difference before the transfer.
    pub missing_before: u64,
    /// Rows actually inserted.
    pub rows_inserted: u64,
    /// Number of insert statements issued.
    pub batches: u64,
}

/// Issues the reconciliation statement sequences against endpoints.
#[derive(Clone, Copy, Debug)]
pub struct TableReconciler {
    transfer_batch_rows: u64,
}

impl TableReconciler {
    /// Creates a reconciler chunking id-keyed transfers at `batch` rows.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidBatchSize`] when `batch` is zero.
    pub const fn new(transfer_batch_rows: u64) -> Result<Self, ReconcileError> {
        if transfer_batch_rows == 0 {
            return Err(ReconcileError::InvalidBatchSize);
        }
        Ok(Self {
            transfer_batch_rows,
        })
    }

    /// Returns the current row count of `spec`'s table on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Endpoint`] when the count query fails.
    pub async fn count(
        &self,
        endpoint: &dyn SqlEndpoint,
        spec: &TableSpec,
    ) -> Result<u64, ReconcileError> {
        Ok(endpoint
            .fetch_count(&statements::count_rows(&spec.table))
            .await?)
    }

    /// Deduplicates `spec`'s table on `endpoint` via a shadow-table swap.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when any statement in the sequence fails.
    pub async fn dedupe(
        &self,
        endpoint: &dyn SqlEndpoint,
        spec: &TableSpec,
    ) -> Result<DedupeReport, ReconcileError> {
        let suffix = Uuid::new_v4().simple().to_string();
        self.dedupe_with_suffix(endpoint, spec, &suffix).await
    }

    /// Deduplicates with a caller-supplied shadow-table suffix.
    ///
    /// Exposed so tests can pin the shadow-table name; production callers use
    /// [`TableReconciler::dedupe`], which generates a unique suffix.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when any statement in the sequence fails.
    pub async fn dedupe_with_suffix(
        &self,
        endpoint: &dyn SqlEndpoint,
        spec: &TableSpec,
        suffix: &str,
    ) -> Result<DedupeReport, ReconcileError> {
        let rows_before = self.count(endpoint, spec).await?;
        let shadow = spec.table.suffixed(&format!("shadow_{suffix}"))?;

        let ddl = endpoint
            .fetch_text(&statements::show_create(&spec.table))
            .await?;
        let create_shadow = statements::rewrite_create_ddl(&ddl, &spec.table, &shadow)?;
        debug!(table = %spec.table, shadow = %shadow, "creating shadow table");
        endpoint.execute(&create_shadow).await?;

        endpoint
            .execute(&statements::dedupe_insert(
                &spec.table,
                &shadow,
                &spec.dedupe,
            ))
            .await?;
        endpoint
            .execute(&statements::exchange_tables(&spec.table, &shadow))
            .await?;
        endpoint.execute(&statements::drop_table(&shadow)).await?;

        let rows_after = self.count(endpoint, spec).await?;
        if rows_after > rows_before {
            warn!(
                table = %spec.table,
                endpoint = endpoint.name(),
                rows_before,
                rows_after,
                "dedupe grew the table; rows were inserted concurrently"
            );
        }
        info!(
            table = %spec.table,
            endpoint = endpoint.name(),
            removed = rows_before.saturating_sub(rows_after),
            "dedupe complete"
        );
        Ok(DedupeReport {
            endpoint: endpoint.name().to_owned(),
            table: spec.table.to_string(),
            rows_before,
            rows_after,
        })
    }

    /// Counts rows present on `source` and absent on `target`.
    ///
    /// The query runs on `target`, reading `source` through `remote()`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Endpoint`] when the count query fails.
    pub async fn missing(
        &self,
        source: &dyn SqlEndpoint,
        target: &dyn SqlEndpoint,
        spec: &TableSpec,
    ) -> Result<u64, ReconcileError> {
        let sql = match &spec.key {
            TableKey::ById { column } => {
                statements::missing_by_id(&spec.table, source.remote_addr(), column)
            }
            TableKey::FullRow => statements::missing_full_row(&spec.table, source.remote_addr()),
        };
        Ok(target.fetch_count(&sql).await?)
    }

    /// Inserts rows present on `source` and absent on `target` into `target`.
    ///
    /// Id-keyed tables are chunked into id ranges of the configured batch
    /// size to bound the cost of each federated query.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when any statement fails.
    pub async fn transfer(
        &self,
        source: &dyn SqlEndpoint,
        target: &dyn SqlEndpoint,
        spec: &TableSpec,
    ) -> Result<TransferReport, ReconcileError> {
        let missing_before = self.missing(source, target, spec).await?;
        let target_before = self.count(target, spec).await?;

        let batches = if missing_before == 0 {
            debug!(
                table = %spec.table,
                source = source.name(),
                target = target.name(),
                "transfer is a no-op"
            );
            0
        } else {
            match &spec.key {
                TableKey::ById { column } => {
                    self.transfer_batched(source, target, spec, column).await?
                }
                TableKey::FullRow => {
                    target
                        .execute(&statements::transfer_full_row(
                            &spec.table,
                            source.remote_addr(),
                        ))
                        .await?;
                    1
                }
            }
        };

        let target_after = self.count(target, spec).await?;
        let report = TransferReport {
            source: source.name().to_owned(),
            target: target.name().to_owned(),
            table: spec.table.to_string(),
            missing_before,
            rows_inserted: target_after.saturating_sub(target_before),
            batches,
        };
        info!(
            table = %spec.table,
            source = report.source,
            target = report.target,
            inserted = report.rows_inserted,
            "transfer complete"
        );
        Ok(report)
    }

    async fn transfer_batched(
        &self,
        source: &dyn SqlEndpoint,
        target: &dyn SqlEndpoint,
        spec: &TableSpec,
        column: &statements::Ident,
    ) -> Result<u64, ReconcileError> {
        let min = source
            .fetch_count(&statements::min_id(&spec.table, column))
            .await?;
        let max = source
            .fetch_count(&statements::max_id(&spec.table, column))
            .await?;
        let span = max.saturating_sub(min);
        if span < self.transfer_batch_rows {
            target
                .execute(&statements::transfer_by_id(
                    &spec.table,
                    source.remote_addr(),
                    column,
                    None,
                ))
                .await?;
            return Ok(1);
        }

        let mut batches = 0u64;
        let mut lo = min;
        loop {
            let hi = lo.saturating_add(self.transfer_batch_rows - 1);
            target
                .execute(&statements::transfer_by_id(
                    &spec.table,
                    source.remote_addr(),
                    column,
                    Some(IdRange { lo, hi }),
                ))
                .await?;
            batches += 1;
            if hi >= max {
                break;
            }
            lo = hi.saturating_add(1);
        }
        Ok(batches)
    }
}
