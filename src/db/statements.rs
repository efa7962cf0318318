//! Typed construction of the SQL statements issued during reconciliation.
//!
//! Reconciliation drives a fixed set of ClickHouse statements. Building them
//! here, from validated identifiers, keeps string assembly out of the
//! orchestration code and makes the exact statement text unit-testable.

use std::fmt::{self, Display, Write as _};

use thiserror::Error;

use super::RemoteAddr;

/// Errors raised while constructing statements.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StatementError {
    /// Raised when a database, table, or column name contains characters
    /// outside `[A-Za-z0-9_]`.
    #[error("invalid identifier: {value:?}")]
    InvalidIdentifier {
        /// The rejected raw value.
        value: String,
    },
    /// Raised when a `SHOW CREATE TABLE` result does not reference the table
    /// it was requested for.
    #[error("DDL for {table} does not mention the table name")]
    UnexpectedDdl {
        /// Qualified name the DDL was expected to contain.
        table: String,
    },
}

/// A validated SQL identifier (`[A-Za-z0-9_]+`).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Ident(String);

impl Ident {
    /// Validates and wraps a raw identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError::InvalidIdentifier`] when `raw` is empty or
    /// contains characters outside `[A-Za-z0-9_]`.
    pub fn new(raw: impl Into<String>) -> Result<Self, StatementError> {
        let value = raw.into();
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if valid {
            Ok(Self(value))
        } else {
            Err(StatementError::InvalidIdentifier { value })
        }
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Ident {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// A database-qualified table name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QualifiedTable {
    /// Database the table lives in.
    pub database: Ident,
    /// Bare table name.
    pub table: Ident,
}

impl QualifiedTable {
    /// Builds a qualified table name from raw parts.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError::InvalidIdentifier`] when either part fails
    /// identifier validation.
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, StatementError> {
        Ok(Self {
            database: Ident::new(database)?,
            table: Ident::new(table)?,
        })
    }

    /// Parses a `database.table` string.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError::InvalidIdentifier`] when the input is not
    /// two valid identifiers separated by a single dot.
    pub fn parse(raw: &str) -> Result<Self, StatementError> {
        let Some((database, table)) = raw.split_once('.') else {
            return Err(StatementError::InvalidIdentifier {
                value: raw.to_owned(),
            });
        };
        Self::new(database, table)
    }

    /// Returns a sibling table in the same database with a suffixed name.
    ///
    /// # Errors
    ///
    /// Returns [`StatementError::InvalidIdentifier`] when the suffix fails
    /// identifier validation.
    pub fn suffixed(&self, suffix: &str) -> Result<Self, StatementError> {
        Ok(Self {
            database: self.database.clone(),
            table: Ident::new(format!("{}_{suffix}", self.table))?,
        })
    }
}

impl Display for QualifiedTable {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.database, self.table)
    }
}

/// How duplicate rows are collapsed during a dedupe pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DedupeStrategy {
    /// Keep one copy of each fully identical row.
    DistinctRows,
    /// Keep the first row per id under an explicit ordering. The tie-break
    /// columns make the surviving row deterministic when several distinct
    /// rows share an id.
    FirstById {
        /// Id column grouped on.
        column: Ident,
        /// Additional ordering columns applied after the id.
        tie_break: Vec<Ident>,
    },
}

/// Reconciliation predicate for a table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TableKey {
    /// Rows are identified by a numeric id column.
    ById {
        /// The id column name.
        column: Ident,
    },
    /// Rows have no single id; full-row comparison is used.
    FullRow,
}

/// A table participating in reconciliation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSpec {
    /// Qualified table name, identical on both endpoints.
    pub table: QualifiedTable,
    /// Predicate used when computing row differences.
    pub key: TableKey,
    /// Strategy applied when deduplicating.
    pub dedupe: DedupeStrategy,
}

/// Renders a `SHOW CREATE TABLE` statement.
#[must_use]
pub fn show_create(table: &QualifiedTable) -> String {
    format!("SHOW CREATE TABLE {table}")
}

/// Renders a `SELECT count()` statement.
#[must_use]
pub fn count_rows(table: &QualifiedTable) -> String {
    format!("SELECT count() FROM {table}")
}

/// Renders the minimum value of an id column, defaulting to zero when the
/// table is empty.
#[must_use]
pub fn min_id(table: &QualifiedTable, column: &Ident) -> String {
    format!("SELECT toUInt64(ifNull(toNullable(min({column})), 0)) FROM {table}")
}

/// Renders the maximum value of an id column, defaulting to zero when the
/// table is empty.
#[must_use]
pub fn max_id(table: &QualifiedTable, column: &Ident) -> String {
    format!("SELECT toUInt64(ifNull(toNullable(max({column})), 0)) FROM {table}")
}

/// Rewrites `SHOW CREATE TABLE` output to create `replacement` instead of
/// `original`.
///
/// ClickHouse renders the qualified name either bare or backtick-quoted; both
/// forms are handled.
///
/// # Errors
///
/// Returns [`StatementError::UnexpectedDdl`] when the DDL mentions neither
/// form of the original name.
pub fn rewrite_create_ddl(
    ddl: &str,
    original: &QualifiedTable,
    replacement: &QualifiedTable,
) -> Result<String, StatementError> {
    let bare = original.to_string();
    let quoted = format!("`{}`.`{}`", original.database, original.table);
    if ddl.contains(&bare) {
        return Ok(ddl.replacen(&bare, &replacement.to_string(), 1));
    }
    if ddl.contains(&quoted) {
        return Ok(ddl.replacen(&quoted, &replacement.to_string(), 1));
    }
    Err(StatementError::UnexpectedDdl { table: bare })
}

/// Renders the deduplicating insert from `table` into `shadow`.
#[must_use]
pub fn dedupe_insert(
    table: &QualifiedTable,
    shadow: &QualifiedTable,
    strategy: &DedupeStrategy,
) -> String {
    match strategy {
        DedupeStrategy::DistinctRows => {
            format!("INSERT INTO {shadow} SELECT DISTINCT * FROM {table}")
        }
        DedupeStrategy::FirstById { column, tie_break } => {
            let mut ordering = column.to_string();
            for extra in tie_break {
                write!(ordering, ", {extra}").ok();
            }
            format!(
                "INSERT INTO {shadow} SELECT * FROM {table} ORDER BY {ordering} LIMIT 1 BY {column}"
            )
        }
    }
}

/// Renders the atomic swap of two tables.
#[must_use]
pub fn exchange_tables(left: &QualifiedTable, right: &QualifiedTable) -> String {
    format!("EXCHANGE TABLES {left} AND {right}")
}

/// Renders a guarded table drop.
#[must_use]
pub fn drop_table(table: &QualifiedTable) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

/// Renders a `remote()` table function reference to `table` on `source`.
///
/// The credentials are spliced as SQL string literals with quoting applied;
/// the table name itself is a validated identifier pair.
#[must_use]
pub fn remote_table(source: &RemoteAddr, table: &QualifiedTable) -> String {
    format!(
        "remote({}, {}.{}, {}, {})",
        sql_string(&source.addr),
        source.database,
        table.table,
        sql_string(&source.user),
        sql_string(&source.password),
    )
}

/// Optional id range appended to transfer predicates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdRange {
    /// Inclusive lower bound.
    pub lo: u64,
    /// Inclusive upper bound.
    pub hi: u64,
}

/// Renders the insert of rows present on `source` and absent locally,
/// compared by id, optionally restricted to an id range.
#[must_use]
pub fn transfer_by_id(
    table: &QualifiedTable,
    source: &RemoteAddr,
    column: &Ident,
    range: Option<IdRange>,
) -> String {
    let remote = remote_table(source, table);
    let (outer, inner) = range_guards(column, range);
    format!(
        "INSERT INTO {table} SELECT * FROM {remote} WHERE {outer}{column} NOT IN \
         (SELECT {column} FROM {table}{inner})"
    )
}

/// Renders the insert of rows present on `source` and absent locally,
/// compared as whole rows.
#[must_use]
pub fn transfer_full_row(table: &QualifiedTable, source: &RemoteAddr) -> String {
    let remote = remote_table(source, table);
    format!("INSERT INTO {table} SELECT * FROM (SELECT * FROM {remote} EXCEPT SELECT * FROM {table})")
}

/// Renders the count of rows present on `source` and absent locally,
/// compared by id.
#[must_use]
pub fn missing_by_id(table: &QualifiedTable, source: &RemoteAddr, column: &Ident) -> String {
    let remote = remote_table(source, table);
    format!(
        "SELECT count() FROM {remote} WHERE {column} NOT IN (SELECT {column} FROM {table})"
    )
}

/// Renders the count of rows present on `source` and absent locally,
/// compared as whole rows.
#[must_use]
pub fn missing_full_row(table: &QualifiedTable, source: &RemoteAddr) -> String {
    let remote = remote_table(source, table);
    format!("SELECT count() FROM (SELECT * FROM {remote} EXCEPT SELECT * FROM {table})")
}

fn range_guards(column: &Ident, range: Option<IdRange>) -> (String, String) {
    range.map_or_else(
        || (String::new(), String::new()),
        |bounds| {
            (
                format!("{column} BETWEEN {} AND {} AND ", bounds.lo, bounds.hi),
                format!(" WHERE {column} BETWEEN {} AND {}", bounds.lo, bounds.hi),
            )
        },
    )
}

/// Quotes a value as a ClickHouse single-quoted string literal.
#[must_use]
pub fn sql_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}
