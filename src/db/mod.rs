//! Database endpoint abstraction for the ClickHouse servers.
//!
//! Reconciliation runs the same fixed statement set against two endpoints.
//! The [`SqlEndpoint`] trait keeps the orchestration code independent of the
//! wire client so tests can substitute scripted or in-memory endpoints.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

pub mod reconcile;
pub mod statements;

pub use reconcile::{DedupeReport, TableReconciler, TransferReport};
pub use statements::{
    DedupeStrategy, IdRange, Ident, QualifiedTable, StatementError, TableKey, TableSpec,
};

/// Connection details one endpoint publishes so its peer can reference it in
/// federated `remote()` queries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteAddr {
    /// Native-protocol address (`host:9000`) used by `remote()`.
    pub addr: String,
    /// Database holding the reconciled tables.
    pub database: String,
    /// Account used for federated reads.
    pub user: String,
    /// Password for the federated account.
    pub password: String,
}

/// Settings required to reach one ClickHouse endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointConfig {
    /// Operator-facing label (for example `wd1`).
    pub name: String,
    /// HTTP interface URL (for example `http://wd1:8123`).
    pub url: String,
    /// Native-protocol address used when the peer references this endpoint.
    pub tcp_addr: String,
    /// Database holding the reconciled tables.
    pub database: String,
    /// Administrative account.
    pub user: String,
    /// Password for the administrative account.
    pub password: String,
}

impl EndpointConfig {
    /// Validates that every field carries a non-blank value.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), EndpointError> {
        let fields = [
            ("name", &self.name),
            ("url", &self.url),
            ("tcp_addr", &self.tcp_addr),
            ("database", &self.database),
            ("user", &self.user),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(EndpointError::InvalidConfig {
                    field: field.to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Errors raised by database endpoints.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EndpointError {
    /// Raised when endpoint settings are missing required values.
    #[error("missing endpoint configuration value: {field}")]
    InvalidConfig {
        /// Field that failed validation.
        field: String,
    },
    /// Raised when a statement fails on the server or in transit.
    #[error("statement failed on {endpoint}: {message}")]
    Sql {
        /// Endpoint label the statement was issued against.
        endpoint: String,
        /// Error description reported by the client.
        message: String,
    },
}

/// Future returned by endpoint operations.
pub type SqlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EndpointError>> + Send + 'a>>;

/// Minimal interface over one ClickHouse endpoint.
pub trait SqlEndpoint: Send + Sync {
    /// Operator-facing label used in reports and errors.
    fn name(&self) -> &str;

    /// Address triple the peer endpoint uses in `remote()` references.
    fn remote_addr(&self) -> &RemoteAddr;

    /// Runs a statement that returns no rows.
    fn execute<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, ()>;

    /// Runs a statement returning a single unsigned count.
    fn fetch_count<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, u64>;

    /// Runs a statement returning a single text value.
    fn fetch_text<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, String>;
}

/// Real endpoint backed by the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct ClickhouseEndpoint {
    name: String,
    remote_addr: RemoteAddr,
    client: clickhouse::Client,
}

impl ClickhouseEndpoint {
    /// Builds a client for the given endpoint settings.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfig`] when validation fails.
    pub fn new(config: &EndpointConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);
        Ok(Self {
            name: config.name.clone(),
            remote_addr: RemoteAddr {
                addr: config.tcp_addr.clone(),
                database: config.database.clone(),
                user: config.user.clone(),
                password: config.password.clone(),
            },
            client,
        })
    }

    fn sql_error(&self, err: &clickhouse::error::Error) -> EndpointError {
        EndpointError::Sql {
            endpoint: self.name.clone(),
            message: err.to_string(),
        }
    }
}

impl SqlEndpoint for ClickhouseEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn remote_addr(&self) -> &RemoteAddr {
        &self.remote_addr
    }

    fn execute<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .query(sql)
                .execute()
                .await
                .map_err(|err| self.sql_error(&err))
        })
    }

    fn fetch_count<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, u64> {
        Box::pin(async move {
            self.client
                .query(sql)
                .fetch_one::<u64>()
                .await
                .map_err(|err| self.sql_error(&err))
        })
    }

    fn fetch_text<'a>(&'a self, sql: &'a str) -> SqlFuture<'a, String> {
        Box::pin(async move {
            self.client
                .query(sql)
                .fetch_one::<String>()
                .await
                .map_err(|err| self.sql_error(&err))
        })
    }
}
