//! Core library for the `wsprsync` database operations toolkit.
//!
//! The crate reconciles WSPR measurement tables between two ClickHouse
//! servers (dedupe via shadow-table swap, bidirectional transfer of missing
//! rows), provisions SFTP-only accounts for remote reporting stations, and
//! performs schema and host maintenance. External systems are reached the
//! way the operators reach them: SQL over the ClickHouse client and the
//! system `ssh` binary, both behind narrow traits so tests run against
//! fakes.

pub mod config;
pub mod db;
pub mod host;
pub mod maintenance;
pub mod provision;
pub mod roster;
pub mod sync;

pub use config::{ConfigError, MaintainSettings, ProvisionSettings, SyncSettings, expand_tilde};
pub use db::{
    ClickhouseEndpoint, DedupeStrategy, EndpointConfig, EndpointError, QualifiedTable, RemoteAddr,
    SqlEndpoint, TableKey, TableSpec,
};
pub use db::reconcile::{DedupeReport, ReconcileError, TableReconciler, TransferReport};
pub use host::{
    AccountError, AccountStatus, AccountStore, CommandOutput, CommandRunner, HostError, HostShell,
    ProcessCommandRunner, PublicKey, ShellAccountStore, SshOptions, SshTarget,
};
pub use maintenance::{MaintainError, RebuildReport};
pub use provision::{
    ProvisionAction, ProvisionError, ProvisionOrchestrator, ProvisionOutcome, ProvisionPlan,
    SmokeTest,
};
pub use roster::{Roster, RosterError, StationEntry, sanitize_reporter, tunnel_port};
pub use sync::{Role, SyncOrchestrator, SyncPhase, SyncReport, SyncRunError, resolve_role};
