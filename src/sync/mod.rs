//! Orchestrates end-to-end table reconciliation between the two servers.
//!
//! The driver resolves which configured server this machine is (by short
//! hostname, with a config override), stops the ingestion units around the
//! dedupe swap, runs the dedupe and transfer sequences per table, and
//! renders the before/after counts for the operator. Matching final counts
//! are reported, not enforced; a mismatch is a warning.

use std::fmt::{self, Display, Write as _};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SyncSettings;
use crate::db::reconcile::{DedupeReport, ReconcileError, TableReconciler, TransferReport};
use crate::db::{SqlEndpoint, TableSpec};
use crate::host::{CommandRunner, HostError, HostShell, restart_unit, stop_unit};

/// Which side of the server pair this machine is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// This machine is the primary server.
    Primary,
    /// This machine is the partner server.
    Partner,
}

/// Which reconciliation phases a run performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    /// Dedupe followed by bidirectional transfer.
    Full,
    /// Dedupe only.
    DedupeOnly,
    /// Bidirectional transfer only.
    TransferOnly,
}

impl SyncPhase {
    const fn includes_dedupe(self) -> bool {
        matches!(self, Self::Full | Self::DedupeOnly)
    }

    const fn includes_transfer(self) -> bool {
        matches!(self, Self::Full | Self::TransferOnly)
    }
}

/// Errors surfaced while driving a reconciliation run.
#[derive(Debug, Error)]
pub enum SyncRunError {
    /// Raised when the hostname command fails.
    #[error("failed to discover hostname: {0}")]
    Hostname(#[source] HostError),
    /// Raised when the hostname matches neither alias list and no role
    /// override is configured.
    #[error("hostname {hostname:?} matches neither server alias list; set the role override")]
    UnknownHost {
        /// Short hostname reported by the machine.
        hostname: String,
    },
    /// Raised when stopping an ingestion unit fails.
    #[error("failed to stop {unit}: {source}")]
    ServiceStop {
        /// Unit that could not be stopped.
        unit: String,
        /// Underlying command failure.
        #[source]
        source: HostError,
    },
    /// Raised when restarting an ingestion unit fails after the run
    /// otherwise succeeded.
    #[error("failed to restart {unit}: {source}")]
    ServiceRestart {
        /// Unit that could not be restarted.
        unit: String,
        /// Underlying command failure.
        #[source]
        source: HostError,
    },
    /// Raised when a reconciliation statement fails.
    #[error("reconciliation failed: {message}")]
    Reconcile {
        /// Description, including a restart note when the recovery restart
        /// also failed.
        message: String,
        /// Underlying reconciliation error.
        #[source]
        source: ReconcileError,
    },
}

/// Resolves this machine's role from the short hostname.
///
/// A configured role override wins; otherwise `hostname -s` output is
/// matched case-insensitively against the two alias lists.
///
/// # Errors
///
/// Returns [`SyncRunError::Hostname`] when the hostname command fails and
/// [`SyncRunError::UnknownHost`] when nothing matches.
pub fn resolve_role<R: CommandRunner>(
    runner: &R,
    settings: &SyncSettings,
) -> Result<Role, SyncRunError> {
    if let Some(role) = settings.role.as_deref() {
        return Ok(if role == "partner" {
            Role::Partner
        } else {
            Role::Primary
        });
    }

    let shell = HostShell::local(runner);
    let output = shell
        .run_checked(&settings.hostname_bin, &[String::from("-s")])
        .map_err(SyncRunError::Hostname)?;
    let hostname = output.stdout.trim().to_ascii_lowercase();

    let matches_alias =
        |aliases: &[String]| aliases.iter().any(|alias| alias.to_ascii_lowercase() == hostname);
    if matches_alias(&settings.primary_aliases) {
        Ok(Role::Primary)
    } else if matches_alias(&settings.partner_aliases) {
        Ok(Role::Partner)
    } else {
        Err(SyncRunError::UnknownHost { hostname })
    }
}

/// Per-table outcome of one run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TableOutcome {
    /// Qualified table name.
    pub table: String,
    /// Dedupe passes performed (one per endpoint when requested).
    pub dedupe: Vec<DedupeReport>,
    /// Transfer into the local endpoint, when requested.
    pub pull: Option<TransferReport>,
    /// Transfer into the remote endpoint, when requested.
    pub push: Option<TransferReport>,
    /// Final row count on the local endpoint.
    pub local_rows: u64,
    /// Final row count on the remote endpoint.
    pub remote_rows: u64,
    /// Rows still present remotely and absent locally after the run.
    pub residual_local_missing: u64,
    /// Rows still present locally and absent remotely after the run.
    pub residual_remote_missing: u64,
}

impl TableOutcome {
    /// Returns `true` when both sides hold identical row sets.
    #[must_use]
    pub const fn in_sync(&self) -> bool {
        self.local_rows == self.remote_rows
            && self.residual_local_missing == 0
            && self.residual_remote_missing == 0
    }
}

/// Operator-facing report for one run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    /// Label of the local endpoint.
    pub local: String,
    /// Label of the remote endpoint.
    pub remote: String,
    /// Per-table outcomes in execution order.
    pub tables: Vec<TableOutcome>,
}

impl Display for SyncReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            formatter,
            "reconciliation {} <-> {}",
            self.local, self.remote
        )?;
        for outcome in &self.tables {
            writeln!(formatter, "{}", render_outcome(outcome, &self.local, &self.remote))?;
        }
        Ok(())
    }
}

fn render_outcome(outcome: &TableOutcome, local: &str, remote: &str) -> String {
    let mut text = format!("table {}", outcome.table);
    for dedupe in &outcome.dedupe {
        write!(
            text,
            "\n  dedupe {}: {} -> {} ({} removed)",
            dedupe.endpoint,
            dedupe.rows_before,
            dedupe.rows_after,
            dedupe.rows_removed()
        )
        .ok();
    }
    if let Some(ref pull) = outcome.pull {
        write!(
            text,
            "\n  pulled {} -> {}: {} rows in {} batch(es)",
            pull.source, pull.target, pull.rows_inserted, pull.batches
        )
        .ok();
    }
    if let Some(ref push) = outcome.push {
        write!(
            text,
            "\n  pushed {} -> {}: {} rows in {} batch(es)",
            push.source, push.target, push.rows_inserted, push.batches
        )
        .ok();
    }
    write!(
        text,
        "\n  rows: {local}={} {remote}={} residuals: {} / {} [{}]",
        outcome.local_rows,
        outcome.remote_rows,
        outcome.residual_local_missing,
        outcome.residual_remote_missing,
        if outcome.in_sync() { "in sync" } else { "MISMATCH" }
    )
    .ok();
    text
}

/// Executes the reconciliation workflow against the two endpoints.
#[derive(Debug)]
pub struct SyncOrchestrator<E: SqlEndpoint, R: CommandRunner> {
    local: E,
    remote: E,
    reconciler: TableReconciler,
    service_shell: HostShell<R>,
    ingest_units: Vec<String>,
}

impl<E: SqlEndpoint, R: CommandRunner> SyncOrchestrator<E, R> {
    /// Creates a new orchestrator.
    ///
    /// `service_shell` controls the ingestion units on the machine the
    /// dedupe swap runs from.
    #[must_use]
    pub const fn new(
        local: E,
        remote: E,
        reconciler: TableReconciler,
        service_shell: HostShell<R>,
        ingest_units: Vec<String>,
    ) -> Self {
        Self {
            local,
            remote,
            reconciler,
            service_shell,
            ingest_units,
        }
    }

    /// Runs the requested phases for every table and returns the report.
    ///
    /// When the dedupe phase runs, ingestion units are stopped first and
    /// restarted afterwards; the restart also happens when the run fails
    /// mid-way, and a restart failure is appended to the original error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncRunError`] when a service operation or statement fails.
    pub async fn execute(
        &self,
        specs: &[TableSpec],
        phase: SyncPhase,
    ) -> Result<SyncReport, SyncRunError> {
        let pause_ingest = phase.includes_dedupe() && !self.ingest_units.is_empty();
        if pause_ingest {
            self.stop_ingest()?;
        }

        let outcome = self.run_tables(specs, phase).await;

        if !pause_ingest {
            return outcome;
        }
        let restart_failure = self.restart_ingest().err();
        match (outcome, restart_failure) {
            (Ok(report), None) => Ok(report),
            (Ok(_), Some(err)) => Err(err),
            (Err(err), restart) => Err(append_restart_note(err, restart)),
        }
    }

    async fn run_tables(
        &self,
        specs: &[TableSpec],
        phase: SyncPhase,
    ) -> Result<SyncReport, SyncRunError> {
        let mut tables = Vec::with_capacity(specs.len());
        for spec in specs {
            tables.push(self.run_table(spec, phase).await?);
        }
        Ok(SyncReport {
            local: self.local.name().to_owned(),
            remote: self.remote.name().to_owned(),
            tables,
        })
    }

    async fn run_table(
        &self,
        spec: &TableSpec,
        phase: SyncPhase,
    ) -> Result<TableOutcome, SyncRunError> {
        info!(table = %spec.table, ?phase, "reconciling table");
        let mut dedupe = Vec::new();
        if phase.includes_dedupe() {
            dedupe.push(self.reconcile_step(self.reconciler.dedupe(&self.local, spec)).await?);
            dedupe.push(self.reconcile_step(self.reconciler.dedupe(&self.remote, spec)).await?);
        }

        let (pull, push) = if phase.includes_transfer() {
            let pulled = self
                .reconcile_step(self.reconciler.transfer(&self.remote, &self.local, spec))
                .await?;
            let pushed = self
                .reconcile_step(self.reconciler.transfer(&self.local, &self.remote, spec))
                .await?;
            (Some(pulled), Some(pushed))
        } else {
            (None, None)
        };

        let local_rows = self
            .reconcile_step(self.reconciler.count(&self.local, spec))
            .await?;
        let remote_rows = self
            .reconcile_step(self.reconciler.count(&self.remote, spec))
            .await?;
        let residual_local_missing = self
            .reconcile_step(self.reconciler.missing(&self.remote, &self.local, spec))
            .await?;
        let residual_remote_missing = self
            .reconcile_step(self.reconciler.missing(&self.local, &self.remote, spec))
            .await?;

        let outcome = TableOutcome {
            table: spec.table.to_string(),
            dedupe,
            pull,
            push,
            local_rows,
            remote_rows,
            residual_local_missing,
            residual_remote_missing,
        };
        if !outcome.in_sync() {
            warn!(
                table = %outcome.table,
                local_rows = outcome.local_rows,
                remote_rows = outcome.remote_rows,
                "row sets still differ after reconciliation"
            );
        }
        Ok(outcome)
    }

    async fn reconcile_step<T>(
        &self,
        step: impl std::future::Future<Output = Result<T, ReconcileError>>,
    ) -> Result<T, SyncRunError> {
        step.await.map_err(|err| SyncRunError::Reconcile {
            message: err.to_string(),
            source: err,
        })
    }

    fn stop_ingest(&self) -> Result<(), SyncRunError> {
        for unit in &self.ingest_units {
            stop_unit(&self.service_shell, unit).map_err(|err| SyncRunError::ServiceStop {
                unit: unit.clone(),
                source: err,
            })?;
        }
        Ok(())
    }

    fn restart_ingest(&self) -> Result<(), SyncRunError> {
        for unit in &self.ingest_units {
            restart_unit(&self.service_shell, unit).map_err(|err| {
                SyncRunError::ServiceRestart {
                    unit: unit.clone(),
                    source: err,
                }
            })?;
        }
        Ok(())
    }
}

fn append_restart_note(err: SyncRunError, restart: Option<SyncRunError>) -> SyncRunError {
    let Some(restart_err) = restart else {
        return err;
    };
    match err {
        SyncRunError::Reconcile { message, source } => SyncRunError::Reconcile {
            message: format!("{message} (service restart also failed: {restart_err})"),
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use crate::host::CommandOutput;

    use super::*;

    struct HostnameRunner {
        stdout: &'static str,
    }

    impl CommandRunner for HostnameRunner {
        fn run(&self, _program: &str, _args: &[OsString]) -> Result<CommandOutput, HostError> {
            Ok(CommandOutput {
                code: Some(0),
                stdout: format!("{}\n", self.stdout),
                stderr: String::new(),
            })
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            primary_name: String::from("wd1"),
            primary_url: String::from("http://wd1:8123"),
            primary_tcp_addr: String::from("wd1:9000"),
            primary_aliases: vec![String::from("wd1"), String::from("gw1")],
            partner_name: String::from("wd2"),
            partner_url: String::from("http://wd2:8123"),
            partner_tcp_addr: String::from("wd2:9000"),
            partner_aliases: vec![String::from("wd2"), String::from("gw2")],
            database: String::from("wspr"),
            db_user: String::from("chadmin"),
            db_password: String::from("pw"),
            role: None,
            spot_tables: vec![String::from("rx_spots")],
            noise_tables: vec![String::from("noise_stats")],
            spot_id_column: String::from("id"),
            spot_tie_break: vec![String::from("time")],
            transfer_batch_rows: 1_000_000,
            ingest_units: Vec::new(),
            hostname_bin: String::from("hostname"),
        }
    }

    #[test]
    fn role_matches_aliases_case_insensitively() {
        let runner = HostnameRunner { stdout: "GW2" };
        let role = resolve_role(&runner, &settings()).unwrap_or_else(|err| panic!("role: {err}"));
        assert_eq!(role, Role::Partner);
    }

    #[test]
    fn role_override_beats_hostname() {
        let mut overridden = settings();
        overridden.role = Some(String::from("partner"));
        let runner = HostnameRunner { stdout: "wd1" };
        let role = resolve_role(&runner, &overridden).unwrap_or_else(|err| panic!("role: {err}"));
        assert_eq!(role, Role::Partner);
    }

    #[test]
    fn unmatched_hostname_is_an_error() {
        let runner = HostnameRunner { stdout: "workstation" };
        assert!(matches!(
            resolve_role(&runner, &settings()),
            Err(SyncRunError::UnknownHost { .. })
        ));
    }

    #[test]
    fn outcome_in_sync_requires_zero_residuals() {
        let outcome = TableOutcome {
            table: String::from("wspr.rx_spots"),
            dedupe: Vec::new(),
            pull: None,
            push: None,
            local_rows: 10,
            remote_rows: 10,
            residual_local_missing: 0,
            residual_remote_missing: 1,
        };
        assert!(!outcome.in_sync());
    }
}
