//! Command-line interface definitions for the `wsprsync` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `wsprsync` binary.
#[derive(Debug, Parser)]
#[command(
    name = "wsprsync",
    version,
    disable_version_flag = true,
    about = "Reconcile WSPR databases between servers and provision reporting stations",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Print version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub(crate) version: Option<bool>,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands offered by the `wsprsync` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Deduplicate and bidirectionally synchronise tables between the two
    /// database servers.
    #[command(name = "sync")]
    Sync(SyncCommand),
    /// Create or repair the SFTP-only account for a reporting station.
    #[command(name = "provision")]
    Provision(ProvisionCommand),
    /// Database and host maintenance operations.
    #[command(name = "maintain")]
    Maintain(MaintainCommand),
}

/// Which table family a sync run covers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum ScopeArg {
    /// Spot (reception report) tables only.
    Spots,
    /// Noise measurement tables only.
    Noise,
    /// Both table families.
    #[default]
    Both,
}

/// Arguments for the `wsprsync sync` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SyncCommand {
    /// Table family to reconcile.
    #[arg(value_enum, default_value = "both")]
    pub(crate) scope: ScopeArg,
    /// Deduplicate tables without transferring rows between servers.
    #[arg(long, conflicts_with = "transfer_only")]
    pub(crate) dedupe_only: bool,
    /// Transfer missing rows without first deduplicating.
    #[arg(long, visible_alias = "sync-only", conflicts_with = "dedupe_only")]
    pub(crate) transfer_only: bool,
    /// Print the reconciliation report as JSON instead of text.
    #[arg(long)]
    pub(crate) json: bool,
}

/// Arguments for the `wsprsync provision` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Remote access client number of the station to provision.
    #[arg(value_name = "RAC")]
    pub(crate) rac: u16,
    /// Read the station's public key from a local file instead of fetching it
    /// from the client over its tunnel.
    #[arg(long, value_name = "PATH")]
    pub(crate) key_file: Option<String>,
}

/// Arguments for the `wsprsync maintain` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct MaintainCommand {
    /// Maintenance action to run.
    #[command(subcommand)]
    pub(crate) action: MaintainAction,
}

/// Maintenance actions.
#[derive(Debug, Subcommand)]
pub(crate) enum MaintainAction {
    /// Apply the idempotent schema statements, optionally rebuilding one
    /// table in place via an atomic swap.
    #[command(name = "migrate")]
    Migrate {
        /// Rebuild the named table (`database.table`) to the current schema
        /// definition, deduplicating rows during the copy.
        #[arg(long, value_name = "TABLE")]
        rebuild: Option<String>,
    },
    /// Flush ClickHouse system logs and truncate the log tables.
    #[command(name = "flush-logs")]
    FlushLogs,
    /// Purge legacy host packages left behind by earlier deployments.
    #[command(name = "remove-packages")]
    RemovePackages {
        /// Packages to purge; defaults to the configured legacy package list.
        #[arg(value_name = "PACKAGE")]
        packages: Vec<String>,
    },
}
