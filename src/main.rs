//! Binary entry point for the `wsprsync` CLI.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use wsprsync::{
    ClickhouseEndpoint, HostShell, MaintainError, MaintainSettings, ProcessCommandRunner,
    ProvisionError, ProvisionOrchestrator, ProvisionPlan, ProvisionSettings, PublicKey,
    QualifiedTable, Role, Roster, RosterError, ShellAccountStore, SmokeTest, SyncOrchestrator,
    SyncPhase, SyncRunError, SyncSettings, TableReconciler, maintenance, provision, resolve_role,
};

mod cli;

use cli::{Cli, Command, MaintainAction, ProvisionCommand, ScopeArg, SyncCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("roster error: {0}")]
    Roster(#[from] RosterError),
    #[error("sync failed: {0}")]
    Sync(#[from] SyncRunError),
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("maintenance failed: {0}")]
    Maintain(#[from] MaintainError),
    #[error("invalid table name: {0}")]
    Table(String),
    #[error("host command failed: {0}")]
    Host(#[from] wsprsync::HostError),
    #[error("failed to read key file {path}: {message}")]
    KeyFile {
        path: String,
        message: String,
    },
    #[error("failed to render report: {0}")]
    Render(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Command::Sync(command) => run_sync(command).await,
        Command::Provision(command) => run_provision(&command),
        Command::Maintain(command) => run_maintain(command.action).await,
    }
}

async fn run_sync(command: SyncCommand) -> Result<i32, CliError> {
    let settings =
        SyncSettings::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    settings
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let runner = ProcessCommandRunner;
    let role = resolve_role(&runner, &settings)?;
    let (local_config, remote_config) = match role {
        Role::Primary => (settings.primary_endpoint(), settings.partner_endpoint()),
        Role::Partner => (settings.partner_endpoint(), settings.primary_endpoint()),
    };
    let local = ClickhouseEndpoint::new(&local_config)
        .map_err(|err| CliError::Database(err.to_string()))?;
    let remote = ClickhouseEndpoint::new(&remote_config)
        .map_err(|err| CliError::Database(err.to_string()))?;

    let mut specs = Vec::new();
    if matches!(command.scope, ScopeArg::Spots | ScopeArg::Both) {
        specs.extend(
            settings
                .spot_specs()
                .map_err(|err| CliError::Config(err.to_string()))?,
        );
    }
    if matches!(command.scope, ScopeArg::Noise | ScopeArg::Both) {
        specs.extend(
            settings
                .noise_specs()
                .map_err(|err| CliError::Config(err.to_string()))?,
        );
    }

    let phase = if command.dedupe_only {
        SyncPhase::DedupeOnly
    } else if command.transfer_only {
        SyncPhase::TransferOnly
    } else {
        SyncPhase::Full
    };

    let reconciler = TableReconciler::new(settings.transfer_batch_rows)
        .map_err(|err| CliError::Database(err.to_string()))?;
    let orchestrator = SyncOrchestrator::new(
        local,
        remote,
        reconciler,
        HostShell::local(ProcessCommandRunner),
        settings.ingest_units.clone(),
    );

    let report = orchestrator.execute(&specs, phase).await?;
    if command.json {
        let rendered =
            serde_json::to_string_pretty(&report).map_err(|err| CliError::Render(err.to_string()))?;
        writeln!(io::stdout(), "{rendered}").ok();
    } else {
        write!(io::stdout(), "{report}").ok();
    }
    Ok(0)
}

fn run_provision(command: &ProvisionCommand) -> Result<i32, CliError> {
    let settings = ProvisionSettings::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;
    settings
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let roster = Roster::load(&settings.roster_sources())?;
    let key_override = command
        .key_file
        .as_deref()
        .map(read_key_file)
        .transpose()?;

    let options = settings.ssh_options();
    let local_store = ShellAccountStore::new(
        HostShell::local(ProcessCommandRunner),
        settings.sftp_group.clone(),
        settings.sftp_shell.clone(),
    );
    let partner_store = ShellAccountStore::new(
        HostShell::remote(ProcessCommandRunner, options.clone(), settings.partner_target()),
        settings.sftp_group.clone(),
        settings.sftp_shell.clone(),
    );
    let plan = ProvisionPlan {
        client_gateway_host: settings.client_gateway_host.clone(),
        upload_hosts: settings.upload_hosts.clone(),
        client_conf_path: settings.client_conf_path.clone(),
        client_conf_key: settings.client_conf_key.clone(),
    };

    let orchestrator = ProvisionOrchestrator::new(
        roster,
        local_store,
        partner_store,
        ProcessCommandRunner,
        options,
        plan,
    );
    let outcome = orchestrator.execute(command.rac, key_override)?;
    write!(io::stdout(), "{}", render_provision_outcome(&outcome)).ok();
    Ok(0)
}

async fn run_maintain(action: MaintainAction) -> Result<i32, CliError> {
    match action {
        MaintainAction::Migrate { rebuild } => {
            let endpoint = local_endpoint()?;
            maintenance::ensure_schema(&endpoint).await?;
            if let Some(raw_table) = rebuild {
                let table = QualifiedTable::parse(&raw_table)
                    .map_err(|err| CliError::Table(err.to_string()))?;
                let report = maintenance::rebuild_table(&endpoint, &table).await?;
                writeln!(
                    io::stdout(),
                    "rebuilt {}: {} -> {} rows",
                    report.table,
                    report.rows_before,
                    report.rows_after
                )
                .ok();
            }
            Ok(0)
        }
        MaintainAction::FlushLogs => {
            let endpoint = local_endpoint()?;
            maintenance::flush_logs(&endpoint).await?;
            Ok(0)
        }
        MaintainAction::RemovePackages { packages } => {
            let chosen = if packages.is_empty() {
                MaintainSettings::load_without_cli_args()
                    .map_err(|err| CliError::Config(err.to_string()))?
                    .legacy_packages
            } else {
                packages
            };
            let shell = HostShell::local(ProcessCommandRunner);
            wsprsync::host::purge_packages(&shell, &chosen)?;
            writeln!(io::stdout(), "purged {} package(s)", chosen.len()).ok();
            Ok(0)
        }
    }
}

fn local_endpoint() -> Result<ClickhouseEndpoint, CliError> {
    let settings =
        SyncSettings::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    settings
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let runner = ProcessCommandRunner;
    let role = resolve_role(&runner, &settings)?;
    let config = match role {
        Role::Primary => settings.primary_endpoint(),
        Role::Partner => settings.partner_endpoint(),
    };
    ClickhouseEndpoint::new(&config).map_err(|err| CliError::Database(err.to_string()))
}

fn read_key_file(path: &str) -> Result<PublicKey, CliError> {
    let expanded = wsprsync::expand_tilde(path);
    let key_path = Utf8Path::new(&expanded);
    let key_error = |message: String| CliError::KeyFile {
        path: expanded.clone(),
        message,
    };

    let parent = key_path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = key_path
        .file_name()
        .ok_or_else(|| key_error(String::from("path is missing a filename")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| key_error(err.to_string()))?;
    let contents = dir
        .read_to_string(file_name)
        .map_err(|err| key_error(err.to_string()))?;

    let line = contents
        .lines()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .ok_or_else(|| key_error(String::from("file is empty")))?;
    PublicKey::parse(line).map_err(|err| key_error(err.to_string()))
}

fn render_provision_outcome(outcome: &provision::ProvisionOutcome) -> String {
    let mut text = format!(
        "station {} (account {})\n",
        outcome.rac, outcome.account
    );
    if outcome.actions.is_empty() {
        text.push_str("  already correct; no changes made\n");
    }
    for action in &outcome.actions {
        match action {
            provision::ProvisionAction::CreatedAccount { host, user } => {
                writeln!(text, "  created account {user} on {host}").ok();
            }
            provision::ProvisionAction::UnlockedAccount { host, user } => {
                writeln!(text, "  unlocked account {user} on {host}").ok();
            }
            provision::ProvisionAction::InstalledKey { host, user } => {
                writeln!(text, "  installed key for {user} on {host}").ok();
            }
            provision::ProvisionAction::UpdatedClientConfig { path } => {
                writeln!(text, "  updated station config {path}").ok();
            }
        }
    }
    for warning in &outcome.warnings {
        writeln!(text, "  warning: {warning}").ok();
    }
    match &outcome.smoke_test {
        SmokeTest::Passed => text.push_str("  sftp smoke test: passed\n"),
        SmokeTest::Failed { detail } => {
            writeln!(text, "  sftp smoke test: FAILED ({detail})").ok();
        }
    }
    text
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
