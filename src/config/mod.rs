//! Configuration loading via `ortho-config`.
//!
//! Settings merge defaults, `wsprsync.toml` discovery, and `WSPRSYNC_*`
//! environment variables in that order of precedence. These structs replace
//! the shell-sourced variable files the service historically used; the
//! station roster keeps its own file format and is handled by
//! [`crate::roster`].

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::db::{EndpointConfig, StatementError, TableSpec};
use crate::db::statements::{DedupeStrategy, Ident, QualifiedTable, TableKey};
use crate::host::{SshOptions, SshTarget};

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted set.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Surfaces invalid table or column identifiers.
    #[error("invalid table configuration: {0}")]
    Table(#[from] StatementError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in wsprsync.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Settings for the table reconciliation driver.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WSPRSYNC_SYNC",
    discovery(
        app_name = "wsprsync",
        env_var = "WSPRSYNC_CONFIG_PATH",
        config_file_name = "wsprsync.toml",
        dotfile_name = ".wsprsync.toml",
        project_file_name = "wsprsync.toml"
    )
)]
pub struct SyncSettings {
    /// Label of the primary database server.
    #[ortho_config(default = "wd1".to_owned())]
    pub primary_name: String,
    /// HTTP interface URL of the primary server.
    #[ortho_config(default = "http://wd1:8123".to_owned())]
    pub primary_url: String,
    /// Native-protocol address of the primary server, used in `remote()`.
    #[ortho_config(default = "wd1:9000".to_owned())]
    pub primary_tcp_addr: String,
    /// Short hostnames that identify the primary server.
    #[ortho_config(default = vec!["wd1".to_owned(), "gw1".to_owned()])]
    pub primary_aliases: Vec<String>,
    /// Label of the partner database server.
    #[ortho_config(default = "wd2".to_owned())]
    pub partner_name: String,
    /// HTTP interface URL of the partner server.
    #[ortho_config(default = "http://wd2:8123".to_owned())]
    pub partner_url: String,
    /// Native-protocol address of the partner server, used in `remote()`.
    #[ortho_config(default = "wd2:9000".to_owned())]
    pub partner_tcp_addr: String,
    /// Short hostnames that identify the partner server.
    #[ortho_config(default = vec!["wd2".to_owned(), "gw2".to_owned()])]
    pub partner_aliases: Vec<String>,
    /// Database holding the reconciled tables.
    #[ortho_config(default = "wspr".to_owned())]
    pub database: String,
    /// Administrative database account.
    #[ortho_config(default = "chadmin".to_owned())]
    pub db_user: String,
    /// Password for the administrative account. Required.
    pub db_password: String,
    /// Role override (`primary` or `partner`) for hosts whose hostname
    /// matches neither alias list.
    pub role: Option<String>,
    /// Spot tables, reconciled by id.
    #[ortho_config(default = vec!["rx_spots".to_owned()])]
    pub spot_tables: Vec<String>,
    /// Noise tables, reconciled by full-row comparison.
    #[ortho_config(default = vec!["noise_stats".to_owned()])]
    pub noise_tables: Vec<String>,
    /// Id column of the spot tables.
    #[ortho_config(default = "id".to_owned())]
    pub spot_id_column: String,
    /// Tie-break ordering columns applied after the id during dedupe.
    #[ortho_config(default = vec!["time".to_owned()])]
    pub spot_tie_break: Vec<String>,
    /// Rows per id-range chunk during batched transfers.
    #[ortho_config(default = 1_000_000)]
    pub transfer_batch_rows: u64,
    /// Ingestion units stopped around the dedupe swap and restarted after.
    #[ortho_config(default = vec!["wsprdaemon-ingest.service".to_owned()])]
    pub ingest_units: Vec<String>,
    /// Binary used to discover the short hostname.
    #[ortho_config(default = "hostname".to_owned())]
    pub hostname_bin: String,
}

impl SyncSettings {
    /// Loads settings without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("wsprsync")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the missing or invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.db_password,
            &FieldMetadata::new(
                "database password",
                "WSPRSYNC_SYNC_DB_PASSWORD",
                "db_password",
                "sync",
            ),
        )?;
        if let Some(role) = self.role.as_deref()
            && role != "primary"
            && role != "partner"
        {
            return Err(ConfigError::InvalidValue(format!(
                "role must be `primary` or `partner`, got {role:?}"
            )));
        }
        if self.transfer_batch_rows == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "transfer_batch_rows must be at least 1",
            )));
        }
        Ok(())
    }

    /// Endpoint settings for the primary server.
    #[must_use]
    pub fn primary_endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            name: self.primary_name.clone(),
            url: self.primary_url.clone(),
            tcp_addr: self.primary_tcp_addr.clone(),
            database: self.database.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
        }
    }

    /// Endpoint settings for the partner server.
    #[must_use]
    pub fn partner_endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            name: self.partner_name.clone(),
            url: self.partner_url.clone(),
            tcp_addr: self.partner_tcp_addr.clone(),
            database: self.database.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
        }
    }

    /// Table specs for the spot tables (id-keyed, first-by-id dedupe).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Table`] when a configured name is not a valid
    /// identifier.
    pub fn spot_specs(&self) -> Result<Vec<TableSpec>, ConfigError> {
        let column = Ident::new(self.spot_id_column.clone())?;
        let tie_break = self
            .spot_tie_break
            .iter()
            .map(|name| Ident::new(name.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        self.spot_tables
            .iter()
            .map(|table| {
                Ok(TableSpec {
                    table: QualifiedTable::new(self.database.clone(), table.clone())?,
                    key: TableKey::ById {
                        column: column.clone(),
                    },
                    dedupe: DedupeStrategy::FirstById {
                        column: column.clone(),
                        tie_break: tie_break.clone(),
                    },
                })
            })
            .collect()
    }

    /// Table specs for the noise tables (full-row comparison and dedupe).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Table`] when a configured name is not a valid
    /// identifier.
    pub fn noise_specs(&self) -> Result<Vec<TableSpec>, ConfigError> {
        self.noise_tables
            .iter()
            .map(|table| {
                Ok(TableSpec {
                    table: QualifiedTable::new(self.database.clone(), table.clone())?,
                    key: TableKey::FullRow,
                    dedupe: DedupeStrategy::DistinctRows,
                })
            })
            .collect()
    }
}

/// Settings for station provisioning.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WSPRSYNC_PROVISION",
    discovery(
        app_name = "wsprsync",
        env_var = "WSPRSYNC_CONFIG_PATH",
        config_file_name = "wsprsync.toml",
        dotfile_name = ".wsprsync.toml",
        project_file_name = "wsprsync.toml"
    )
)]
pub struct ProvisionSettings {
    /// Partner server that receives the mirrored account.
    #[ortho_config(default = "wd2".to_owned())]
    pub partner_host: String,
    /// Administrative user on the partner server.
    #[ortho_config(default = "root".to_owned())]
    pub partner_ssh_user: String,
    /// SSH port on the partner server.
    #[ortho_config(default = 22)]
    pub partner_ssh_port: u16,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; station tunnels present
    /// changing keys, so this defaults off.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Path to the SSH private key for administrative connections. Supports
    /// tilde expansion.
    pub ssh_identity_file: Option<String>,
    /// Address the station reverse tunnels terminate on.
    #[ortho_config(default = "127.0.0.1".to_owned())]
    pub client_gateway_host: String,
    /// Ordered roster sources; the first entry per RAC wins.
    #[ortho_config(default = vec![
        "~/.ssr.conf.local".to_owned(),
        "~/.ssr.conf.hamsci".to_owned(),
        "~/.ssr.conf".to_owned(),
    ])]
    pub roster_files: Vec<String>,
    /// Group that restricts accounts to SFTP.
    #[ortho_config(default = "sftpusers".to_owned())]
    pub sftp_group: String,
    /// Login shell for SFTP-only accounts.
    #[ortho_config(default = "/usr/sbin/nologin".to_owned())]
    pub sftp_shell: String,
    /// Configuration file rewritten on the client.
    #[ortho_config(default = "/home/pi/wsprdaemon/wsprdaemon.conf".to_owned())]
    pub client_conf_path: String,
    /// Key of the rewritten configuration line.
    #[ortho_config(default = "SIGNAL_LEVEL_UPLOAD_ID".to_owned())]
    pub client_conf_key: String,
    /// Hosts the client's SFTP smoke test connects to.
    #[ortho_config(default = vec!["wd1".to_owned(), "wd2".to_owned()])]
    pub upload_hosts: Vec<String>,
}

impl ProvisionSettings {
    /// Loads settings without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("wsprsync")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.partner_host,
            &FieldMetadata::new(
                "partner server host",
                "WSPRSYNC_PROVISION_PARTNER_HOST",
                "partner_host",
                "provision",
            ),
        )?;
        require_field(
            &self.sftp_group,
            &FieldMetadata::new(
                "SFTP group",
                "WSPRSYNC_PROVISION_SFTP_GROUP",
                "sftp_group",
                "provision",
            ),
        )?;
        require_field(
            &self.client_conf_path,
            &FieldMetadata::new(
                "client configuration path",
                "WSPRSYNC_PROVISION_CLIENT_CONF_PATH",
                "client_conf_path",
                "provision",
            ),
        )?;
        Ok(())
    }

    /// SSH options shared by partner and client connections.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            identity_file: self
                .ssh_identity_file
                .as_deref()
                .map(expand_tilde),
        }
    }

    /// Target for the partner server.
    #[must_use]
    pub fn partner_target(&self) -> SshTarget {
        SshTarget {
            user: self.partner_ssh_user.clone(),
            host: self.partner_host.clone(),
            port: self.partner_ssh_port,
        }
    }

    /// Roster sources with tilde expansion applied, in priority order.
    #[must_use]
    pub fn roster_sources(&self) -> Vec<camino::Utf8PathBuf> {
        self.roster_files
            .iter()
            .map(|path| camino::Utf8PathBuf::from(expand_tilde(path)))
            .collect()
    }
}

/// Settings for host maintenance.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WSPRSYNC_MAINTAIN",
    discovery(
        app_name = "wsprsync",
        env_var = "WSPRSYNC_CONFIG_PATH",
        config_file_name = "wsprsync.toml",
        dotfile_name = ".wsprsync.toml",
        project_file_name = "wsprsync.toml"
    )
)]
pub struct MaintainSettings {
    /// Packages purged by `maintain remove-packages` when none are named.
    #[ortho_config(default = vec![
        "wsprdaemon-legacy-uploader".to_owned(),
        "wsprdaemon-logrotate".to_owned(),
    ])]
    pub legacy_packages: Vec<String>,
}

impl MaintainSettings {
    /// Loads settings without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("wsprsync")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }
}
