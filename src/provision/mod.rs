//! Station provisioning: the idempotent account and key workflow.
//!
//! Provisioning repairs whatever is missing and leaves correct state alone:
//! it looks the station up in the roster, ensures the SFTP-only account
//! exists and is unlocked on both servers, authorizes the station's key,
//! smoke-tests SFTP from the station's own vantage point over its reverse
//! tunnel, and rewrites the one upload line of the station's configuration
//! file. Re-running against an already-correct station performs zero
//! mutating actions.

use serde::Serialize;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{info, warn};

use crate::host::account::{AccountError, AccountStore, PublicKey};
use crate::host::{CommandRunner, HostError, HostShell, SshOptions, SshTarget};
use crate::roster::{Roster, RosterError, sanitize_reporter, tunnel_port};

/// Errors surfaced while provisioning a station.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when the roster has no entry for the station or cannot supply
    /// its tunnel port.
    #[error(transparent)]
    Roster(#[from] RosterError),
    /// Raised when the station's public key cannot be obtained.
    #[error("failed to load the station public key: {message}")]
    KeyLoad {
        /// Description of the failure.
        message: String,
    },
    /// Raised when an account status query fails.
    #[error("failed to inspect account {user} on {host}: {source}")]
    Status {
        /// Host the query ran against.
        host: String,
        /// Account being inspected.
        user: String,
        /// Underlying account error.
        #[source]
        source: AccountError,
    },
    /// Raised when account creation fails. This is the only fatal account
    /// mutation.
    #[error("failed to create account {user} on {host}: {source}")]
    AccountCreation {
        /// Host the creation ran against.
        host: String,
        /// Account being created.
        user: String,
        /// Underlying account error.
        #[source]
        source: AccountError,
    },
    /// Raised when the station's configuration file cannot be read or
    /// written over SSH.
    #[error("failed to update the station configuration: {message}")]
    ClientConfig {
        /// Description of the failure.
        message: String,
        /// Underlying command failure, when one was observed.
        #[source]
        source: Option<HostError>,
    },
}

/// One mutating action performed during provisioning.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum ProvisionAction {
    /// An SFTP-only account was created.
    CreatedAccount {
        /// Host the account was created on.
        host: String,
        /// Account name.
        user: String,
    },
    /// A locked account was unlocked.
    UnlockedAccount {
        /// Host the account was unlocked on.
        host: String,
        /// Account name.
        user: String,
    },
    /// The station key was appended to the authorized keys.
    InstalledKey {
        /// Host the key was installed on.
        host: String,
        /// Account name.
        user: String,
    },
    /// The station configuration line was rewritten.
    UpdatedClientConfig {
        /// Path of the rewritten file.
        path: String,
    },
}

/// Result of the SFTP smoke test run from the station.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum SmokeTest {
    /// Every upload host accepted an SFTP session.
    Passed,
    /// At least one upload host rejected the session.
    Failed {
        /// Description of the first failure.
        detail: String,
    },
}

/// Outcome of one provisioning run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProvisionOutcome {
    /// Station RAC.
    pub rac: u16,
    /// Account name derived from the reporter id.
    pub account: String,
    /// Mutating actions performed, in order.
    pub actions: Vec<ProvisionAction>,
    /// Non-fatal problems observed.
    pub warnings: Vec<String>,
    /// SFTP smoke test result.
    pub smoke_test: SmokeTest,
}

impl ProvisionOutcome {
    /// Returns `true` when the run changed anything.
    #[must_use]
    pub fn mutated(&self) -> bool {
        !self.actions.is_empty()
    }
}

/// Settings the orchestrator needs beyond its collaborators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionPlan {
    /// Address the station reverse tunnels terminate on.
    pub client_gateway_host: String,
    /// Hosts the smoke test connects to.
    pub upload_hosts: Vec<String>,
    /// Configuration file rewritten on the station.
    pub client_conf_path: String,
    /// Key of the rewritten configuration line.
    pub client_conf_key: String,
}

/// Coordinates account repair across both servers and the station.
#[derive(Debug)]
pub struct ProvisionOrchestrator<L, P, R>
where
    L: AccountStore,
    P: AccountStore,
    R: CommandRunner + Clone,
{
    roster: Roster,
    local: L,
    partner: P,
    client_runner: R,
    ssh_options: SshOptions,
    plan: ProvisionPlan,
}

impl<L, P, R> ProvisionOrchestrator<L, P, R>
where
    L: AccountStore,
    P: AccountStore,
    R: CommandRunner + Clone,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(
        roster: Roster,
        local: L,
        partner: P,
        client_runner: R,
        ssh_options: SshOptions,
        plan: ProvisionPlan,
    ) -> Self {
        Self {
            roster,
            local,
            partner,
            client_runner,
            ssh_options,
            plan,
        }
    }

    /// Runs the provisioning workflow for one station.
    ///
    /// `key_override` skips fetching the key from the station, for operators
    /// who already hold the public key file.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] on roster misses, key load failures,
    /// account creation failures, and station SSH failures. Smoke test
    /// failures and key repair failures are recorded in the outcome instead.
    pub fn execute(
        &self,
        rac: u16,
        key_override: Option<PublicKey>,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let entry = self.roster.lookup(rac)?;
        let account = sanitize_reporter(&entry.reporter);
        let port = tunnel_port(rac)?;
        let client_shell = HostShell::remote(
            self.client_runner.clone(),
            self.ssh_options.clone(),
            SshTarget {
                user: entry.ssh_user.clone(),
                host: self.plan.client_gateway_host.clone(),
                port,
            },
        );
        info!(rac, account, port, "provisioning station");

        let key = match key_override {
            Some(key) => key,
            None => fetch_station_key(&client_shell)?,
        };

        let mut actions = Vec::new();
        let mut warnings = Vec::new();
        self.ensure_account(&self.local, &account, &key, &mut actions, &mut warnings)?;
        self.ensure_account(&self.partner, &account, &key, &mut actions, &mut warnings)?;

        let smoke_test = self.smoke_test(&client_shell, &account);
        if let SmokeTest::Failed { ref detail } = smoke_test {
            warn!(rac, detail, "station SFTP smoke test failed");
        }

        self.update_client_conf(&client_shell, &account, &mut actions)?;

        let outcome = ProvisionOutcome {
            rac,
            account,
            actions,
            warnings,
            smoke_test,
        };
        info!(
            rac,
            mutated = outcome.mutated(),
            "provisioning complete"
        );
        Ok(outcome)
    }

    fn ensure_account(
        &self,
        store: &impl AccountStore,
        account: &str,
        key: &PublicKey,
        actions: &mut Vec<ProvisionAction>,
        warnings: &mut Vec<String>,
    ) -> Result<(), ProvisionError> {
        let host = store.host_label().to_owned();
        let status = store
            .status(account)
            .map_err(|err| ProvisionError::Status {
                host: host.clone(),
                user: account.to_owned(),
                source: err,
            })?;

        if status.exists {
            if status.locked {
                match store.unlock(account) {
                    Ok(()) => actions.push(ProvisionAction::UnlockedAccount {
                        host: host.clone(),
                        user: account.to_owned(),
                    }),
                    Err(err) => warnings.push(format!("could not unlock {account} on {host}: {err}")),
                }
            }
        } else {
            store
                .create_sftp_account(account)
                .map_err(|err| ProvisionError::AccountCreation {
                    host: host.clone(),
                    user: account.to_owned(),
                    source: err,
                })?;
            actions.push(ProvisionAction::CreatedAccount {
                host: host.clone(),
                user: account.to_owned(),
            });
        }

        if !status.authorizes(key) {
            match store.install_authorized_key(account, key) {
                Ok(()) => actions.push(ProvisionAction::InstalledKey {
                    host,
                    user: account.to_owned(),
                }),
                Err(err) => {
                    warnings.push(format!("could not install key for {account} on {host}: {err}"));
                }
            }
        }
        Ok(())
    }

    fn smoke_test<C: CommandRunner>(&self, client: &HostShell<C>, account: &str) -> SmokeTest {
        for host in &self.plan.upload_hosts {
            let destination = format!("{account}@{host}");
            let attempt = client.run(
                "sftp",
                &[
                    String::from("-o"),
                    String::from("BatchMode=yes"),
                    String::from("-b"),
                    String::from("/dev/null"),
                    destination.clone(),
                ],
            );
            match attempt {
                Ok(output) if output.is_success() => {}
                Ok(output) => {
                    return SmokeTest::Failed {
                        detail: format!(
                            "sftp to {destination} exited with status {}: {}",
                            output
                                .code
                                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                            output.stderr.trim()
                        ),
                    };
                }
                Err(err) => {
                    return SmokeTest::Failed {
                        detail: format!("sftp to {destination} could not run: {err}"),
                    };
                }
            }
        }
        SmokeTest::Passed
    }

    fn update_client_conf<C: CommandRunner>(
        &self,
        client: &HostShell<C>,
        account: &str,
        actions: &mut Vec<ProvisionAction>,
    ) -> Result<(), ProvisionError> {
        let path = &self.plan.client_conf_path;
        let current = client
            .run_checked("cat", &[path.clone()])
            .map_err(|err| ProvisionError::ClientConfig {
                message: format!("could not read {path}"),
                source: Some(err),
            })?;

        let Some(updated) = rewrite_conf_line(&current.stdout, &self.plan.client_conf_key, account)
        else {
            return Ok(());
        };

        let script = format!(
            "printf '%s' {} > {}",
            escape(updated.into()),
            escape(path.clone().into()),
        );
        client
            .run_checked("sh", &[String::from("-c"), script])
            .map_err(|err| ProvisionError::ClientConfig {
                message: format!("could not write {path}"),
                source: Some(err),
            })?;
        actions.push(ProvisionAction::UpdatedClientConfig { path: path.clone() });
        Ok(())
    }
}

fn fetch_station_key<C: CommandRunner>(client: &HostShell<C>) -> Result<PublicKey, ProvisionError> {
    let probe = client
        .run(
            "sh",
            &[
                String::from("-c"),
                String::from(
                    "cat ~/.ssh/id_ed25519.pub 2>/dev/null || cat ~/.ssh/id_rsa.pub",
                ),
            ],
        )
        .map_err(|err| ProvisionError::KeyLoad {
            message: err.to_string(),
        })?;
    if !probe.is_success() {
        return Err(ProvisionError::KeyLoad {
            message: format!("station has no public key: {}", probe.stderr.trim()),
        });
    }
    let line = probe
        .stdout
        .lines()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .ok_or_else(|| ProvisionError::KeyLoad {
            message: String::from("station returned an empty key file"),
        })?;
    PublicKey::parse(line).map_err(|err| ProvisionError::KeyLoad {
        message: err.to_string(),
    })
}

/// Rewrites the `key="value"` line of a station configuration file.
///
/// Returns the updated contents, or `None` when the line already carries the
/// desired value. A missing line is appended.
#[must_use]
pub fn rewrite_conf_line(contents: &str, key: &str, value: &str) -> Option<String> {
    let desired = format!("{key}=\"{value}\"");
    let mut lines: Vec<String> = contents.lines().map(ToOwned::to_owned).collect();
    let mut replaced = false;

    for line in &mut lines {
        let is_target = line.trim_start().starts_with(&format!("{key}="));
        if is_target {
            if line.trim() == desired {
                return None;
            }
            desired.clone_into(line);
            replaced = true;
            break;
        }
    }
    if !replaced {
        lines.push(desired);
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_the_existing_line() {
        let conf = "RECEIVER=\"ka9q\"\nSIGNAL_LEVEL_UPLOAD_ID=\"old\"\nBAND=\"20m\"\n";
        let updated = rewrite_conf_line(conf, "SIGNAL_LEVEL_UPLOAD_ID", "kj6mki_rz")
            .map_or_else(|| panic!("line should change"), |text| text);
        assert_eq!(
            updated,
            "RECEIVER=\"ka9q\"\nSIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\nBAND=\"20m\"\n"
        );
    }

    #[test]
    fn rewrite_is_a_noop_when_already_correct() {
        let conf = "SIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\n";
        assert!(rewrite_conf_line(conf, "SIGNAL_LEVEL_UPLOAD_ID", "kj6mki_rz").is_none());
    }

    #[test]
    fn rewrite_appends_a_missing_line() {
        let conf = "RECEIVER=\"ka9q\"\n";
        let updated = rewrite_conf_line(conf, "SIGNAL_LEVEL_UPLOAD_ID", "kj6mki_rz")
            .map_or_else(|| panic!("line should be appended"), |text| text);
        assert_eq!(
            updated,
            "RECEIVER=\"ka9q\"\nSIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\n"
        );
    }

    #[test]
    fn rewrite_only_touches_the_first_matching_line() {
        let conf = "SIGNAL_LEVEL_UPLOAD_ID=\"old\"\nSIGNAL_LEVEL_UPLOAD_ID=\"older\"\n";
        let updated = rewrite_conf_line(conf, "SIGNAL_LEVEL_UPLOAD_ID", "new")
            .map_or_else(|| panic!("line should change"), |text| text);
        assert_eq!(
            updated,
            "SIGNAL_LEVEL_UPLOAD_ID=\"new\"\nSIGNAL_LEVEL_UPLOAD_ID=\"older\"\n"
        );
    }
}
