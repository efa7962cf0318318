//! Typed OS-account inspection and mutation.
//!
//! The account state the provisioning workflow cares about (exists, locked,
//! which keys are authorized) is exposed as a typed [`AccountStatus`] behind
//! the [`AccountStore`] trait. The `passwd -S` field parsing lives here, in
//! exactly one place, and tests exercise the workflow with fake stores.

use shell_escape::unix::escape;
use thiserror::Error;

use super::{CommandRunner, HostError, HostShell};

/// Errors raised by account stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AccountError {
    /// Raised when a username contains characters outside `[A-Za-z0-9_]`.
    #[error("invalid username: {value:?}")]
    InvalidUsername {
        /// The rejected raw value.
        value: String,
    },
    /// Raised when `passwd -S` output cannot be parsed.
    #[error("unrecognised account status for {user}: {output:?}")]
    StatusParse {
        /// Account the status was requested for.
        user: String,
        /// Raw `passwd -S` output.
        output: String,
    },
    /// Raised when a public key line cannot be parsed.
    #[error("unrecognised public key line: {line:?}")]
    InvalidKey {
        /// The rejected raw line.
        line: String,
    },
    /// Raised when an underlying host command fails.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// An OpenSSH public key split into its whitespace-delimited parts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicKey {
    /// Key algorithm (for example `ssh-ed25519`).
    pub algorithm: String,
    /// Base64 key material; two keys match when their blobs match.
    pub blob: String,
    /// Optional trailing comment.
    pub comment: Option<String>,
}

impl PublicKey {
    /// Parses a single `authorized_keys`-style line.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InvalidKey`] when the line does not carry an
    /// algorithm and key blob.
    pub fn parse(line: &str) -> Result<Self, AccountError> {
        let mut parts = line.split_whitespace();
        let (Some(algorithm), Some(blob)) = (parts.next(), parts.next()) else {
            return Err(AccountError::InvalidKey {
                line: line.to_owned(),
            });
        };
        let plausible = algorithm.starts_with("ssh-")
            || algorithm.starts_with("ecdsa-")
            || algorithm.starts_with("sk-");
        if !plausible {
            return Err(AccountError::InvalidKey {
                line: line.to_owned(),
            });
        }
        Ok(Self {
            algorithm: algorithm.to_owned(),
            blob: blob.to_owned(),
            comment: parts.next().map(ToOwned::to_owned),
        })
    }

    /// Renders the key as an `authorized_keys` line.
    #[must_use]
    pub fn render(&self) -> String {
        self.comment.as_ref().map_or_else(
            || format!("{} {}", self.algorithm, self.blob),
            |comment| format!("{} {} {comment}", self.algorithm, self.blob),
        )
    }
}

/// Typed snapshot of one account on one host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AccountStatus {
    /// Whether the account exists.
    pub exists: bool,
    /// Whether the password is locked.
    pub locked: bool,
    /// Blobs of the keys currently authorized for the account.
    pub authorized_keys: Vec<String>,
}

impl AccountStatus {
    /// Returns `true` when `key` is already authorized.
    #[must_use]
    pub fn authorizes(&self, key: &PublicKey) -> bool {
        self.authorized_keys.iter().any(|blob| blob == &key.blob)
    }
}

/// Narrow interface over OS account state on one host.
pub trait AccountStore {
    /// Operator-facing label for the host this store mutates.
    fn host_label(&self) -> &str;

    /// Returns the typed status of `user`.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when the username is invalid or a status
    /// command fails to run.
    fn status(&self, user: &str) -> Result<AccountStatus, AccountError>;

    /// Creates `user` as an SFTP-only account with a home directory.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when `useradd` fails.
    fn create_sftp_account(&self, user: &str) -> Result<(), AccountError>;

    /// Unlocks `user`'s password.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when `usermod` fails.
    fn unlock(&self, user: &str) -> Result<(), AccountError>;

    /// Appends `key` to `user`'s authorized keys.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError`] when the install script fails.
    fn install_authorized_key(&self, user: &str, key: &PublicKey) -> Result<(), AccountError>;
}

/// Account store backed by standard shadow-utils commands through a
/// [`HostShell`].
#[derive(Clone, Debug)]
pub struct ShellAccountStore<R: CommandRunner> {
    shell: HostShell<R>,
    sftp_group: String,
    sftp_shell: String,
    home_root: String,
}

impl<R: CommandRunner> ShellAccountStore<R> {
    /// Creates a store that manages accounts through `shell`.
    #[must_use]
    pub fn new(shell: HostShell<R>, sftp_group: impl Into<String>, sftp_shell: impl Into<String>) -> Self {
        Self {
            shell,
            sftp_group: sftp_group.into(),
            sftp_shell: sftp_shell.into(),
            home_root: String::from("/home"),
        }
    }

    /// Overrides the home directory root (used by tests).
    #[must_use]
    pub fn with_home_root(mut self, home_root: impl Into<String>) -> Self {
        self.home_root = home_root.into();
        self
    }

    fn home_dir(&self, user: &str) -> String {
        format!("{}/{user}", self.home_root)
    }

    fn authorized_keys_path(&self, user: &str) -> String {
        format!("{}/.ssh/authorized_keys", self.home_dir(user))
    }
}

fn require_valid_username(user: &str) -> Result<(), AccountError> {
    let valid = !user.is_empty()
        && user
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(AccountError::InvalidUsername {
            value: user.to_owned(),
        })
    }
}

/// Extracts the lock state from `passwd -S` output.
///
/// The second whitespace-delimited field is `P` (usable password), `L`
/// (locked), or `NP` (no password); Debian spells locked accounts `L` or
/// `LK` depending on version.
fn parse_locked(user: &str, output: &str) -> Result<bool, AccountError> {
    let mut fields = output.split_whitespace();
    let (Some(name), Some(state)) = (fields.next(), fields.next()) else {
        return Err(AccountError::StatusParse {
            user: user.to_owned(),
            output: output.to_owned(),
        });
    };
    if name != user {
        return Err(AccountError::StatusParse {
            user: user.to_owned(),
            output: output.to_owned(),
        });
    }
    match state {
        "L" | "LK" => Ok(true),
        "P" | "NP" | "PS" => Ok(false),
        _ => Err(AccountError::StatusParse {
            user: user.to_owned(),
            output: output.to_owned(),
        }),
    }
}

impl<R: CommandRunner> AccountStore for ShellAccountStore<R> {
    fn host_label(&self) -> &str {
        self.shell.label()
    }

    fn status(&self, user: &str) -> Result<AccountStatus, AccountError> {
        require_valid_username(user)?;

        let id_probe = self
            .shell
            .run("id", &[String::from("-u"), user.to_owned()])?;
        if !id_probe.is_success() {
            return Ok(AccountStatus::default());
        }

        let passwd = self
            .shell
            .run_checked("passwd", &[String::from("-S"), user.to_owned()])?;
        let locked = parse_locked(user, &passwd.stdout)?;

        let keys_probe = self
            .shell
            .run("cat", &[self.authorized_keys_path(user)])?;
        let authorized_keys = if keys_probe.is_success() {
            keys_probe
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter_map(|line| PublicKey::parse(line).ok())
                .map(|key| key.blob)
                .collect()
        } else {
            Vec::new()
        };

        Ok(AccountStatus {
            exists: true,
            locked,
            authorized_keys,
        })
    }

    fn create_sftp_account(&self, user: &str) -> Result<(), AccountError> {
        require_valid_username(user)?;
        self.shell.run_checked(
            "useradd",
            &[
                String::from("-m"),
                String::from("-d"),
                self.home_dir(user),
                String::from("-g"),
                self.sftp_group.clone(),
                String::from("-s"),
                self.sftp_shell.clone(),
                user.to_owned(),
            ],
        )?;
        Ok(())
    }

    fn unlock(&self, user: &str) -> Result<(), AccountError> {
        require_valid_username(user)?;
        self.shell
            .run_checked("usermod", &[String::from("-U"), user.to_owned()])?;
        Ok(())
    }

    fn install_authorized_key(&self, user: &str, key: &PublicKey) -> Result<(), AccountError> {
        require_valid_username(user)?;
        let ssh_dir = format!("{}/.ssh", self.home_dir(user));
        let keys_path = self.authorized_keys_path(user);
        let script = format!(
            "install -d -m 700 -o {owner} -g {group} {dir} && \
             printf '%s\\n' {line} >> {path} && \
             chown {owner}:{group} {path} && chmod 600 {path}",
            owner = user,
            group = self.sftp_group,
            dir = escape(ssh_dir.into()),
            line = escape(key.render().into()),
            path = escape(keys_path.into()),
        );
        self.shell
            .run_checked("sh", &[String::from("-c"), script])?;
        Ok(())
    }
}
