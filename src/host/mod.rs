//! Host command execution: local processes, SSH-wrapped remotes, service
//! units, and package removal.
//!
//! Every external command funnels through the [`CommandRunner`] trait so
//! tests can script outputs instead of touching the operating system. The
//! SSH option handling mirrors the invocations the operators run by hand:
//! batch mode, a known-hosts override for tunnelled hosts, and an optional
//! identity file.

use std::ffi::OsString;
use std::process::Command;

use shell_escape::unix::escape;
use thiserror::Error;

pub mod account;

pub use account::{AccountError, AccountStatus, AccountStore, PublicKey, ShellAccountStore};

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised while running host commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code and the
    /// caller requires success.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl HostError {
    pub(crate) fn from_failure(program: &str, output: &CommandOutput) -> Self {
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text,
            stderr: output.stderr.clone(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, HostError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, HostError> {
        (**self).run(program, args)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, HostError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| HostError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// SSH client settings shared by every remote invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Whether to force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking; tunnelled hosts present
    /// changing keys, so this defaults off.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: String,
    /// Optional identity file, `~`-expanded by the caller.
    pub identity_file: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            identity_file: None,
        }
    }
}

impl SshOptions {
    /// Builds the common option arguments for a connection to `port`.
    #[must_use]
    pub fn common_args(&self, port: u16) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];

        if let Some(ref identity_file) = self.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file));
        }

        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        args
    }
}

/// A host reachable over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Remote user to connect as.
    pub user: String,
    /// Hostname or address.
    pub host: String,
    /// TCP port of the SSH daemon (or reverse tunnel).
    pub port: u16,
}

/// Runs commands either locally or wrapped in `ssh` against one target, so
/// callers are indifferent to where the host actually is.
#[derive(Clone, Debug)]
pub struct HostShell<R: CommandRunner> {
    runner: R,
    options: SshOptions,
    target: Option<SshTarget>,
    label: String,
}

impl<R: CommandRunner> HostShell<R> {
    /// Builds a shell that runs commands on this machine.
    #[must_use]
    pub fn local(runner: R) -> Self {
        Self {
            runner,
            options: SshOptions::default(),
            target: None,
            label: String::from("localhost"),
        }
    }

    /// Builds a shell that wraps every command in `ssh` to `target`.
    #[must_use]
    pub fn remote(runner: R, options: SshOptions, target: SshTarget) -> Self {
        let label = format!("{}@{}:{}", target.user, target.host, target.port);
        Self {
            runner,
            options,
            target: Some(target),
            label,
        }
    }

    /// Operator-facing label for the host this shell reaches.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs `program` with `args`, remotely when a target is configured.
    ///
    /// Remote arguments are shell-escaped individually before being joined
    /// into the single command string `ssh` expects.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] when the command cannot be started.
    pub fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        match &self.target {
            None => {
                let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
                self.runner.run(program, &os_args)
            }
            Some(target) => {
                let command = render_command(program, args);
                let mut ssh_args = self.options.common_args(target.port);
                ssh_args.push(OsString::from(format!("{}@{}", target.user, target.host)));
                ssh_args.push(OsString::from(command));
                self.runner.run(&self.options.ssh_bin, &ssh_args)
            }
        }
    }

    /// Runs `program` with `args` and requires a zero exit code.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CommandFailure`] on a non-zero exit and
    /// [`HostError::Spawn`] when the command cannot be started.
    pub fn run_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        let output = self.run(program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(HostError::from_failure(program, &output))
        }
    }
}

/// Renders a program and arguments as a single shell-safe command string.
#[must_use]
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut command = escape(program.into()).into_owned();
    for arg in args {
        command.push(' ');
        command.push_str(escape(arg.as_str().into()).as_ref());
    }
    command
}

/// Stops a systemd unit.
///
/// # Errors
///
/// Returns [`HostError`] when `systemctl` fails.
pub fn stop_unit<R: CommandRunner>(shell: &HostShell<R>, unit: &str) -> Result<(), HostError> {
    shell.run_checked("systemctl", &[String::from("stop"), unit.to_owned()])?;
    Ok(())
}

/// Restarts a systemd unit.
///
/// # Errors
///
/// Returns [`HostError`] when `systemctl` fails.
pub fn restart_unit<R: CommandRunner>(shell: &HostShell<R>, unit: &str) -> Result<(), HostError> {
    shell.run_checked("systemctl", &[String::from("restart"), unit.to_owned()])?;
    Ok(())
}

/// Purges packages and removes their orphaned dependencies.
///
/// # Errors
///
/// Returns [`HostError`] when either `apt-get` invocation fails.
pub fn purge_packages<R: CommandRunner>(
    shell: &HostShell<R>,
    packages: &[String],
) -> Result<(), HostError> {
    if packages.is_empty() {
        return Ok(());
    }
    let mut args = vec![String::from("-y"), String::from("purge")];
    args.extend(packages.iter().cloned());
    shell.run_checked("apt-get", &args)?;
    shell.run_checked(
        "apt-get",
        &[String::from("-y"), String::from("autoremove")],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<(String, Vec<String>)>>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, HostError> {
            let rendered = args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            self.calls
                .borrow_mut()
                .push((program.to_owned(), rendered));
            Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            user: String::from("root"),
            host: String::from("wd2"),
            port: 22,
        }
    }

    #[test]
    fn render_command_escapes_arguments() {
        let rendered = render_command("printf", &[String::from("%s"), String::from("a b'c")]);
        assert_eq!(rendered, "printf %s 'a b'\\''c'");
    }

    #[test]
    fn local_shell_passes_args_through() {
        let shell = HostShell::local(RecordingRunner::default());
        shell
            .run("id", &[String::from("-u"), String::from("kj6mki_rz")])
            .unwrap_or_else(|err| panic!("run: {err}"));
        let calls = shell.runner.calls.borrow();
        let Some((program, args)) = calls.first() else {
            panic!("one call expected");
        };
        assert_eq!(program, "id");
        assert_eq!(args, &vec![String::from("-u"), String::from("kj6mki_rz")]);
    }

    #[test]
    fn remote_shell_wraps_command_in_ssh() {
        let shell = HostShell::remote(RecordingRunner::default(), SshOptions::default(), target());
        shell
            .run("id", &[String::from("-u"), String::from("kj6mki_rz")])
            .unwrap_or_else(|err| panic!("run: {err}"));
        let calls = shell.runner.calls.borrow();
        let Some((program, args)) = calls.first() else {
            panic!("one call expected");
        };
        assert_eq!(program, "ssh");
        assert!(args.contains(&String::from("root@wd2")));
        assert_eq!(args.last(), Some(&String::from("id -u kj6mki_rz")));
        assert!(args.contains(&String::from("BatchMode=yes")));
        assert!(args.contains(&String::from("UserKnownHostsFile=/dev/null")));
    }

    #[test]
    fn ssh_options_include_identity_file_when_set() {
        let options = SshOptions {
            identity_file: Some(String::from("/home/wd/.ssh/id_ed25519")),
            ..SshOptions::default()
        };
        let args = options.common_args(35884);
        assert!(args.contains(&OsString::from("-i")));
        assert!(args.contains(&OsString::from("/home/wd/.ssh/id_ed25519")));
        assert!(args.contains(&OsString::from("35884")));
    }

    #[test]
    fn purge_packages_skips_empty_list() {
        let shell = HostShell::local(RecordingRunner::default());
        purge_packages(&shell, &[]).unwrap_or_else(|err| panic!("purge: {err}"));
        assert!(shell.runner.calls.borrow().is_empty());
    }
}
