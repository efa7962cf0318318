//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use predicates::prelude::*;

fn wsprsync() -> Command {
    Command::cargo_bin("wsprsync").unwrap_or_else(|err| panic!("binary should build: {err}"))
}

#[test]
fn help_lists_the_subcommands() {
    wsprsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("provision"))
        .stdout(predicate::str::contains("maintain"));
}

#[test]
fn short_version_flag_prints_the_version() {
    wsprsync()
        .arg("-v")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn no_arguments_shows_help_and_fails() {
    wsprsync().assert().failure();
}

#[test]
fn conflicting_sync_phases_are_rejected() {
    wsprsync()
        .args(["sync", "both", "--dedupe-only", "--transfer-only"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn provision_requires_a_numeric_rac() {
    wsprsync()
        .args(["provision", "not-a-rac"])
        .assert()
        .failure();
}
