//! Behavioural coverage for station provisioning with fake account stores
//! and a scripted station connection.

use std::cell::RefCell;
use std::ffi::OsString;
use std::rc::Rc;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use wsprsync::host::account::{AccountError, AccountStatus, AccountStore, PublicKey};
use wsprsync::host::{CommandOutput, CommandRunner, HostError, SshOptions};
use wsprsync::provision::{
    ProvisionAction, ProvisionError, ProvisionOrchestrator, ProvisionPlan, SmokeTest,
};
use wsprsync::roster::{Roster, RosterError};

#[derive(Clone)]
struct FakeAccountStore {
    label: String,
    state: Rc<RefCell<AccountStatus>>,
    mutations: Rc<RefCell<Vec<String>>>,
    fail_create: bool,
}

impl FakeAccountStore {
    fn new(label: &str, state: AccountStatus) -> Self {
        Self {
            label: label.to_owned(),
            state: Rc::new(RefCell::new(state)),
            mutations: Rc::new(RefCell::new(Vec::new())),
            fail_create: false,
        }
    }

    fn absent(label: &str) -> Self {
        Self::new(label, AccountStatus::default())
    }

    fn correct(label: &str, key: &PublicKey) -> Self {
        Self::new(
            label,
            AccountStatus {
                exists: true,
                locked: false,
                authorized_keys: vec![key.blob.clone()],
            },
        )
    }

    fn mutation_count(&self) -> usize {
        self.mutations.borrow().len()
    }
}

impl AccountStore for FakeAccountStore {
    fn host_label(&self) -> &str {
        &self.label
    }

    fn status(&self, _user: &str) -> Result<AccountStatus, AccountError> {
        Ok(self.state.borrow().clone())
    }

    fn create_sftp_account(&self, user: &str) -> Result<(), AccountError> {
        if self.fail_create {
            return Err(AccountError::Host(HostError::Spawn {
                program: String::from("useradd"),
                message: String::from("simulated failure"),
            }));
        }
        self.state.borrow_mut().exists = true;
        self.mutations.borrow_mut().push(format!("create {user}"));
        Ok(())
    }

    fn unlock(&self, user: &str) -> Result<(), AccountError> {
        self.state.borrow_mut().locked = false;
        self.mutations.borrow_mut().push(format!("unlock {user}"));
        Ok(())
    }

    fn install_authorized_key(&self, user: &str, key: &PublicKey) -> Result<(), AccountError> {
        self.state
            .borrow_mut()
            .authorized_keys
            .push(key.blob.clone());
        self.mutations
            .borrow_mut()
            .push(format!("install-key {user}"));
        Ok(())
    }
}

/// Scripted stand-in for the station reached over its reverse tunnel.
#[derive(Clone)]
struct StationRunner {
    conf: Rc<RefCell<String>>,
    calls: Rc<RefCell<Vec<String>>>,
    key_line: String,
    sftp_ok: bool,
}

impl StationRunner {
    fn new(conf: &str) -> Self {
        Self {
            conf: Rc::new(RefCell::new(conf.to_owned())),
            calls: Rc::new(RefCell::new(Vec::new())),
            key_line: String::from("ssh-ed25519 AAAATESTBLOB station@pi"),
            sftp_ok: true,
        }
    }

    fn saw_write(&self) -> bool {
        self.calls
            .borrow()
            .iter()
            .any(|call| call.contains("printf"))
    }
}

fn output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

impl CommandRunner for StationRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, HostError> {
        let rendered = std::iter::once(program.to_owned())
            .chain(args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.borrow_mut().push(rendered);

        let command = args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();
        if command.contains("id_ed25519.pub") {
            return Ok(output(0, &format!("{}\n", self.key_line)));
        }
        if command.starts_with("sftp ") {
            return Ok(output(i32::from(!self.sftp_ok), ""));
        }
        if command.starts_with("cat ") {
            return Ok(output(0, &self.conf.borrow()));
        }
        if command.contains("printf") {
            self.conf.borrow_mut().clear();
            return Ok(output(0, ""));
        }
        Ok(output(0, ""))
    }
}

fn station_key() -> PublicKey {
    PublicKey::parse("ssh-ed25519 AAAATESTBLOB station@pi")
        .unwrap_or_else(|err| panic!("key: {err}"))
}

fn roster_with_entry() -> Roster {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("ssr.conf"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    std::fs::write(&path, "84,kj6mki-rz,wsprdaemon,AUTO,,,\n")
        .unwrap_or_else(|err| panic!("write roster: {err}"));
    Roster::load(&[path]).unwrap_or_else(|err| panic!("load roster: {err}"))
}

fn plan() -> ProvisionPlan {
    ProvisionPlan {
        client_gateway_host: String::from("127.0.0.1"),
        upload_hosts: vec![String::from("wd1"), String::from("wd2")],
        client_conf_path: String::from("/home/pi/wsprdaemon/wsprdaemon.conf"),
        client_conf_key: String::from("SIGNAL_LEVEL_UPLOAD_ID"),
    }
}

fn orchestrator(
    local: FakeAccountStore,
    partner: FakeAccountStore,
    station: StationRunner,
) -> ProvisionOrchestrator<FakeAccountStore, FakeAccountStore, StationRunner> {
    ProvisionOrchestrator::new(
        roster_with_entry(),
        local,
        partner,
        station,
        SshOptions::default(),
        plan(),
    )
}

#[test]
fn fresh_station_gets_accounts_keys_and_config() {
    let local = FakeAccountStore::absent("wd1");
    let partner = FakeAccountStore::absent("wd2");
    let station = StationRunner::new("RECEIVER=\"ka9q\"\n");
    let driver = orchestrator(local.clone(), partner.clone(), station.clone());

    let outcome = driver
        .execute(84, Some(station_key()))
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(outcome.account, "kj6mki_rz");
    assert!(outcome.mutated());
    assert_eq!(outcome.warnings, Vec::<String>::new());
    assert_eq!(outcome.smoke_test, SmokeTest::Passed);

    let created: Vec<_> = outcome
        .actions
        .iter()
        .filter(|action| matches!(action, ProvisionAction::CreatedAccount { .. }))
        .collect();
    assert_eq!(created.len(), 2);
    let installed: Vec<_> = outcome
        .actions
        .iter()
        .filter(|action| matches!(action, ProvisionAction::InstalledKey { .. }))
        .collect();
    assert_eq!(installed.len(), 2);
    assert!(outcome.actions.iter().any(|action| matches!(
        action,
        ProvisionAction::UpdatedClientConfig { .. }
    )));
    assert!(station.saw_write());
    assert_eq!(local.mutation_count(), 2);
    assert_eq!(partner.mutation_count(), 2);
}

#[test]
fn rerun_against_correct_station_mutates_nothing() {
    let key = station_key();
    let local = FakeAccountStore::correct("wd1", &key);
    let partner = FakeAccountStore::correct("wd2", &key);
    let station = StationRunner::new("SIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\n");
    let driver = orchestrator(local.clone(), partner.clone(), station.clone());

    let outcome = driver
        .execute(84, Some(key))
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert!(!outcome.mutated());
    assert_eq!(outcome.actions, Vec::new());
    assert_eq!(local.mutation_count(), 0);
    assert_eq!(partner.mutation_count(), 0);
    assert!(!station.saw_write(), "config write should be skipped");
}

#[test]
fn locked_account_is_unlocked_in_place() {
    let key = station_key();
    let mut locked_state = AccountStatus {
        exists: true,
        locked: true,
        authorized_keys: vec![key.blob.clone()],
    };
    let local = FakeAccountStore::new("wd1", locked_state.clone());
    locked_state.locked = false;
    let partner = FakeAccountStore::new("wd2", locked_state);
    let station = StationRunner::new("SIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\n");
    let driver = orchestrator(local, partner, station);

    let outcome = driver
        .execute(84, Some(key))
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(
        outcome.actions,
        vec![ProvisionAction::UnlockedAccount {
            host: String::from("wd1"),
            user: String::from("kj6mki_rz"),
        }]
    );
}

#[test]
fn station_key_is_fetched_over_the_tunnel_when_not_supplied() {
    let local = FakeAccountStore::absent("wd1");
    let partner = FakeAccountStore::absent("wd2");
    let station = StationRunner::new("RECEIVER=\"ka9q\"\n");
    let driver = orchestrator(local, partner, station.clone());

    let outcome = driver
        .execute(84, None)
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert!(outcome.mutated());
    let calls = station.calls.borrow();
    let Some(first) = calls.first() else {
        panic!("key fetch call expected");
    };
    assert!(first.contains("id_ed25519.pub"), "first call: {first}");
    assert!(
        first.contains("wsprdaemon@127.0.0.1"),
        "roster ssh user should be used: {first}"
    );
    assert!(first.contains("-p 35884"), "tunnel port should be used: {first}");
}

#[test]
fn unknown_rac_is_fatal() {
    let driver = orchestrator(
        FakeAccountStore::absent("wd1"),
        FakeAccountStore::absent("wd2"),
        StationRunner::new(""),
    );

    let Err(err) = driver.execute(7, Some(station_key())) else {
        panic!("unknown RAC should fail");
    };
    assert!(matches!(
        err,
        ProvisionError::Roster(RosterError::UnknownStation { rac: 7 })
    ));
}

#[test]
fn account_creation_failure_is_fatal() {
    let mut local = FakeAccountStore::absent("wd1");
    local.fail_create = true;
    let driver = orchestrator(
        local,
        FakeAccountStore::absent("wd2"),
        StationRunner::new("RECEIVER=\"ka9q\"\n"),
    );

    let Err(err) = driver.execute(84, Some(station_key())) else {
        panic!("creation failure should abort");
    };
    let ProvisionError::AccountCreation { host, user, .. } = err else {
        panic!("expected creation error, got {err}");
    };
    assert_eq!(host, "wd1");
    assert_eq!(user, "kj6mki_rz");
}

#[test]
fn smoke_test_failure_is_recorded_but_not_fatal() {
    let key = station_key();
    let local = FakeAccountStore::correct("wd1", &key);
    let partner = FakeAccountStore::correct("wd2", &key);
    let mut station = StationRunner::new("SIGNAL_LEVEL_UPLOAD_ID=\"kj6mki_rz\"\n");
    station.sftp_ok = false;
    let driver = orchestrator(local, partner, station);

    let outcome = driver
        .execute(84, Some(key))
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let SmokeTest::Failed { ref detail } = outcome.smoke_test else {
        panic!("smoke test should fail");
    };
    assert!(detail.contains("kj6mki_rz@wd1"), "detail: {detail}");
    assert!(!outcome.mutated());
}
