//! Parameterised coverage for roster parsing, account-name sanitisation,
//! and tunnel port derivation.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use wsprsync::roster::{Roster, RosterError, sanitize_reporter, tunnel_port};

#[fixture]
fn roster_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

fn write_source(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join(name))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write source: {err}"));
    path
}

#[rstest]
#[case("kj6mki-rz", "kj6mki_rz")]
#[case("ab1cde/2", "ab1cde_2")]
#[case("n0call.portable", "n0call_portable")]
#[case("already_safe_1", "already_safe_1")]
fn sanitize_replaces_unsafe_characters(#[case] input: &str, #[case] expected: &str) {
    assert_eq!(sanitize_reporter(input), expected);
}

#[rstest]
#[case("kj6mki-rz")]
#[case("a b!c@d")]
#[case("____")]
fn sanitize_is_idempotent(#[case] input: &str) {
    let once = sanitize_reporter(input);
    assert_eq!(sanitize_reporter(&once), once);
}

#[rstest]
#[case(84, 35884)]
#[case(0, 35800)]
#[case(100, 35900)]
fn tunnel_ports_offset_the_base(#[case] rac: u16, #[case] expected: u16) {
    assert_eq!(
        tunnel_port(rac).unwrap_or_else(|err| panic!("port: {err}")),
        expected
    );
}

#[rstest]
fn entry_fields_come_out_of_the_comma_layout(roster_dir: TempDir) {
    let path = write_source(&roster_dir, "ssr.conf", "84,kj6mki-rz,wsprdaemon,AUTO,,,\n");
    let roster = Roster::load(&[path]).unwrap_or_else(|err| panic!("load: {err}"));

    let entry = roster.lookup(84).unwrap_or_else(|err| panic!("lookup: {err}"));
    assert_eq!(entry.ssh_user, "wsprdaemon");
    assert_eq!(entry.reporter, "kj6mki-rz");
    assert_eq!(sanitize_reporter(&entry.reporter), "kj6mki_rz");
}

#[rstest]
fn merged_sources_prefer_the_earliest_file(roster_dir: TempDir) {
    let local = write_source(
        &roster_dir,
        "ssr.conf.local",
        "84,kj6mki-rz,opsuser,MANUAL,\n",
    );
    let base = write_source(&roster_dir, "ssr.conf", "84,kj6mki-rz,wsprdaemon,AUTO,\n");
    let roster =
        Roster::load(&[local.clone(), base]).unwrap_or_else(|err| panic!("load: {err}"));

    let entry = roster.lookup(84).unwrap_or_else(|err| panic!("lookup: {err}"));
    assert_eq!(entry.ssh_user, "opsuser");
    assert_eq!(entry.provenance, local);
}

#[rstest]
fn lookups_outside_the_roster_fail(roster_dir: TempDir) {
    let path = write_source(&roster_dir, "ssr.conf", "84,kj6mki-rz,wsprdaemon,AUTO,\n");
    let roster = Roster::load(&[path]).unwrap_or_else(|err| panic!("load: {err}"));

    assert!(matches!(
        roster.lookup(12),
        Err(RosterError::UnknownStation { rac: 12 })
    ));
}
