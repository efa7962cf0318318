//! Station roster: the lookup table mapping a remote access client number
//! to its reporting station details.
//!
//! The roster is merged from an explicit ordered list of files. Earlier
//! files win: the first entry seen for a RAC is kept and later entries are
//! ignored. Every entry records which file supplied it so operators can see
//! where a value came from.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

/// Base TCP port for station reverse tunnels; a station's tunnel listens at
/// this base plus its RAC.
pub const TUNNEL_PORT_BASE: u16 = 35800;

/// Errors raised while loading or querying the roster.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RosterError {
    /// Raised when a roster file exists but cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a roster line cannot be parsed.
    #[error("malformed roster entry at {path}:{line}: {message}")]
    Parse {
        /// File containing the bad entry.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },
    /// Raised when a lookup finds no entry for the requested RAC.
    #[error("no roster entry for RAC {rac}")]
    UnknownStation {
        /// The RAC that was looked up.
        rac: u16,
    },
    /// Raised when a RAC would push the tunnel port past the valid range.
    #[error("RAC {rac} exceeds the tunnel port range")]
    PortOverflow {
        /// The out-of-range RAC.
        rac: u16,
    },
}

/// One station's roster entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StationEntry {
    /// Remote access client number.
    pub rac: u16,
    /// Reporter identifier as registered (callsign plus suffix).
    pub reporter: String,
    /// SSH user the station connects as.
    pub ssh_user: String,
    /// Upload mode flag (for example `AUTO`).
    pub upload_mode: String,
    /// Remaining fields, kept verbatim.
    pub extras: Vec<String>,
    /// Roster file that supplied this entry.
    pub provenance: Utf8PathBuf,
}

/// Merged station lookup table.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    entries: BTreeMap<u16, StationEntry>,
}

impl Roster {
    /// Loads and merges the given roster files in order.
    ///
    /// Absent files are skipped; the first entry per RAC wins.
    ///
    /// # Errors
    ///
    /// Returns [`RosterError::Io`] when a present file cannot be read and
    /// [`RosterError::Parse`] when a line is malformed.
    pub fn load(sources: &[Utf8PathBuf]) -> Result<Self, RosterError> {
        let mut entries: BTreeMap<u16, StationEntry> = BTreeMap::new();
        for path in sources {
            let Some(contents) = read_optional(path)? else {
                debug!(%path, "roster source absent, skipping");
                continue;
            };
            for (index, raw_line) in contents.lines().enumerate() {
                let line = raw_line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let entry = parse_entry(path, index + 1, line)?;
                entries.entry(entry.rac).or_insert(entry);
            }
        }
        Ok(Self { entries })
    }

    /// Returns the entry for `rac`.
    ///
    /// # Errors
    ///
    /// Returns [`RosterError::UnknownStation`] when no source supplied one.
    pub fn lookup(&self, rac: u16) -> Result<&StationEntry, RosterError> {
        self.entries
            .get(&rac)
            .ok_or(RosterError::UnknownStation { rac })
    }

    /// Number of merged entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no source supplied any entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, RosterError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let Some(file_name) = path.file_name() else {
        return Err(RosterError::Io {
            path: path.to_path_buf(),
            message: String::from("roster path is missing a filename"),
        });
    };

    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(RosterError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RosterError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn parse_entry(path: &Utf8Path, line: usize, raw: &str) -> Result<StationEntry, RosterError> {
    let parse_error = |message: String| RosterError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut fields = raw.split(',').map(str::trim);
    let rac_field = fields
        .next()
        .ok_or_else(|| parse_error(String::from("empty entry")))?;
    let rac = rac_field
        .parse::<u16>()
        .map_err(|err| parse_error(format!("bad RAC {rac_field:?}: {err}")))?;

    let reporter = fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| parse_error(String::from("missing reporter id")))?
        .to_owned();
    let ssh_user = fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| parse_error(String::from("missing ssh user")))?
        .to_owned();
    let upload_mode = fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| parse_error(String::from("missing upload mode")))?
        .to_owned();
    let extras = fields.map(ToOwned::to_owned).collect();

    Ok(StationEntry {
        rac,
        reporter,
        ssh_user,
        upload_mode,
        extras,
        provenance: path.to_path_buf(),
    })
}

/// Replaces every character outside `[A-Za-z0-9_]` with an underscore.
///
/// The result is a filesystem- and shell-safe account name; applying the
/// function twice yields the same output.
#[must_use]
pub fn sanitize_reporter(reporter: &str) -> String {
    reporter
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns the reverse tunnel port for `rac` (`35800 + rac`).
///
/// # Errors
///
/// Returns [`RosterError::PortOverflow`] when the sum leaves the `u16`
/// port range.
pub fn tunnel_port(rac: u16) -> Result<u16, RosterError> {
    TUNNEL_PORT_BASE
        .checked_add(rac)
        .ok_or(RosterError::PortOverflow { rac })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_roster(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        std::fs::write(&path, contents).unwrap_or_else(|err| panic!("write roster: {err}"));
        path
    }

    #[test]
    fn parses_the_documented_entry_shape() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = write_roster(&tmp, "ssr.conf", "84,kj6mki-rz,wsprdaemon,AUTO,,,\n");
        let roster = Roster::load(&[path.clone()]).unwrap_or_else(|err| panic!("load: {err}"));

        let entry = roster.lookup(84).unwrap_or_else(|err| panic!("lookup: {err}"));
        assert_eq!(entry.reporter, "kj6mki-rz");
        assert_eq!(entry.ssh_user, "wsprdaemon");
        assert_eq!(entry.upload_mode, "AUTO");
        assert_eq!(entry.provenance, path);
    }

    #[test]
    fn first_source_wins_and_provenance_records_it() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let local = write_roster(&tmp, "ssr.conf.local", "84,override-call,opuser,MANUAL,\n");
        let base = write_roster(&tmp, "ssr.conf", "84,kj6mki-rz,wsprdaemon,AUTO,\n12,n0call-1,wsprdaemon,AUTO,\n");

        let roster =
            Roster::load(&[local.clone(), base]).unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(roster.len(), 2);

        let entry = roster.lookup(84).unwrap_or_else(|err| panic!("lookup: {err}"));
        assert_eq!(entry.reporter, "override-call");
        assert_eq!(entry.provenance, local);
    }

    #[test]
    fn absent_sources_are_skipped() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let missing = Utf8PathBuf::from_path_buf(tmp.path().join("ssr.conf.hamsci"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        let base = write_roster(&tmp, "ssr.conf", "# stations\n\n7,ab1cde,wsprdaemon,AUTO,\n");

        let roster = Roster::load(&[missing, base]).unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn malformed_lines_name_file_and_line() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = write_roster(&tmp, "ssr.conf", "7,ab1cde,wsprdaemon,AUTO,\nnot-a-rac,x,y,z\n");

        let Err(err) = Roster::load(&[path]) else {
            panic!("malformed line should fail");
        };
        let RosterError::Parse { line, .. } = err else {
            panic!("expected parse error, got {err}");
        };
        assert_eq!(line, 2);
    }

    #[test]
    fn lookup_of_unknown_rac_fails() {
        let roster = Roster::default();
        assert!(matches!(
            roster.lookup(84),
            Err(RosterError::UnknownStation { rac: 84 })
        ));
    }

    #[test]
    fn sanitize_is_idempotent_and_safe() {
        let once = sanitize_reporter("kj6mki-rz/2");
        assert_eq!(once, "kj6mki_rz_2");
        assert_eq!(sanitize_reporter(&once), once);
        assert!(
            sanitize_reporter("a b!c@d#e")
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        );
    }

    #[test]
    fn tunnel_port_adds_the_base() {
        assert_eq!(
            tunnel_port(84).unwrap_or_else(|err| panic!("port: {err}")),
            35884
        );
        assert!(matches!(
            tunnel_port(u16::MAX),
            Err(RosterError::PortOverflow { .. })
        ));
    }
}
