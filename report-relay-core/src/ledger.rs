//! Durable set of files that have already been delivered.
//!
//! The backing file is append-only UTF-8 text with one normalized absolute path per
//! line. It is read wholesale when the ledger is opened and every [`SentLedger::add`]
//! appends, flushes and syncs a single line before the in-memory set is updated, so a
//! crash never loses a confirmed send. All access goes through one mutex.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write ledger {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to rotate ledger {path} to {backup}: {source}")]
    Rotate {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Normalized identity of a file: absolute (lexically, the file need not exist) and
/// lowercased, so comparisons are case-insensitive.
pub fn normalize_path(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.to_string_lossy().to_lowercase()
}

#[derive(Debug)]
struct LedgerState {
    entries: HashSet<String>,
    file: File,
}

#[derive(Debug)]
pub struct SentLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl SentLedger {
    /// Opens (creating if needed) the ledger at `path` and loads every entry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Write {
                path: path.clone(),
                source,
            })?;
        }
        let entries = Self::load_all(&path)?;
        let file = open_append(&path)?;
        info!(
            path = %path.display(),
            entries = entries.len(),
            "[LEDGER] Loaded sent-file ledger"
        );
        Ok(Self {
            path,
            state: Mutex::new(LedgerState { entries, file }),
        })
    }

    /// Reads every entry of the ledger file. A missing file is an empty ledger.
    pub fn load_all(path: &Path) -> Result<HashSet<String>, LedgerError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let mut entries = HashSet::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| LedgerError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let line = line.trim();
            if !line.is_empty() {
                entries.insert(normalize_path(Path::new(line)));
            }
        }
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().entries.contains(&normalize_path(path))
    }

    /// Records `path` as delivered. Returns `false` when it was already present.
    pub fn add(&self, path: &Path) -> Result<bool, LedgerError> {
        let key = normalize_path(path);
        let mut state = self.lock();
        if state.entries.contains(&key) {
            return Ok(false);
        }
        write_line(&mut state.file, &key).map_err(|source| LedgerError::Write {
            path: self.path.clone(),
            source,
        })?;
        state.entries.insert(key);
        debug!(path = %path.display(), "[LEDGER] Recorded delivered file");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the current ledger file to a timestamped backup and starts empty.
    /// Returns the backup path, or `None` if there was no file to archive.
    pub fn clear(&self) -> Result<Option<PathBuf>, LedgerError> {
        let mut state = self.lock();
        let backup = backup_path(&self.path);
        let archived = if self.path.exists() {
            fs::rename(&self.path, &backup).map_err(|source| LedgerError::Rotate {
                path: self.path.clone(),
                backup: backup.clone(),
                source,
            })?;
            Some(backup)
        } else {
            None
        };
        state.file = open_append(&self.path)?;
        let dropped = state.entries.len();
        state.entries.clear();
        info!(
            path = %self.path.display(),
            backup = ?archived,
            dropped,
            "[LEDGER] Cleared sent-file ledger"
        );
        Ok(archived)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> Result<File, LedgerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LedgerError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn write_line(file: &mut File, line: &str) -> io::Result<()> {
    writeln!(file, "{line}")?;
    file.flush()?;
    file.sync_data()
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    path.with_file_name(format!("{name}.{stamp}.bak"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn adding_same_path_twice_keeps_one_entry() {
        let dir = tempdir().unwrap();
        let ledger = SentLedger::open(dir.path().join("sent.txt")).unwrap();
        let file = dir.path().join("user_error.pdf");

        assert!(ledger.add(&file).unwrap());
        assert!(!ledger.add(&file).unwrap());
        assert_eq!(ledger.len(), 1);

        let on_disk = SentLedger::load_all(ledger.path()).unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[test]
    fn comparison_ignores_case() {
        let dir = tempdir().unwrap();
        let ledger = SentLedger::open(dir.path().join("sent.txt")).unwrap();
        ledger.add(&dir.path().join("Server_Report.PDF")).unwrap();
        assert!(ledger.contains(&dir.path().join("server_report.pdf")));
        assert!(!ledger.add(&dir.path().join("SERVER_REPORT.pdf")).unwrap());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("state").join("sent.txt");
        let file = dir.path().join("warn.pdf");
        {
            let ledger = SentLedger::open(&ledger_path).unwrap();
            ledger.add(&file).unwrap();
        }
        let reopened = SentLedger::open(&ledger_path).unwrap();
        assert!(reopened.contains(&file));
    }

    #[test]
    fn load_ignores_blank_lines() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("sent.txt");
        fs::write(&ledger_path, "/reports/a.pdf\n\n   \n/reports/B.pdf\n").unwrap();
        let entries = SentLedger::load_all(&ledger_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains("/reports/b.pdf"));
    }

    #[test]
    fn clear_rotates_to_backup_and_empties() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("sent.txt");
        let ledger = SentLedger::open(&ledger_path).unwrap();
        let file = dir.path().join("user.pdf");
        ledger.add(&file).unwrap();

        let backup = ledger.clear().unwrap().expect("existing ledger is archived");
        assert!(backup.exists());
        assert!(fs::read_to_string(&backup).unwrap().contains("user.pdf"));
        assert!(ledger.is_empty());
        assert!(!ledger.contains(&file));

        assert!(ledger.add(&file).unwrap());
        assert_eq!(SentLedger::load_all(&ledger_path).unwrap().len(), 1);
    }
}
