use chrono::{DateTime, Duration as Days, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{LocalStore, LocalStoreError, SetOptions};
use crate::clock::{Clock, SystemClock};

const LOCK_FILE: &str = ".ladder.lock";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// On-disk form of one entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    blob: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy)]
enum LockKind {
    Shared,
    Exclusive,
}

/// Advisory lock on the store directory, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path, timeout: Duration, kind: LockKind) -> Result<Self, LockFailure> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            let busy = match kind {
                LockKind::Shared => file.try_lock_shared().is_err(),
                LockKind::Exclusive => file.try_lock_exclusive().is_err(),
            };
            if !busy {
                return Ok(Self { file });
            }
            if start.elapsed() >= timeout {
                return Err(LockFailure::Timeout {
                    path,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

enum LockFailure {
    Timeout { path: PathBuf, waited: Duration },
    Io(io::Error),
}

impl From<io::Error> for LockFailure {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl LockFailure {
    fn for_key(self, key: &str) -> LocalStoreError {
        match self {
            Self::Timeout { path, waited } => LocalStoreError::Locked { path, waited },
            Self::Io(source) => LocalStoreError::Io {
                key: key.to_string(),
                source,
            },
        }
    }
}

/// [`LocalStore`] keeping one JSON envelope file per key in a directory.
///
/// Reads take a shared advisory lock on the directory and writes an
/// exclusive one, so several processes can share a directory. Writes go to a
/// temporary file that is renamed into place. Expired entries read as absent
/// and are deleted.
pub struct FileLocalStore {
    dir: PathBuf,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FileLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLocalStore")
            .field("dir", &self.dir)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl FileLocalStore {
    /// Store rooted at `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            clock,
        }
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    fn lock(&self, key: &str, kind: LockKind) -> Result<DirLock, LocalStoreError> {
        DirLock::acquire(&self.dir, self.lock_timeout, kind).map_err(|failure| failure.for_key(key))
    }

    /// Delete `key` if it is still expired under the exclusive lock. Another
    /// process may have rewritten it since the shared read.
    fn expire(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let _guard = self.lock(key, LockKind::Exclusive)?;
        match self.read_envelope(key)? {
            Some(fresh) if !self.is_expired(&fresh) => Ok(Some(fresh.blob)),
            Some(_) => {
                tracing::debug!(key, "local entry expired");
                remove_file(&self.entry_path(key)).map_err(|source| LocalStoreError::Io {
                    key: key.to_string(),
                    source,
                })?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn is_expired(&self, envelope: &Envelope) -> bool {
        envelope.expires_at.is_some_and(|at| self.clock.now() >= at)
    }

    fn read_envelope(&self, key: &str) -> Result<Option<Envelope>, LocalStoreError> {
        let path = self.entry_path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LocalStoreError::Io {
                    key: key.to_string(),
                    source,
                });
            }
        };
        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                tracing::warn!(key, path = %path.display(), error = %err, "unreadable local entry ignored");
                Ok(None)
            }
        }
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let envelope = {
            let _guard = self.lock(key, LockKind::Shared)?;
            self.read_envelope(key)?
        };
        let Some(envelope) = envelope else {
            return Ok(None);
        };

        if self.is_expired(&envelope) {
            return self.expire(key);
        }
        Ok(Some(envelope.blob))
    }

    fn set(&mut self, key: &str, blob: &str, options: SetOptions) -> Result<(), LocalStoreError> {
        let envelope = Envelope {
            blob: blob.to_string(),
            expires_at: options
                .expires_in_days
                .map(|days| self.clock.now() + Days::days(i64::from(days))),
        };
        let text = serde_json::to_string(&envelope).map_err(|source| LocalStoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        let _guard = self.lock(key, LockKind::Exclusive)?;
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| LocalStoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    fn remove(&mut self, key: &str) -> Result<(), LocalStoreError> {
        let _guard = self.lock(key, LockKind::Exclusive)?;
        remove_file(&self.entry_path(key)).map_err(|source| LocalStoreError::Io {
            key: key.to_string(),
            source,
        })
    }
}

fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Filesystem-safe stem for `key`: ASCII alphanumerics, `-` and `_` pass
/// through, everything else is `%XX`-escaped byte by byte.
fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn stems_escape_unsafe_bytes() {
        assert_eq!(file_stem("tasks_history"), "tasks_history");
        assert_eq!(file_stem("a/b.c"), "a%2Fb%2Ec");
    }

    #[test]
    fn set_get_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileLocalStore::new(dir.path());
        assert_eq!(store.get("tasks").unwrap(), None);
        store.set("tasks", "[1]", SetOptions::default()).unwrap();
        assert_eq!(store.get("tasks").unwrap().as_deref(), Some("[1]"));
        store.set("tasks", "[2]", SetOptions::default()).unwrap();
        assert_eq!(store.get("tasks").unwrap().as_deref(), Some("[2]"));
        store.remove("tasks").unwrap();
        store.remove("tasks").unwrap();
        assert_eq!(store.get("tasks").unwrap(), None);
    }

    #[test]
    fn expired_entries_are_deleted_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::from_millis(0));
        let mut store = FileLocalStore::with_clock(dir.path(), clock.clone());
        store.set("k", "v", SetOptions::expiring_in(1)).unwrap();
        assert!(store.entry_path("k").exists());
        clock.advance(Days::days(2));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(!store.entry_path("k").exists());
    }

    #[test]
    fn entry_rewritten_after_expiry_check_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::from_millis(0));
        let mut store = FileLocalStore::with_clock(dir.path(), clock.clone());
        store.set("k", "old", SetOptions::expiring_in(1)).unwrap();
        clock.advance(Days::days(2));
        let stale = store.read_envelope("k").unwrap().unwrap();
        assert!(store.is_expired(&stale));

        let mut other = FileLocalStore::with_clock(dir.path(), clock.clone());
        other.set("k", "new", SetOptions::expiring_in(1)).unwrap();

        assert_eq!(store.expire("k").unwrap().as_deref(), Some("new"));
        assert!(store.entry_path("k").exists());
    }

    #[test]
    fn corrupt_entry_reads_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLocalStore::new(dir.path());
        fs::write(store.entry_path("k"), "not an envelope").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn held_exclusive_lock_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store =
            FileLocalStore::new(dir.path()).with_lock_timeout(Duration::from_millis(30));
        let _held = DirLock::acquire(dir.path(), Duration::from_secs(1), LockKind::Exclusive)
            .ok()
            .expect("lock");
        let err = store.set("k", "v", SetOptions::default()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::LocalStoreLocked);
    }
}
