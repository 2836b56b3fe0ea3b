//! Advisory cross-process locking for the metadata registries.
//!
//! Each registry directory contains a lock file. Writers take an exclusive
//! POSIX record lock on it for the duration of a mutation, and record a
//! change token in the file body so that other holders can cheaply detect
//! that the registry changed underneath them and reload it.
//!
//! The token is 32 bytes: the writer's pid, a per-holder counter, and random
//! bytes. Only equality matters; a holder compares the token it last saw
//! with the one currently in the file.
//!
//! In-process serialization is not this type's job. The coordinator wraps
//! each store in a mutex; the lock file provides cross-process exclusion and
//! change signalling only. POSIX record locks are per-process, so two
//! handles to the same path within one process never block each other.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::rngs::OsRng;
use rand::TryRngCore;
use rustix::fs::{fcntl_lock, FlockOperation};

/// Size of the change token stored in the lock file.
const TOKEN_SIZE: usize = 32;

/// Error types for lock file operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// I/O error reading or writing the lock file.
    #[error("I/O error on lock file: {0}")]
    Io(#[from] std::io::Error),

    /// The lock syscall itself failed.
    #[error("lock operation failed: {0}")]
    Lock(#[from] rustix::io::Errno),
}

/// Result type for lock file operations.
pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Default)]
struct TokenState {
    /// The token this holder most recently observed, if any.
    seen: Option<[u8; TOKEN_SIZE]>,
    /// Monotonic per-holder counter mixed into freshly written tokens.
    counter: u64,
}

/// An exclusive advisory file lock with change detection.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
    state: Mutex<TokenState>,
}

impl LockFile {
    /// Open (creating if necessary, mode 0600) the lock file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            state: Mutex::new(TokenState::default()),
        })
    }

    /// Get the path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive lock, blocking until it is granted.
    pub fn lock(&self) -> Result<()> {
        fcntl_lock(self.file.as_fd(), FlockOperation::LockExclusive)?;
        Ok(())
    }

    /// Release the lock. Releasing a lock that is not held is a no-op, as is
    /// a failure to release: the OS drops the lock when the file closes.
    pub fn unlock(&self) {
        let _ = fcntl_lock(self.file.as_fd(), FlockOperation::Unlock);
    }

    /// Write a fresh change token so other holders observe a modification.
    pub fn touch(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lock token state poisoned");
        state.counter = state.counter.wrapping_add(1);

        let mut token = [0u8; TOKEN_SIZE];
        token[..4].copy_from_slice(&std::process::id().to_le_bytes());
        token[4..12].copy_from_slice(&state.counter.to_le_bytes());
        OsRng
            .try_fill_bytes(&mut token[12..])
            .expect("reading from the OS random source failed");

        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&token)?;
        state.seen = Some(token);
        Ok(())
    }

    /// Report whether the token advanced since this holder last looked.
    ///
    /// The current token becomes the new baseline, so two consecutive calls
    /// without an intervening writer return `true` at most once. A holder
    /// that has never seen a token reports `true` against a non-empty file,
    /// which forces an initial load.
    pub fn modified(&self) -> Result<bool> {
        let mut state = self.state.lock().expect("lock token state poisoned");
        let current = self.read_token()?;
        let changed = state.seen != current;
        state.seen = current;
        Ok(changed)
    }

    fn read_token(&self) -> Result<Option<[u8; TOKEN_SIZE]>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; TOKEN_SIZE];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = LockFile::open(dir.path().join("test.lock")).unwrap();

        lockfile.lock().unwrap();
        lockfile.unlock();
        lockfile.lock().unwrap();
        lockfile.unlock();
    }

    #[test]
    fn test_fresh_file_is_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = LockFile::open(dir.path().join("test.lock")).unwrap();

        // No token written yet, nothing seen yet: no change to report.
        assert!(!lockfile.modified().unwrap());
    }

    #[test]
    fn test_own_touch_is_not_a_modification() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = LockFile::open(dir.path().join("test.lock")).unwrap();

        lockfile.touch().unwrap();
        assert!(!lockfile.modified().unwrap());
    }

    #[test]
    fn test_other_holder_observes_touch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let writer = LockFile::open(&path).unwrap();
        let reader = LockFile::open(&path).unwrap();

        writer.touch().unwrap();
        assert!(reader.modified().unwrap());
        // The observation becomes the new baseline.
        assert!(!reader.modified().unwrap());

        writer.touch().unwrap();
        assert!(reader.modified().unwrap());
    }

    #[test]
    fn test_existing_token_seen_by_new_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        LockFile::open(&path).unwrap().touch().unwrap();

        let newcomer = LockFile::open(&path).unwrap();
        assert!(newcomer.modified().unwrap());
    }
}
