//! Single-writer enforcement for recordings.
//!
//! Two layers guard a recording name: a process-wide registry of names held
//! for writing, and an advisory OS lock on `<name>.lock` next to the
//! recording, which covers writers in other processes. The OS releases the
//! advisory lock when its owner dies, so a lock file that still carries owner
//! metadata but is not locked belongs to a crashed writer and is reclaimed.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

use crate::{Error, Result};

pub const LOCK_EXTENSION: &str = "lock";

/// Owner metadata written into a held lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: chrono::Utc::now(),
        }
    }
}

/// Process-wide registry of recording paths held for writing.
#[derive(Debug, Default)]
pub struct WriterRegistry {
    held: Mutex<HashSet<PathBuf>>,
}

impl WriterRegistry {
    /// The registry shared by every container in this process.
    pub fn global() -> &'static WriterRegistry {
        static REGISTRY: OnceLock<WriterRegistry> = OnceLock::new();
        REGISTRY.get_or_init(WriterRegistry::default)
    }

    pub fn is_held(&self, recording_path: &Path) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(recording_path))
            .unwrap_or(false)
    }

    /// Acquires the write lock for the recording stored at `recording_path`.
    pub fn acquire(&'static self, name: &str, recording_path: &Path) -> Result<WriteLock> {
        let key = recording_path.to_path_buf();
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::InvalidState {
                message: "writer registry poisoned".to_string(),
            })?;

        if held.contains(&key) {
            return Err(Error::AlreadyOpen {
                name: name.to_string(),
            });
        }

        let lock_path = recording_path.with_extension(LOCK_EXTENSION);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if file.try_lock_exclusive().is_err() {
            debug!(recording = %name, "lock held by another process");
            return Err(Error::AlreadyOpen {
                name: name.to_string(),
            });
        }

        let mut previous = String::new();
        file.read_to_string(&mut previous)?;
        if !previous.trim().is_empty() {
            match serde_json::from_str::<LockOwner>(&previous) {
                Ok(owner) => warn!(
                    recording = %name,
                    stale_pid = owner.pid,
                    stale_host = %owner.host,
                    since = %owner.acquired_at,
                    "reclaiming stale write lock"
                ),
                Err(_) => warn!(recording = %name, "reclaiming unreadable stale write lock"),
            }
        }

        let owner = LockOwner::current();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&serde_json::to_vec(&owner)?)?;
        file.sync_all()?;

        held.insert(key.clone());
        Ok(WriteLock {
            registry: self,
            key,
            file,
        })
    }

    /// Runs [`acquire`](Self::acquire) on the blocking pool; the lock file
    /// is created, locked and written with synchronous calls.
    pub async fn acquire_async(&'static self, name: &str, recording_path: &Path) -> Result<WriteLock> {
        let name = name.to_string();
        let path = recording_path.to_path_buf();
        tokio::task::spawn_blocking(move || self.acquire(&name, &path))
            .await
            .map_err(|e| Error::InvalidState {
                message: format!("write lock task failed: {}", e),
            })?
    }

    fn release(&self, key: &Path) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(key);
        }
    }
}

/// Held write lock. Released when dropped.
///
/// The lock file is emptied rather than removed on release; removing it would
/// let a concurrent acquirer lock an unlinked inode.
#[derive(Debug)]
pub struct WriteLock {
    registry: &'static WriterRegistry,
    key: PathBuf,
    file: File,
}

impl WriteLock {
    pub fn owner(&mut self) -> Result<LockOwner> {
        let mut content = String::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut content)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(path = ?self.key, error = %e, "failed to clear lock owner");
        }
        let _ = FileExt::unlock(&self.file);
        self.registry.release(&self.key);
    }
}
