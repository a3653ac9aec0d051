//! Durable Snapshot Store
//!
//! One JSON record per device holding everything a restart needs:
//!
//! ```text
//! DurableSnapshot
//! ├── ledger          full Ledger
//! ├── motion          last_processed_end + sample_progress
//! ├── idle            idle watermark
//! └── sync            revision, outbox, delta watermarks, acked hash
//! ```
//!
//! File writes go to a unique temp file in the same directory, are fsynced,
//! then renamed over the previous snapshot, so a crash mid-write leaves the
//! last good snapshot in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::economy::idle::IdleClock;
use crate::economy::ledger::Ledger;
use crate::economy::motion::MotionDedupState;
use crate::sync::protocol::{DeviceId, DeviceRole};
use crate::sync::reconciler::ReconcilerState;

/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("Snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Snapshot could not be serialized.
    #[error("Snapshot encode failed: {0}")]
    Encode(String),

    /// Stored snapshot is unreadable or from an unknown layout.
    #[error("Snapshot decode failed: {0}")]
    Decode(String),
}

/// Everything persisted for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableSnapshot {
    /// Layout version.
    pub version: u32,
    /// Owning device.
    pub device_id: DeviceId,
    /// Owning device's role.
    pub role: DeviceRole,
    /// Wall-clock time of the write.
    pub saved_at: DateTime<Utc>,
    /// Full ledger.
    pub ledger: Ledger,
    /// Motion dedup watermarks.
    pub motion: MotionDedupState,
    /// Idle accrual watermark.
    pub idle: IdleClock,
    /// Sync bookkeeping.
    pub sync: ReconcilerState,
}

impl DurableSnapshot {
    /// Encode as pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, PersistenceError> {
        serde_json::to_vec_pretty(self).map_err(|e| PersistenceError::Encode(e.to_string()))
    }

    /// Decode and check the layout version.
    pub fn from_json(data: &[u8]) -> Result<Self, PersistenceError> {
        let snapshot: Self =
            serde_json::from_slice(data).map_err(|e| PersistenceError::Decode(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(PersistenceError::Decode(format!(
                "snapshot version {} is newer than supported {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// Snapshot storage backend.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last snapshot. `Ok(None)` means first run.
    async fn load(&self) -> Result<Option<DurableSnapshot>, PersistenceError>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &DurableSnapshot) -> Result<(), PersistenceError>;
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON file store with atomic replace.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store at `path`. Parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<DurableSnapshot>, PersistenceError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting fresh", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot = DurableSnapshot::from_json(&data)?;
        debug!("Loaded snapshot from {} ({} bytes)", self.path.display(), data.len());
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &DurableSnapshot) -> Result<(), PersistenceError> {
        let bytes = snapshot.to_json()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| PersistenceError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(())
    }
}

/// Write `bytes` to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", Uuid::new_v4().simple()));
    let tmp_path = PathBuf::from(tmp);

    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    fsync_dir(&parent)
}

#[cfg(target_family = "unix")]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(target_family = "unix"))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-memory store for tests and ephemeral devices.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<DurableSnapshot>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemorySnapshotStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail (write-failure simulation).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Last saved snapshot.
    pub async fn stored(&self) -> Option<DurableSnapshot> {
        self.slot.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<DurableSnapshot>, PersistenceError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, snapshot: &DurableSnapshot) -> Result<(), PersistenceError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        *self.slot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}
