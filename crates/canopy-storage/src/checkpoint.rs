//! Cursor checkpoint persistence.
//!
//! The [`CheckpointStore`] trait abstracts where the last-seen stream
//! sequence number lives so the orchestrator doesn't need to know whether
//! it is a local file, a database row, or memory.
//!
//! [`FileCheckpointStore`] is the production implementation: a small JSON
//! document replaced atomically through a temp file and rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from checkpoint persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Filesystem I/O error.
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// Persisted cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Highest sequence number observed when the checkpoint was taken.
    pub seq: u64,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

/// Async trait for cursor persistence.
///
/// `load` is called once at startup. `save` is called on a fixed interval
/// and once more during graceful shutdown, always with non-decreasing
/// values. A successful `save` must be visible to a later `load`, including
/// one in a new process.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the last saved sequence number, or `None` if nothing was
    /// ever saved.
    async fn load(&self) -> Result<Option<u64>, CheckpointError>;

    /// Persists `seq` as the resume position.
    async fn save(&self, seq: u64) -> Result<(), CheckpointError>;
}

/// [`CheckpointStore`] backed by one JSON file on local disk.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store that reads and writes `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the checkpoint file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, CheckpointError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&self.path, e)),
        };
        let record: CheckpointRecord = serde_json::from_slice(&data)?;
        debug!(path = %self.path.display(), seq = record.seq, "loaded checkpoint");
        Ok(Some(record.seq))
    }

    async fn save(&self, seq: u64) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            seq,
            saved_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(parent, e))?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Self::io_error(&self.path, e))?;

        debug!(path = %self.path.display(), seq, "saved checkpoint");
        Ok(())
    }
}

/// In-memory [`CheckpointStore`] that remembers every save.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    initial: Option<u64>,
    saves: Mutex<Vec<u64>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose first `load` returns `seq`.
    #[must_use]
    pub fn with_initial(seq: u64) -> Self {
        Self {
            initial: Some(seq),
            saves: Mutex::new(Vec::new()),
        }
    }

    /// Every value passed to `save`, oldest first.
    #[must_use]
    pub fn saves(&self) -> Vec<u64> {
        self.saves.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, CheckpointError> {
        Ok(self.saves.lock().last().copied().or(self.initial))
    }

    async fn save(&self, seq: u64) -> Result<(), CheckpointError> {
        self.saves.lock().push(seq);
        Ok(())
    }
}
