//! Durable object store seam
//!
//! Blocks keep their journal, lock objects, priority counters and data
//! objects inside a shared volume. The orchestration engine only sees the
//! [`VolumeHandle`] trait; [`LocalConnector`] maps volumes onto directories
//! and [`MemoryConnector`] keeps everything in process.

mod local;
mod memory;

pub use local::{LocalConnector, LocalVolume};
pub use memory::{MemoryConnector, MemoryVolume};

use async_trait::async_trait;
use blockmesh_common::VolumeName;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Durable store error
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock failed on {path}: {reason}")]
    Lock { path: String, reason: String },

    #[error("Volume {0} is closed")]
    Closed(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path),
            _ => Self::Io { path, source },
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
}

/// Open connection to one volume. Paths are relative to the volume root.
#[async_trait]
pub trait VolumeHandle: Send + Sync {
    /// Volume name
    fn name(&self) -> &str;

    /// Create a directory and its parents, existing is fine
    async fn mkdir(&self, path: &str) -> StoreResult<()>;

    /// Create an empty object. With `exclusive`, an existing object is an error.
    async fn create(&self, path: &str, exclusive: bool) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    async fn stat(&self, path: &str) -> StoreResult<ObjectStat>;

    /// Read the whole object
    async fn read(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Append in one durable write, creating the object if needed.
    /// Returns the object length after the write.
    async fn append(&self, path: &str, data: &[u8]) -> StoreResult<u64>;

    async fn truncate(&self, path: &str, size: u64) -> StoreResult<()>;

    /// Write zeroes over `[offset, offset + len)`
    async fn zero_fill(&self, path: &str, offset: u64, len: u64) -> StoreResult<()>;

    async fn unlink(&self, path: &str) -> StoreResult<()>;

    /// Names of the entries of a directory
    async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Take an exclusive lock on an object, creating it if needed.
    /// Waits until the lock is available.
    async fn lock(&self, path: &str) -> StoreResult<ObjectLock>;

    async fn get_xattr(&self, path: &str, name: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> StoreResult<()>;

    /// Release the connection
    async fn close(&self) -> StoreResult<()>;
}

/// Opens volume connections
#[async_trait]
pub trait VolumeConnector: Send + Sync {
    async fn connect(&self, volume: &VolumeName) -> StoreResult<Arc<dyn VolumeHandle>>;
}

/// Releases the underlying lock primitive
pub trait LockRelease: Send {
    fn release(self: Box<Self>) -> StoreResult<()>;
}

/// Held exclusive lock on a store object, released on drop
pub struct ObjectLock {
    path: String,
    inner: Option<Box<dyn LockRelease>>,
}

impl ObjectLock {
    pub fn new(path: impl Into<String>, inner: Box<dyn LockRelease>) -> Self {
        Self {
            path: path.into(),
            inner: Some(inner),
        }
    }

    /// Locked object path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Release explicitly so the caller can see failures
    pub fn release(mut self) -> StoreResult<()> {
        match self.inner.take() {
            Some(inner) => inner.release(),
            None => Ok(()),
        }
    }
}

impl Drop for ObjectLock {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take()
            && let Err(e) = inner.release()
        {
            warn!("Failed to release lock on {}: {}", self.path, e);
        }
    }
}

impl std::fmt::Debug for ObjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLock")
            .field("path", &self.path)
            .field("held", &self.inner.is_some())
            .finish()
    }
}

/// Parent directory of a volume-relative path
pub(crate) fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}
