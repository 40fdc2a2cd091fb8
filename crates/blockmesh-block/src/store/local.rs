//! Directory-backed volumes
//!
//! Every volume is a sub-directory of the configured root. Exclusive locks
//! are `flock(2)` on the lock object. Extended attributes are emulated by a
//! hidden JSON sidecar next to the object (`.<name>.xattr`), which keeps the
//! store usable on filesystems mounted without user xattr support.

use super::{LockRelease, ObjectLock, ObjectStat, StoreError, StoreResult, VolumeConnector, VolumeHandle};
use async_trait::async_trait;
use blockmesh_common::VolumeName;
use nix::fcntl::{Flock, FlockArg};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Zero-fill write granularity
const ZERO_CHUNK: usize = 1024 * 1024;

/// Connects to volumes laid out as directories under a root
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory backing a volume
    pub async fn create_volume(&self, volume: &VolumeName) -> StoreResult<()> {
        let dir = self.root.join(volume.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(dir.display().to_string(), e))
    }
}

#[async_trait]
impl VolumeConnector for LocalConnector {
    async fn connect(&self, volume: &VolumeName) -> StoreResult<Arc<dyn VolumeHandle>> {
        let dir = self.root.join(volume.as_str());
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StoreError::NotFound(volume.to_string())),
            Err(e) => return Err(StoreError::io(volume.to_string(), e)),
        }
        info!("Connected to volume {} at {:?}", volume, dir);
        Ok(Arc::new(LocalVolume {
            name: volume.to_string(),
            root: dir,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One volume directory
#[derive(Debug)]
pub struct LocalVolume {
    name: String,
    root: PathBuf,
    closed: AtomicBool,
}

impl LocalVolume {
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.name.clone()));
        }
        Ok(self.root.join(path))
    }

    fn xattr_path(full: &Path) -> PathBuf {
        let file = full
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        full.with_file_name(format!(".{file}.xattr"))
    }

    async fn load_xattrs(&self, path: &str, full: &Path) -> StoreResult<BTreeMap<String, String>> {
        if !fs::try_exists(full)
            .await
            .map_err(|e| StoreError::io(path, e))?
        {
            return Err(StoreError::NotFound(path.to_string()));
        }
        match fs::read(Self::xattr_path(full)).await {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| StoreError::Io {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

struct FlockGuard {
    path: String,
    flock: Flock<std::fs::File>,
}

impl LockRelease for FlockGuard {
    fn release(self: Box<Self>) -> StoreResult<()> {
        let Self { path, flock } = *self;
        flock
            .unlock()
            .map(drop)
            .map_err(|(_, errno)| StoreError::Lock {
                path,
                reason: errno.to_string(),
            })
    }
}

#[async_trait]
impl VolumeHandle for LocalVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mkdir(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn create(&self, path: &str, exclusive: bool) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let mut opts = OpenOptions::new();
        opts.write(true);
        if exclusive {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        opts.open(&full)
            .await
            .map(drop)
            .map_err(|e| StoreError::io(path, e))
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        fs::try_exists(&full)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn stat(&self, path: &str) -> StoreResult<ObjectStat> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(ObjectStat { size: meta.len() })
    }

    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).await.map_err(|e| StoreError::io(path, e))
    }

    async fn append(&self, path: &str, data: &[u8]) -> StoreResult<u64> {
        let full = self.resolve(path)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(path, e))?;
        Ok(meta.len())
    }

    async fn truncate(&self, path: &str, size: u64) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.set_len(size)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.sync_data().await.map_err(|e| StoreError::io(path, e))
    }

    async fn zero_fill(&self, path: &str, offset: u64, len: u64) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StoreError::io(path, e))?;

        let zeros = vec![0u8; ZERO_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(ZERO_CHUNK, |r| r.min(ZERO_CHUNK));
            file.write_all(&zeros[..n])
                .await
                .map_err(|e| StoreError::io(path, e))?;
            remaining -= n as u64;
        }
        file.sync_data().await.map_err(|e| StoreError::io(path, e))
    }

    async fn unlink(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        if let Err(e) = fs::remove_file(Self::xattr_path(&full)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Failed to remove xattr sidecar of {}: {}", path, e);
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let full = self.resolve(path)?;
        let mut dir = fs::read_dir(&full)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(path, e))?
        {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn lock(&self, path: &str) -> StoreResult<ObjectLock> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }

        let owned = path.to_string();
        let flock = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&full)
                .map_err(|e| StoreError::io(owned.clone(), e))?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| StoreError::Lock {
                path: owned,
                reason: errno.to_string(),
            })
        })
        .await
        .map_err(|e| StoreError::Lock {
            path: path.to_string(),
            reason: e.to_string(),
        })??;

        debug!("Locked {} on volume {}", path, self.name);
        Ok(ObjectLock::new(
            path,
            Box::new(FlockGuard {
                path: path.to_string(),
                flock,
            }),
        ))
    }

    async fn get_xattr(&self, path: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        let attrs = self.load_xattrs(path, &full).await?;
        Ok(attrs.get(name).map(|v| v.clone().into_bytes()))
    }

    async fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let mut attrs = self.load_xattrs(path, &full).await?;
        attrs.insert(name.to_string(), String::from_utf8_lossy(value).into_owned());

        let data = serde_json::to_vec(&attrs).map_err(|e| StoreError::Io {
            path: path.to_string(),
            source: std::io::Error::other(e),
        })?;
        let sidecar = Self::xattr_path(&full);
        let tmp = sidecar.with_extension("xattr.tmp");
        fs::write(&tmp, &data)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        fs::rename(&tmp, &sidecar)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        debug!("Closed volume {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_volume(root: &Path) -> Arc<dyn VolumeHandle> {
        let connector = LocalConnector::new(root);
        let volume = VolumeName::new("vol").unwrap();
        connector.create_volume(&volume).await.unwrap();
        connector.connect(&volume).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_missing_volume() {
        let dir = tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());
        let err = connector
            .connect(&VolumeName::new("nope").unwrap())
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let volume = open_volume(dir.path()).await;
        volume.mkdir("block-meta").await.unwrap();

        assert_eq!(volume.append("block-meta/b1", b"HA: 1\n").await.unwrap(), 6);
        assert_eq!(volume.append("block-meta/b1", b"SIZE: 9\n").await.unwrap(), 14);
        assert_eq!(volume.read("block-meta/b1").await.unwrap(), b"HA: 1\nSIZE: 9\n");
        assert_eq!(volume.list_dir("block-meta").await.unwrap(), vec!["b1"]);
    }

    #[tokio::test]
    async fn test_create_truncate_zero_fill() {
        let dir = tempdir().unwrap();
        let volume = open_volume(dir.path()).await;
        volume.mkdir("block-store").await.unwrap();

        volume.create("block-store/g1", true).await.unwrap();
        assert!(volume.create("block-store/g1", true).await.is_err());
        volume.truncate("block-store/g1", 4096).await.unwrap();
        volume.zero_fill("block-store/g1", 0, 4096).await.unwrap();
        assert_eq!(volume.stat("block-store/g1").await.unwrap().size, 4096);

        volume.unlink("block-store/g1").await.unwrap();
        assert!(!volume.exists("block-store/g1").await.unwrap());
        assert!(volume.unlink("block-store/g1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_xattr_sidecar() {
        let dir = tempdir().unwrap();
        let volume = open_volume(dir.path()).await;
        volume.mkdir("block-meta").await.unwrap();

        assert!(volume.get_xattr("block-meta/.prio.info", "user.a").await.is_err());
        volume.create("block-meta/.prio.info", false).await.unwrap();
        assert_eq!(volume.get_xattr("block-meta/.prio.info", "user.a").await.unwrap(), None);

        volume.set_xattr("block-meta/.prio.info", "user.a", b"3").await.unwrap();
        assert_eq!(
            volume.get_xattr("block-meta/.prio.info", "user.a").await.unwrap(),
            Some(b"3".to_vec())
        );
        // sidecar stays hidden
        let names = volume.list_dir("block-meta").await.unwrap();
        assert!(names.iter().all(|n| n.starts_with('.')));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let volume = open_volume(dir.path()).await;

        let lock = volume.lock("block-meta/.locks/b1").await.unwrap();
        let contender = Arc::clone(&volume);
        let waiter = tokio::spawn(async move {
            let lock = contender.lock("block-meta/.locks/b1").await.unwrap();
            lock.release().unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        lock.release().unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_volume_rejects_io() {
        let dir = tempdir().unwrap();
        let volume = open_volume(dir.path()).await;
        volume.close().await.unwrap();
        assert!(matches!(
            volume.exists("block-meta").await,
            Err(StoreError::Closed(_))
        ));
    }
}
