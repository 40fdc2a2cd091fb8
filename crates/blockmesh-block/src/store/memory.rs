//! In-process volumes
//!
//! Used by the test suites. Supports fault injection on writes under a path
//! prefix and counts connects and closes so cache behaviour can be checked.

use super::{
    LockRelease, ObjectLock, ObjectStat, StoreError, StoreResult, VolumeConnector, VolumeHandle,
    parent_of,
};
use async_trait::async_trait;
use blockmesh_common::VolumeName;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::OwnedMutexGuard;

/// Connector over a set of in-memory volumes
#[derive(Default)]
pub struct MemoryConnector {
    volumes: Mutex<HashMap<String, Arc<MemoryVolume>>>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a volume, returning its shared state
    pub fn add_volume(&self, name: &str) -> Arc<MemoryVolume> {
        let mut volumes = self.volumes.lock();
        Arc::clone(volumes.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryVolume::new(name, Arc::clone(&self.closes)))
        }))
    }

    /// Shared state of a registered volume
    pub fn volume(&self, name: &str) -> Option<Arc<MemoryVolume>> {
        self.volumes.lock().get(name).cloned()
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of handles closed
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VolumeConnector for MemoryConnector {
    async fn connect(&self, volume: &VolumeName) -> StoreResult<Arc<dyn VolumeHandle>> {
        let state = self
            .volume(volume.as_str())
            .ok_or_else(|| StoreError::NotFound(volume.to_string()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryHandle {
            state,
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct Objects {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    xattrs: HashMap<String, BTreeMap<String, Vec<u8>>>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Contents of one in-memory volume, shared by all its handles
pub struct MemoryVolume {
    name: String,
    objects: Mutex<Objects>,
    failing: Mutex<Vec<String>>,
    failing_unlocks: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
}

impl MemoryVolume {
    fn new(name: &str, closes: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(Objects::default()),
            failing: Mutex::new(Vec::new()),
            failing_unlocks: Mutex::new(Vec::new()),
            closes,
        }
    }

    /// Make every write under `prefix` fail
    pub fn fail_writes(&self, prefix: &str) {
        self.failing.lock().push(prefix.to_string());
    }

    /// Make releasing locks under `prefix` report an error. The lock is
    /// still released.
    pub fn fail_unlocks(&self, prefix: &str) {
        self.failing_unlocks.lock().push(prefix.to_string());
    }

    /// Undo all injected failures
    pub fn heal(&self) {
        self.failing.lock().clear();
        self.failing_unlocks.lock().clear();
    }

    /// Object contents, for assertions
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().files.get(path).cloned()
    }

    /// All object paths, for assertions
    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().files.keys().cloned().collect()
    }

    fn check_write(&self, path: &str) -> StoreResult<()> {
        if self.failing.lock().iter().any(|p| path.starts_with(p.as_str())) {
            return Err(StoreError::Io {
                path: path.to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        Ok(())
    }
}

/// Handle onto a [`MemoryVolume`]
pub struct MemoryHandle {
    state: Arc<MemoryVolume>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn state(&self) -> StoreResult<&MemoryVolume> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.state.name.clone()));
        }
        Ok(&self.state)
    }
}

fn check_parent(objects: &Objects, path: &str) -> StoreResult<()> {
    let parent = parent_of(path);
    if parent.is_empty() || objects.dirs.contains(parent) {
        Ok(())
    } else {
        Err(StoreError::NotFound(parent.to_string()))
    }
}

struct MemoryLockGuard {
    _guard: OwnedMutexGuard<()>,
    path: String,
    volume: Arc<MemoryVolume>,
}

impl LockRelease for MemoryLockGuard {
    fn release(self: Box<Self>) -> StoreResult<()> {
        let fail = self
            .volume
            .failing_unlocks
            .lock()
            .iter()
            .any(|p| self.path.starts_with(p.as_str()));
        let path = self.path.clone();
        drop(self);
        if fail {
            return Err(StoreError::Io {
                path,
                source: std::io::Error::other("injected unlock failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeHandle for MemoryHandle {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn mkdir(&self, path: &str) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            objects.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn create(&self, path: &str, exclusive: bool) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        check_parent(&objects, path)?;
        if objects.files.contains_key(path) {
            if exclusive {
                return Err(StoreError::AlreadyExists(path.to_string()));
            }
            return Ok(());
        }
        objects.files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let objects = self.state()?.objects.lock();
        Ok(objects.files.contains_key(path) || objects.dirs.contains(path))
    }

    async fn stat(&self, path: &str) -> StoreResult<ObjectStat> {
        let objects = self.state()?.objects.lock();
        objects
            .files
            .get(path)
            .map(|data| ObjectStat {
                size: data.len() as u64,
            })
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let objects = self.state()?.objects.lock();
        objects
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn append(&self, path: &str, data: &[u8]) -> StoreResult<u64> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        check_parent(&objects, path)?;
        let file = objects.files.entry(path.to_string()).or_default();
        file.extend_from_slice(data);
        Ok(file.len() as u64)
    }

    async fn truncate(&self, path: &str, size: u64) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let len = usize::try_from(size).map_err(|_| StoreError::Io {
            path: path.to_string(),
            source: std::io::Error::other("size exceeds address space"),
        })?;
        let mut objects = state.objects.lock();
        let file = objects
            .files
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        file.resize(len, 0);
        Ok(())
    }

    async fn zero_fill(&self, path: &str, offset: u64, len: u64) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        let file = objects
            .files
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(file.len());
        let end = usize::try_from(offset.saturating_add(len))
            .unwrap_or(usize::MAX)
            .min(file.len());
        file[start..end].fill(0);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        objects.xattrs.remove(path);
        objects
            .files
            .remove(path)
            .map(drop)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let objects = self.state()?.objects.lock();
        if !objects.dirs.contains(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let children = objects
            .files
            .keys()
            .chain(objects.dirs.iter())
            .filter(|p| parent_of(p) == path)
            .filter_map(|p| p.rsplit_once('/').map(|(_, name)| name.to_string()))
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }

    async fn lock(&self, path: &str) -> StoreResult<ObjectLock> {
        let state = self.state()?;
        state.check_write(path)?;
        let mutex = {
            let mut objects = state.objects.lock();
            objects.files.entry(path.to_string()).or_default();
            Arc::clone(objects.locks.entry(path.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        Ok(ObjectLock::new(
            path,
            Box::new(MemoryLockGuard {
                _guard: guard,
                path: path.to_string(),
                volume: Arc::clone(&self.state),
            }),
        ))
    }

    async fn get_xattr(&self, path: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let objects = self.state()?.objects.lock();
        if !objects.files.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(objects
            .xattrs
            .get(path)
            .and_then(|attrs| attrs.get(name))
            .cloned())
    }

    async fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> StoreResult<()> {
        let state = self.state()?;
        state.check_write(path)?;
        let mut objects = state.objects.lock();
        if !objects.files.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        objects
            .xattrs
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
