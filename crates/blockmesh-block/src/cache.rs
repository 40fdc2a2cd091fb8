//! Volume handle cache
//!
//! Connecting to a volume is expensive, so handles are kept in a bounded
//! least-recently-used list shared by every orchestrator. The list lock is
//! only held for lookup, insert and evict; connects and closes run outside.
//!
//! An evicted handle that an operation still holds is retired instead of
//! closed. Retired handles are closed by a later cache call once their last
//! user dropped them, or handed back if their volume is requested again.

use crate::error::{BlockError, BlockResult};
use crate::store::{VolumeConnector, VolumeHandle};
use blockmesh_common::VolumeName;
use blockmesh_common::config::LRU_COUNT_MAX;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheInner {
    capacity: usize,
    /// Most recently used first
    entries: VecDeque<Cached>,
    /// Evicted but still held by an operation
    retired: Vec<Cached>,
    stats: CacheStats,
}

type Cached = (VolumeName, Arc<dyn VolumeHandle>);

/// Only the cache's own reference is left
fn is_idle(handle: &Arc<dyn VolumeHandle>) -> bool {
    Arc::strong_count(handle) == 1
}

impl CacheInner {
    /// Move a cached or retired handle to the front
    fn take(&mut self, volume: &VolumeName) -> Option<Arc<dyn VolumeHandle>> {
        let entry = if let Some(pos) = self.entries.iter().position(|(name, _)| name == volume) {
            self.entries.remove(pos)?
        } else {
            let pos = self.retired.iter().position(|(name, _)| name == volume)?;
            self.retired.swap_remove(pos)
        };
        let handle = Arc::clone(&entry.1);
        self.entries.push_front(entry);
        Some(handle)
    }

    /// Evict down to capacity and collect every handle that can be closed now
    fn closable(&mut self) -> Vec<Cached> {
        while self.entries.len() > self.capacity {
            if let Some(entry) = self.entries.pop_back() {
                self.stats.evictions += 1;
                self.retired.push(entry);
            }
        }
        let (idle, busy): (Vec<Cached>, Vec<Cached>) =
            self.retired.drain(..).partition(|(_, h)| is_idle(h));
        self.retired = busy;
        idle
    }
}

/// Bounded LRU of open volume handles
pub struct VolumeHandleCache {
    connector: Arc<dyn VolumeConnector>,
    inner: Mutex<CacheInner>,
}

impl VolumeHandleCache {
    /// Create a cache. Capacity is clamped to `1..=LRU_COUNT_MAX`.
    pub fn new(connector: Arc<dyn VolumeConnector>, capacity: usize) -> Self {
        Self {
            connector,
            inner: Mutex::new(CacheInner {
                capacity: capacity.clamp(1, LRU_COUNT_MAX),
                entries: VecDeque::new(),
                retired: Vec::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Get a handle, connecting on a miss
    pub async fn get(&self, volume: &VolumeName) -> BlockResult<Arc<dyn VolumeHandle>> {
        let hit = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.take(volume) {
                inner.stats.hits += 1;
                Some((handle, inner.closable()))
            } else {
                inner.stats.misses += 1;
                None
            }
        };
        if let Some((handle, evicted)) = hit {
            close_all(evicted).await;
            return Ok(handle);
        }

        debug!("Volume handle cache miss for {}", volume);
        let handle = self.connector.connect(volume).await?;

        let (handle, duplicate, evicted) = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.take(volume) {
                let evicted = inner.closable();
                (existing, Some(handle), evicted)
            } else {
                inner
                    .entries
                    .push_front((volume.clone(), Arc::clone(&handle)));
                let evicted = inner.closable();
                (handle, None, evicted)
            }
        };

        if let Some(duplicate) = duplicate {
            close_handle(volume, duplicate.as_ref()).await;
        }
        close_all(evicted).await;
        Ok(handle)
    }

    /// Change the capacity, evicting the least recently used handles
    pub async fn set_capacity(&self, capacity: usize) -> BlockResult<()> {
        if capacity == 0 || capacity > LRU_COUNT_MAX {
            return Err(BlockError::InvalidRequest(format!(
                "lru count must be between 1 and {LRU_COUNT_MAX}, got {capacity}"
            )));
        }
        let evicted = {
            let mut inner = self.inner.lock();
            inner.capacity = capacity;
            inner.closable()
        };
        close_all(evicted).await;
        info!("Volume handle cache capacity set to {}", capacity);
        Ok(())
    }

    /// Drop every cached handle, closing the ones no operation holds
    pub async fn clear(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            let entries: Vec<Cached> = inner.entries.drain(..).collect();
            inner.retired.extend(entries);
            let (idle, busy): (Vec<Cached>, Vec<Cached>) =
                inner.retired.drain(..).partition(|(_, h)| is_idle(h));
            inner.retired = busy;
            idle
        };
        close_all(drained).await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Evicted handles still held by an operation
    pub fn retired(&self) -> usize {
        self.inner.lock().retired.len()
    }

    pub fn contains(&self, volume: &VolumeName) -> bool {
        self.inner.lock().entries.iter().any(|(name, _)| name == volume)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

async fn close_all(handles: Vec<Cached>) {
    for (name, handle) in handles {
        info!("Closing volume handle {}", name);
        close_handle(&name, handle.as_ref()).await;
    }
}

async fn close_handle(name: &VolumeName, handle: &dyn VolumeHandle) {
    if let Err(e) = handle.close().await {
        warn!("Failed to close volume handle {}: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnector;

    fn volume(name: &str) -> VolumeName {
        VolumeName::new(name).unwrap()
    }

    fn connector(names: &[&str]) -> Arc<MemoryConnector> {
        let connector = Arc::new(MemoryConnector::new());
        for name in names {
            connector.add_volume(name);
        }
        connector
    }

    #[tokio::test]
    async fn test_hit_reuses_handle() {
        let connector = connector(&["v1"]);
        let cache = VolumeHandleCache::new(connector.clone(), 2);

        let a = cache.get(&volume("v1")).await.unwrap();
        let b = cache.get(&volume("v1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connects(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let connector = connector(&["v1", "v2", "v3"]);
        let cache = VolumeHandleCache::new(connector.clone(), 2);

        cache.get(&volume("v1")).await.unwrap();
        cache.get(&volume("v2")).await.unwrap();
        // touch v1 so v2 becomes the oldest
        cache.get(&volume("v1")).await.unwrap();
        cache.get(&volume("v3")).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&volume("v1")));
        assert!(!cache.contains(&volume("v2")));
        assert!(cache.contains(&volume("v3")));
        assert_eq!(connector.closes(), 1);
        assert_eq!(connector.connects() - connector.closes(), 2);
    }

    #[tokio::test]
    async fn test_shrinking_capacity_closes_handles() {
        let connector = connector(&["v1", "v2", "v3"]);
        let cache = VolumeHandleCache::new(connector.clone(), 3);
        for name in ["v1", "v2", "v3"] {
            cache.get(&volume(name)).await.unwrap();
        }

        cache.set_capacity(1).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&volume("v3")));
        assert_eq!(connector.closes(), 2);
        assert!(cache.set_capacity(LRU_COUNT_MAX + 1).await.is_err());

        cache.clear().await;
        assert!(cache.is_empty());
        assert_eq!(connector.closes(), 3);
    }

    #[tokio::test]
    async fn test_evicted_handle_stays_open_while_held() {
        let connector = connector(&["v1", "v2", "v3"]);
        let cache = VolumeHandleCache::new(connector.clone(), 1);

        let held = cache.get(&volume("v1")).await.unwrap();
        cache.get(&volume("v2")).await.unwrap();
        assert!(!cache.contains(&volume("v1")));
        assert_eq!(cache.retired(), 1);
        assert_eq!(connector.closes(), 0);
        held.append("obj", b"still open").await.unwrap();

        drop(held);
        cache.get(&volume("v3")).await.unwrap();
        assert_eq!(cache.retired(), 0);
        assert_eq!(connector.closes(), 2);
    }

    #[tokio::test]
    async fn test_retired_handle_is_reused() {
        let connector = connector(&["v1", "v2"]);
        let cache = VolumeHandleCache::new(connector.clone(), 1);

        let held = cache.get(&volume("v1")).await.unwrap();
        cache.get(&volume("v2")).await.unwrap();
        let again = cache.get(&volume("v1")).await.unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(connector.connects(), 2);
        // v2 was idle when v1 came back
        assert_eq!(connector.closes(), 1);
        assert_eq!(cache.retired(), 0);
    }

    #[tokio::test]
    async fn test_clear_keeps_held_handles_open() {
        let connector = connector(&["v1", "v2"]);
        let cache = VolumeHandleCache::new(connector.clone(), 2);
        let held = cache.get(&volume("v1")).await.unwrap();
        cache.get(&volume("v2")).await.unwrap();

        cache.clear().await;
        assert!(cache.is_empty());
        assert_eq!(connector.closes(), 1);
        held.exists("obj").await.unwrap();

        drop(held);
        cache.clear().await;
        assert_eq!(connector.closes(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let connector = connector(&[]);
        let cache = VolumeHandleCache::new(connector, 2);
        assert!(cache.get(&volume("missing")).await.is_err());
        assert!(cache.is_empty());
    }
}
