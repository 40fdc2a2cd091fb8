//! Priority path selection
//!
//! When some host cannot balance paths on its own, one host per block is
//! made the active-optimized path. Usage counters per host are kept as
//! extended attributes `user.block.prio.<host>` on `block-meta/.prio.info`,
//! and the least used candidate wins.

use crate::error::{BlockError, BlockResult};
use crate::store::VolumeHandle;
use crate::{LOCK_DIR, META_DIR};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Marker object carrying the counters
pub const PRIO_MARKER: &str = "block-meta/.prio.info";

/// Lock object guarding counter updates
pub const PRIO_LOCK: &str = "block-meta/.locks/.prio";

const XATTR_PREFIX: &str = "user.block.prio.";

/// Pick the candidate with the smallest counter, first one on ties.
/// Hosts without a counter count as zero.
#[must_use]
pub fn pick_priority_host<'a>(
    candidates: &'a [String],
    counters: &HashMap<String, u64>,
) -> Option<&'a str> {
    candidates
        .iter()
        .min_by_key(|host| counters.get(host.as_str()).copied().unwrap_or(0))
        .map(String::as_str)
}

/// Per-host usage counters of one volume
pub struct PriorityCounters<'a> {
    volume: &'a dyn VolumeHandle,
}

impl<'a> PriorityCounters<'a> {
    pub fn new(volume: &'a dyn VolumeHandle) -> Self {
        Self { volume }
    }

    async fn ensure_marker(&self) -> BlockResult<()> {
        self.volume.mkdir(META_DIR).await?;
        self.volume.create(PRIO_MARKER, false).await?;
        Ok(())
    }

    async fn read(&self, host: &str) -> BlockResult<u64> {
        let value = self
            .volume
            .get_xattr(PRIO_MARKER, &format!("{XATTR_PREFIX}{host}"))
            .await?;
        Ok(value
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn write(&self, host: &str, count: u64) -> BlockResult<()> {
        self.volume
            .set_xattr(
                PRIO_MARKER,
                &format!("{XATTR_PREFIX}{host}"),
                count.to_string().as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Counters of the given hosts
    pub async fn load(&self, hosts: &[String]) -> BlockResult<HashMap<String, u64>> {
        self.ensure_marker().await?;
        let mut counters = HashMap::with_capacity(hosts.len());
        for host in hosts {
            counters.insert(host.clone(), self.read(host).await?);
        }
        Ok(counters)
    }

    /// Choose the priority path among `candidates`
    pub async fn select(&self, candidates: &[String]) -> BlockResult<Option<String>> {
        let counters = self.load(candidates).await?;
        let chosen = pick_priority_host(candidates, &counters).map(str::to_string);
        if let Some(host) = &chosen {
            info!(
                "Selected priority path {} (count {})",
                host,
                counters.get(host).copied().unwrap_or(0)
            );
        }
        Ok(chosen)
    }

    pub async fn increment(&self, host: &str) -> BlockResult<u64> {
        self.update(host, |count| count.saturating_add(1)).await
    }

    /// Decrement, saturating at zero
    pub async fn decrement(&self, host: &str) -> BlockResult<u64> {
        self.update(host, |count| count.saturating_sub(1)).await
    }

    async fn update(&self, host: &str, f: impl FnOnce(u64) -> u64) -> BlockResult<u64> {
        self.ensure_marker().await?;
        self.volume.mkdir(LOCK_DIR).await?;
        let lock = self.volume.lock(PRIO_LOCK).await?;
        let result = async {
            let count = f(self.read(host).await?);
            self.write(host, count).await?;
            Ok::<_, BlockError>(count)
        }
        .await;
        if let Err(e) = lock.release() {
            warn!("Failed to unlock priority counters: {}", e);
        }
        if let Ok(count) = &result {
            debug!("Priority counter of {} is now {}", host, count);
        }
        result
    }
}
