//! Lifecycle orchestrators
//!
//! One [`BlockOrchestrator`] is built at startup and serves every request.
//! Each operation follows the same shape:
//!
//! ```text
//! validate ─▶ lock journal ─▶ read record ─▶ negotiate ─▶ journal + fan-out
//!                                                             │
//!              unlock ◀─ finalize journal ◀─ audit / rollback ◀┘
//! ```
//!
//! The journal lock is held for the whole operation, so operations on one
//! block never interleave while different blocks run in parallel.

mod create;
mod delete;
mod modify_auth;
mod modify_size;
mod query;
mod reload;
mod replace;

use crate::backend::BlockPayload;
use crate::cache::VolumeHandleCache;
use crate::capability::CapabilityNegotiator;
use crate::error::BlockResult;
use crate::executor::RemoteOpExecutor;
use crate::journal::MetaJournal;
use crate::priority::PriorityCounters;
use crate::record::BlockRecord;
use crate::store::VolumeHandle;
use blockmesh_common::{BlockName, VolumeName};
use std::sync::Arc;
use tracing::warn;

/// Settings the orchestrators need from configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// IQN prefix, the GBID is appended after a colon
    pub iqn_prefix: String,
    /// Portal port reported when a host does not print its portal
    pub portal_port: u16,
}

/// Entry point for every block lifecycle operation
pub struct BlockOrchestrator {
    volumes: Arc<VolumeHandleCache>,
    executor: Arc<RemoteOpExecutor>,
    negotiator: CapabilityNegotiator,
    settings: OrchestratorSettings,
}

impl BlockOrchestrator {
    pub fn new(
        volumes: Arc<VolumeHandleCache>,
        executor: Arc<RemoteOpExecutor>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            negotiator: CapabilityNegotiator::new(Arc::clone(&executor)),
            volumes,
            executor,
            settings,
        }
    }

    pub fn volumes(&self) -> &Arc<VolumeHandleCache> {
        &self.volumes
    }

    async fn bind(
        &self,
        volume: &VolumeName,
        block: &BlockName,
    ) -> BlockResult<(Arc<dyn VolumeHandle>, MetaJournal)> {
        let handle = self.volumes.get(volume).await?;
        let journal = MetaJournal::bind(Arc::clone(&handle), volume.clone(), block.clone());
        Ok((handle, journal))
    }

    fn iqn(&self, gbid: &str) -> String {
        format!("{}:{}", self.settings.iqn_prefix, gbid)
    }

    fn portal(&self, host: &str) -> String {
        format!("{}:{}", host, self.settings.portal_port)
    }
}

/// Payload carrying the persisted configuration of a block
pub(crate) fn record_payload(record: &BlockRecord) -> BlockPayload {
    BlockPayload {
        volume: record.volume.clone(),
        block_name: record.block.clone(),
        gbid: record.gbid.clone(),
        size: record.size,
        auth: record.password.is_some(),
        password: record.password.clone(),
        ring_buffer: (record.rb_size > 0).then_some(record.rb_size),
        block_size: (record.blk_size > 0).then_some(record.blk_size),
        io_timeout: (record.io_timeout > 0).then_some(record.io_timeout),
        prealloc: false,
        prio_path: record.prio_path.clone(),
        block_hosts: record.configured_hosts(),
        old_node: None,
        new_node: None,
        force: false,
    }
}

/// Adjust a priority counter after the operation already succeeded
async fn bump_priority(volume: &dyn VolumeHandle, host: &str, up: bool) {
    let counters = PriorityCounters::new(volume);
    let result = if up {
        counters.increment(host).await
    } else {
        counters.decrement(host).await
    };
    if let Err(e) = result {
        warn!(
            "Failed to {} priority counter of {}: {}",
            if up { "increment" } else { "decrement" },
            host,
            e
        );
    }
}
