//! Read-only block queries

use super::BlockOrchestrator;
use crate::entry::list_blocks;
use crate::error::{BlockError, BlockResult};
use crate::journal::MetaJournal;
use crate::response::{BlockInfo, BlockList, NodeView};
use crate::status::NodeState;
use blockmesh_common::{BlockName, VolumeName};
use std::sync::Arc;
use tracing::debug;

impl BlockOrchestrator {
    /// Details of a committed block, read under its lock
    pub async fn info(&self, volume: &VolumeName, block: &BlockName) -> BlockResult<BlockInfo> {
        let (_, journal) = self.bind(volume, block).await?;
        let lock = journal.lock().await?;
        let record = journal.read_committed().await;
        journal.unlock(lock);
        let record = record?;

        Ok(BlockInfo {
            name: record.block.clone(),
            volume: volume.to_string(),
            gbid: record.gbid.clone(),
            size: record.size,
            ha: record.mpath,
            password: record.password.clone(),
            prio_path: record.prio_path.clone(),
            ring_buffer: (record.rb_size > 0).then_some(record.rb_size),
            block_size: (record.blk_size > 0).then_some(record.blk_size),
            io_timeout: (record.io_timeout > 0).then_some(record.io_timeout),
            exported_on: record.configured_hosts(),
            failures_on: record.hosts_where(NodeState::is_failure),
            nodes: record
                .nodes
                .iter()
                .map(|n| NodeView {
                    host: n.addr.clone(),
                    status: n.status.to_string(),
                })
                .collect(),
        })
    }

    /// Committed blocks of a volume, sorted by name
    pub async fn list(&self, volume: &VolumeName) -> BlockResult<BlockList> {
        let handle = self.volumes.get(volume).await?;
        let mut blocks = Vec::new();
        for block in list_blocks(handle.as_ref()).await? {
            let journal = MetaJournal::bind(Arc::clone(&handle), volume.clone(), block);
            match journal.read().await {
                Ok(record) if record.is_committed() => blocks.push(journal.block().to_string()),
                Ok(_) => debug!("Skipping uncommitted block {}/{}", volume, journal.block()),
                // deleted since the listing
                Err(BlockError::BlockNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        blocks.sort();
        Ok(BlockList {
            volume: volume.to_string(),
            blocks,
        })
    }
}
