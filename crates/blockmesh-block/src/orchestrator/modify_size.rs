//! Block resize

use super::{BlockOrchestrator, record_payload};
use crate::backend::{BlockPayload, OpKind};
use crate::capability::{OpFeatures, required_capabilities};
use crate::entry::resize_entry;
use crate::error::{BlockError, BlockResult};
use crate::executor::RemoteTask;
use crate::journal::MetaJournal;
use crate::record::JournalEntry;
use crate::request::ModifySizeRequest;
use crate::response::{FailedResize, ModifySizeResponse, Verdict};
use crate::status::{MetaKey, NodeState};
use crate::store::VolumeHandle;
use std::sync::Arc;
use tracing::{info, warn};

impl BlockOrchestrator {
    /// Resize the data object, then every configured host
    pub async fn modify_size(&self, req: ModifySizeRequest) -> BlockResult<ModifySizeResponse> {
        req.validate()?;
        let (volume, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self
            .modify_size_locked(&req, volume.as_ref(), &journal)
            .await;
        journal.unlock(lock);
        result
    }

    async fn modify_size_locked(
        &self,
        req: &ModifySizeRequest,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
    ) -> BlockResult<ModifySizeResponse> {
        let record = journal.read_committed().await?;
        if record.blk_size > 0 && req.size % record.blk_size != 0 {
            return Err(BlockError::InvalidSize(format!(
                "size {} is not a multiple of block size {}",
                req.size, record.blk_size
            )));
        }
        if req.size < record.size && !req.force {
            return Err(BlockError::InvalidSize(format!(
                "shrinking {}/{} from {} to {} bytes needs force",
                req.volume, req.block, record.size, req.size
            )));
        }
        let unfinished = record.nodes.iter().any(|n| {
            matches!(
                n.status,
                NodeState::ResizeFail(_) | NodeState::ResizeInProgress(_)
            )
        });
        if req.size == record.size && !unfinished {
            return Err(BlockError::InvalidSize(format!(
                "{}/{} is already {} bytes",
                req.volume, req.block, req.size
            )));
        }

        let configured = record.configured_hosts();
        if configured.len() < record.mpath {
            return Err(BlockError::MissingConfiguration(format!(
                "{}/{} has {} of {} paths configured",
                req.volume,
                req.block,
                configured.len(),
                record.mpath
            )));
        }
        self.negotiator
            .negotiate(&configured, &required_capabilities(&OpFeatures::ModifySize))
            .await?;

        resize_entry(volume, &record.gbid, req.size).await?;
        journal
            .append(&[JournalEntry::meta(MetaKey::Size, req.size)])
            .await?;

        let done = NodeState::ResizeSuccess(Some(req.size));
        let (skipped, targets): (Vec<String>, Vec<String>) = configured
            .into_iter()
            .partition(|h| record.status_of(h) == Some(&done));

        let payload = Arc::new(BlockPayload {
            size: req.size,
            ..record_payload(&record)
        });
        let tasks = targets
            .into_iter()
            .map(|host| RemoteTask::new(host, OpKind::ModifySize, Arc::clone(&payload)))
            .collect();
        let outcomes = self.executor.fan_out(Some(journal), tasks).await?;

        let after = journal.read().await?;
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            if outcome.succeeded() {
                succeeded.push(outcome.host);
            } else {
                let size = after
                    .node(&outcome.host)
                    .and_then(|n| n.last_resized())
                    .unwrap_or(record.initial_size);
                failed.push(FailedResize {
                    host: outcome.host,
                    size,
                });
            }
        }

        if failed.is_empty() {
            info!("Resized {}/{} to {} bytes", req.volume, req.block, req.size);
        } else {
            warn!(
                "Resize of {}/{} failed on {} hosts",
                req.volume,
                req.block,
                failed.len()
            );
        }
        Ok(ModifySizeResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            size: req.size,
            result: Verdict::from_success(failed.is_empty()),
            succeeded,
            failed,
            skipped,
        })
    }
}
