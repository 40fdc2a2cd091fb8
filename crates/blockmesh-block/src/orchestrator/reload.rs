//! Target configuration reload

use super::{BlockOrchestrator, record_payload};
use crate::backend::{BlockPayload, OpKind};
use crate::capability::{OpFeatures, required_capabilities};
use crate::error::BlockResult;
use crate::executor::{RemoteTask, collect_attempt_success};
use crate::journal::MetaJournal;
use crate::request::ReloadRequest;
use crate::response::{ReloadResponse, Verdict};
use std::sync::Arc;
use tracing::{info, warn};

impl BlockOrchestrator {
    /// Ask every configured host to re-apply the block's target configuration
    pub async fn reload(&self, req: ReloadRequest) -> BlockResult<ReloadResponse> {
        let (_, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self.reload_locked(&req, &journal).await;
        journal.unlock(lock);
        result
    }

    async fn reload_locked(
        &self,
        req: &ReloadRequest,
        journal: &MetaJournal,
    ) -> BlockResult<ReloadResponse> {
        let record = journal.read_committed().await?;
        let targets = record.configured_hosts();
        if !req.force {
            self.negotiator
                .negotiate(&targets, &required_capabilities(&OpFeatures::Reload))
                .await?;
        }

        let payload = Arc::new(BlockPayload {
            force: req.force,
            ..record_payload(&record)
        });
        let tasks = targets
            .into_iter()
            .map(|host| RemoteTask::new(host, OpKind::Reload, Arc::clone(&payload)))
            .collect();
        let outcomes = self.executor.fan_out(Some(journal), tasks).await?;
        let summary = collect_attempt_success(&outcomes);

        if summary.all_succeeded() {
            info!("Reloaded {}/{} on {}", req.volume, req.block, summary.succeeded_text());
        } else {
            warn!(
                "Reload of {}/{} failed on {}",
                req.volume,
                req.block,
                summary.failed_text()
            );
        }
        Ok(ReloadResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            result: Verdict::from_success(summary.all_succeeded() || req.force),
            summary,
        })
    }
}
