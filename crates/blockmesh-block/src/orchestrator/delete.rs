//! Block deletion and the host cleanup shared with create rollback

use super::{BlockOrchestrator, bump_priority, record_payload};
use crate::backend::{BlockPayload, OpKind};
use crate::capability::{OpFeatures, required_capabilities};
use crate::entry::delete_entry;
use crate::error::BlockResult;
use crate::executor::{HostSummary, RemoteTask, collect_attempt_success};
use crate::journal::MetaJournal;
use crate::record::{BlockRecord, JournalEntry};
use crate::request::DeleteRequest;
use crate::response::{DeleteResponse, Verdict};
use crate::status::{EntryState, MetaKey, NodeState};
use crate::store::VolumeHandle;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a cleanup fan-out
pub(crate) struct CleanupReport {
    pub summary: HostSummary,
    /// No host still carries target configuration
    pub all_clean: bool,
}

/// Nothing to clean on hosts never configured or already cleaned
fn is_clean(state: &NodeState) -> bool {
    matches!(state, NodeState::ConfigInProgress | NodeState::CleanupSuccess)
}

fn cleanup_targets(record: &BlockRecord) -> Vec<String> {
    record.hosts_where(|s| !is_clean(s))
}

impl BlockOrchestrator {
    /// Tear down a block on every host, then remove its data and journal
    pub async fn delete(&self, req: DeleteRequest) -> BlockResult<DeleteResponse> {
        let (volume, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self.delete_locked(&req, volume.as_ref(), &journal).await;
        journal.unlock(lock);
        result
    }

    async fn delete_locked(
        &self,
        req: &DeleteRequest,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
    ) -> BlockResult<DeleteResponse> {
        let record = journal.read_committed().await?;
        if !req.force {
            let required = required_capabilities(&OpFeatures::Delete { force: false });
            self.negotiator
                .negotiate(&cleanup_targets(&record), &required)
                .await?;
        }

        let report = self.cleanup(journal, &record, req.force).await?;
        let removed = if report.all_clean || req.force {
            if !report.all_clean {
                warn!(
                    "Forcing removal of {}/{} although cleanup failed on {}",
                    req.volume,
                    req.block,
                    report.summary.failed_text()
                );
            }
            self.remove_block(volume, journal, &record, req.unlink).await?;
            true
        } else {
            warn!(
                "Keeping {}/{}: cleanup failed on {}",
                req.volume,
                req.block,
                report.summary.failed_text()
            );
            false
        };

        Ok(DeleteResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            cleanup: report.summary,
            removed,
            result: Verdict::from_success(removed),
        })
    }

    /// Run `delete` on every host that may still carry configuration
    pub(crate) async fn cleanup(
        &self,
        journal: &MetaJournal,
        record: &BlockRecord,
        force: bool,
    ) -> BlockResult<CleanupReport> {
        let payload = Arc::new(BlockPayload {
            force,
            ..record_payload(record)
        });
        let tasks = cleanup_targets(record)
            .into_iter()
            .map(|host| RemoteTask::new(host, OpKind::Delete, Arc::clone(&payload)))
            .collect();
        let outcomes = self.executor.fan_out(Some(journal), tasks).await?;

        let after = journal.read().await?;
        Ok(CleanupReport {
            summary: collect_attempt_success(&outcomes),
            all_clean: after.nodes.iter().all(|n| is_clean(&n.status)),
        })
    }

    async fn remove_block(
        &self,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
        record: &BlockRecord,
        unlink: bool,
    ) -> BlockResult<()> {
        if unlink {
            journal
                .append(&[JournalEntry::meta(MetaKey::EntryDelete, EntryState::InProgress)])
                .await?;
            if let Err(e) = delete_entry(volume, &record.gbid).await {
                error!("Failed to remove data object {}: {}", record.gbid, e);
                if let Err(je) = journal
                    .append(&[JournalEntry::meta(MetaKey::EntryDelete, EntryState::Fail)])
                    .await
                {
                    warn!("Failed to record delete failure: {}", je);
                }
                return Err(e.into());
            }
            journal
                .append(&[JournalEntry::meta(MetaKey::EntryDelete, EntryState::Success)])
                .await?;
        } else {
            info!("Keeping data object {} of {}", record.gbid, record.block);
        }
        journal.remove().await?;

        if let Some(prio) = &record.prio_path {
            bump_priority(volume, prio, false).await;
        }
        info!("Block {}/{} deleted", record.volume, record.block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EXIT_BLOCK_NOT_FOUND;
    use crate::capability::Capability;
    use crate::error::BlockError;
    use crate::priority::PriorityCounters;
    use crate::testutil::{CapMode, Harness, create_req, hosts};
    use blockmesh_common::{BlockName, VolumeName};

    fn delete_req(block: &str, force: bool) -> DeleteRequest {
        DeleteRequest {
            volume: VolumeName::new("vol").unwrap(),
            block: BlockName::new(block).unwrap(),
            force,
            unlink: true,
        }
    }

    #[tokio::test]
    async fn test_delete_can_keep_data_object() {
        let h = Harness::new();
        let created = h
            .orchestrator
            .create(create_req("blk", &["h1"], 1))
            .await
            .unwrap();

        let req = DeleteRequest {
            unlink: false,
            ..delete_req("blk", false)
        };
        let response = h.orchestrator.delete(req).await.unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert!(response.removed);
        assert!(h.journal_text("blk").is_none());
        assert!(h.data_exists(&created.gbid));
    }

    #[tokio::test]
    async fn test_delete_removes_block() {
        let h = Harness::new();
        let created = h
            .orchestrator
            .create(create_req("blk", &["h1", "h2"], 2))
            .await
            .unwrap();

        let response = h.orchestrator.delete(delete_req("blk", false)).await.unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert!(response.removed);
        assert_eq!(h.backend.hosts_for(OpKind::Delete), vec!["h1", "h2"]);
        assert!(!h.data_exists(&created.gbid));
        assert!(h.journal_text("blk").is_none());
        assert_eq!(response.to_string(), "SUCCESSFUL ON: h1 h2\nRESULT: SUCCESS");
    }

    #[tokio::test]
    async fn test_delete_keeps_block_on_failure_and_retries_remaining() {
        let h = Harness::new();
        let created = h
            .orchestrator
            .create(create_req("blk", &["h1", "h2"], 2))
            .await
            .unwrap();
        h.backend.fail("h2", OpKind::Delete);

        let response = h.orchestrator.delete(delete_req("blk", false)).await.unwrap();
        assert_eq!(response.result, Verdict::Fail);
        assert!(!response.removed);
        assert!(h.data_exists(&created.gbid));
        let record = h.journal("blk").await.read_committed().await.unwrap();
        assert_eq!(record.status_of("h1"), Some(&NodeState::CleanupSuccess));
        assert_eq!(record.status_of("h2"), Some(&NodeState::CleanupFail));

        h.backend.heal("h2");
        h.backend.reset_calls();
        let response = h.orchestrator.delete(delete_req("blk", false)).await.unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert_eq!(h.backend.hosts_for(OpKind::Delete), vec!["h2"]);
    }

    #[tokio::test]
    async fn test_force_delete_removes_when_every_host_fails() {
        let h = Harness::new();
        let created = h
            .orchestrator
            .create(create_req("blk", &["h1", "h2"], 2))
            .await
            .unwrap();
        h.backend.unreachable("h1");
        h.backend.unreachable("h2");
        h.backend.reset_calls();

        let response = h.orchestrator.delete(delete_req("blk", true)).await.unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert_eq!(response.cleanup.failed.len(), 2);
        assert!(!h.data_exists(&created.gbid));
        assert!(h.journal_text("blk").is_none());
        // force skips the capability query
        assert!(h.backend.queried().is_empty());
        assert!(h.backend.payload("h1", OpKind::Delete).unwrap().force);
    }

    #[tokio::test]
    async fn test_delete_treats_missing_target_as_clean() {
        let h = Harness::new();
        h.orchestrator
            .create(create_req("blk", &["h1"], 1))
            .await
            .unwrap();
        h.backend.exit("h1", OpKind::Delete, EXIT_BLOCK_NOT_FOUND);

        let response = h.orchestrator.delete(delete_req("blk", false)).await.unwrap();
        assert_eq!(response.result, Verdict::Success);
    }

    #[tokio::test]
    async fn test_delete_missing_block() {
        let h = Harness::new();
        let err = h
            .orchestrator
            .delete(delete_req("nope", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::BlockNotFound { .. }));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_capability_mismatch_touches_nothing() {
        let h = Harness::new();
        h.orchestrator
            .create(create_req("blk", &["h1"], 1))
            .await
            .unwrap();
        h.backend.caps("h1", CapMode::Without(vec![Capability::Delete]));
        h.backend.reset_calls();
        let before = h.journal_text("blk");

        let err = h
            .orchestrator
            .delete(delete_req("blk", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::CapabilityMismatch { .. }));
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.journal_text("blk"), before);
    }

    #[tokio::test]
    async fn test_delete_releases_priority_counter() {
        let h = Harness::new();
        h.backend.caps("h1", CapMode::Legacy);
        h.orchestrator
            .create(create_req("blk", &["h1", "h2"], 2))
            .await
            .unwrap();
        let volume = h.journal("blk").await.volume().clone();
        let counters = PriorityCounters::new(volume.as_ref());
        assert_eq!(counters.load(&hosts(&["h1"])).await.unwrap()["h1"], 1);

        h.orchestrator.delete(delete_req("blk", false)).await.unwrap();
        assert_eq!(counters.load(&hosts(&["h1"])).await.unwrap()["h1"], 0);
    }
}
