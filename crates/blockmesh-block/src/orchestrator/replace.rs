//! Node replacement
//!
//! Moves one path of a block from `old` to `new` in a single fan-out batch:
//!
//! ```text
//!   new ◀── create          (skipped when already configured)
//!   others ◀── replace portal (skipped on hosts already RPSUCCESS)
//!   old ◀── delete          (skipped when already cleaned up)
//! ```
//!
//! Re-running a finished replace is a no-op reported as SKIPPED.

use super::{BlockOrchestrator, bump_priority, record_payload};
use crate::backend::{BlockPayload, OpKind};
use crate::capability::{OpFeatures, required_capabilities};
use crate::error::{BlockError, BlockResult};
use crate::executor::{Outcome, RemoteTask};
use crate::journal::MetaJournal;
use crate::record::{BlockRecord, JournalEntry};
use crate::request::ReplaceRequest;
use crate::response::{PortalReport, ReplaceResponse, SubOpStatus, Verdict};
use crate::status::{MetaKey, NodeState};
use crate::store::VolumeHandle;
use std::sync::Arc;
use tracing::{info, warn};

/// What is left to do for one replace
struct ReplacePlan {
    create_done: bool,
    delete_done: bool,
    others: Vec<String>,
    portal_pending: Vec<String>,
}

impl ReplacePlan {
    fn build(record: &BlockRecord, req: &ReplaceRequest) -> BlockResult<Self> {
        let in_use = || BlockError::NodeInUse {
            node: req.new_node.clone(),
            block: req.block.to_string(),
        };

        let Some(old_status) = record.status_of(&req.old_node) else {
            return Err(BlockError::NodeNotExist {
                node: req.old_node.clone(),
                block: req.block.to_string(),
            });
        };
        let delete_done = *old_status == NodeState::CleanupSuccess;

        let create_done = match record.status_of(&req.new_node) {
            Some(NodeState::ConfigSuccess | NodeState::AuthEnforced) => true,
            Some(state) if state.is_configured() => return Err(in_use()),
            _ => false,
        };

        let others: Vec<String> = record
            .configured_hosts()
            .into_iter()
            .filter(|h| *h != req.old_node && *h != req.new_node)
            .collect();
        // A configured new node only counts as our own earlier create when
        // every remaining path went through the portal replacement with it.
        if create_done
            && (others.len() < record.mpath.saturating_sub(1)
                || others
                    .iter()
                    .any(|h| !record.status_of(h).is_some_and(NodeState::is_replace)))
        {
            return Err(in_use());
        }

        let portal_pending = others
            .iter()
            .filter(|h| record.status_of(h) != Some(&NodeState::ReplaceSuccess))
            .cloned()
            .collect();
        Ok(Self {
            create_done,
            delete_done,
            others,
            portal_pending,
        })
    }

    fn is_finished(&self) -> bool {
        self.create_done && self.delete_done && self.portal_pending.is_empty()
    }

    /// Hosts the batch will contact
    fn contacted(&self, req: &ReplaceRequest) -> Vec<String> {
        let mut hosts = Vec::new();
        if !self.create_done {
            hosts.push(req.new_node.clone());
        }
        hosts.extend(self.portal_pending.iter().cloned());
        if !self.delete_done && !req.force {
            hosts.push(req.old_node.clone());
        }
        hosts
    }
}

fn sub_status(done: bool, outcome: Option<&Outcome>) -> SubOpStatus {
    match outcome {
        _ if done => SubOpStatus::Skipped,
        Some(o) if o.succeeded() => SubOpStatus::Success,
        _ => SubOpStatus::Failed,
    }
}

impl BlockOrchestrator {
    /// Replace `old_node` with `new_node` as a path of the block
    pub async fn replace_node(&self, req: ReplaceRequest) -> BlockResult<ReplaceResponse> {
        req.validate()?;
        let (volume, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self
            .replace_locked(&req, volume.as_ref(), &journal)
            .await;
        journal.unlock(lock);
        result
    }

    async fn replace_locked(
        &self,
        req: &ReplaceRequest,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
    ) -> BlockResult<ReplaceResponse> {
        let record = journal.read_committed().await?;
        let plan = ReplacePlan::build(&record, req)?;

        let mut response = ReplaceResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            old_node: req.old_node.clone(),
            new_node: req.new_node.clone(),
            create: SubOpStatus::Skipped,
            delete: SubOpStatus::Skipped,
            delete_ignored: false,
            replace_portal: PortalReport {
                skipped: plan.others.clone(),
                ..PortalReport::default()
            },
            result: Verdict::Skipped,
        };
        if plan.is_finished() {
            info!(
                "{} already replaced by {} on {}/{}",
                req.old_node, req.new_node, req.volume, req.block
            );
            return Ok(response);
        }

        self.negotiator
            .negotiate(&plan.contacted(req), &required_capabilities(&OpFeatures::Replace))
            .await?;

        let base = record_payload(&record);
        let prio_moves = record.prio_path.as_deref() == Some(req.old_node.as_str());
        let block_hosts: Vec<String> = std::iter::once(req.new_node.clone())
            .chain(plan.others.iter().cloned())
            .collect();

        let mut tasks = Vec::new();
        if !plan.create_done {
            let payload = BlockPayload {
                prio_path: if prio_moves {
                    Some(req.new_node.clone())
                } else {
                    base.prio_path.clone()
                },
                block_hosts: block_hosts.clone(),
                ..base.clone()
            };
            tasks.push(RemoteTask::new(&req.new_node, OpKind::Create, Arc::new(payload)));
        }
        if !plan.portal_pending.is_empty() {
            let payload = Arc::new(BlockPayload {
                old_node: Some(req.old_node.clone()),
                new_node: Some(req.new_node.clone()),
                block_hosts,
                ..base.clone()
            });
            tasks.extend(
                plan.portal_pending
                    .iter()
                    .map(|h| RemoteTask::new(h, OpKind::ReplacePortal, Arc::clone(&payload))),
            );
        }
        if !plan.delete_done {
            let payload = BlockPayload {
                force: req.force,
                ..base
            };
            tasks.push(RemoteTask::new(&req.old_node, OpKind::Delete, Arc::new(payload)));
        }

        let outcomes = self.executor.fan_out(Some(journal), tasks).await?;
        let find = |op: OpKind| outcomes.iter().find(|o| o.op == op);

        response.create = sub_status(plan.create_done, find(OpKind::Create));
        response.delete = sub_status(plan.delete_done, find(OpKind::Delete));
        let portal = &mut response.replace_portal;
        portal.skipped.retain(|h| !plan.portal_pending.contains(h));
        for outcome in outcomes.iter().filter(|o| o.op == OpKind::ReplacePortal) {
            if outcome.succeeded() {
                portal.succeeded.push(outcome.host.clone());
            } else {
                portal.failed.push(outcome.host.clone());
            }
        }

        let create_ok = response.create != SubOpStatus::Failed;
        let delete_ok = response.delete != SubOpStatus::Failed;
        let portal_ok = portal.failed.is_empty();

        if !delete_ok && req.force {
            warn!(
                "Delete on {} failed, marking it cleaned up because of force",
                req.old_node
            );
            journal
                .append(&[JournalEntry::host(&req.old_node, NodeState::CleanupSuccess)])
                .await?;
            response.delete_ignored = true;
        }

        if prio_moves && create_ok {
            journal
                .append(&[JournalEntry::meta(MetaKey::PrioPath, &req.new_node)])
                .await?;
            bump_priority(volume, &req.old_node, false).await;
            bump_priority(volume, &req.new_node, true).await;
            info!("Priority path moved from {} to {}", req.old_node, req.new_node);
        }

        response.result = Verdict::from_success(create_ok && portal_ok && (delete_ok || req.force));
        info!(
            "Replace {} -> {} on {}/{}: create {} delete {} result {}",
            req.old_node,
            req.new_node,
            req.volume,
            req.block,
            response.create,
            response.delete,
            response.result
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::PriorityCounters;
    use crate::testutil::{CapMode, Harness, create_req, hosts};
    use blockmesh_common::{BlockName, VolumeName};

    fn replace_req(old: &str, new: &str, force: bool) -> ReplaceRequest {
        ReplaceRequest {
            volume: VolumeName::new("vol").unwrap(),
            block: BlockName::new("blk").unwrap(),
            old_node: old.into(),
            new_node: new.into(),
            force,
        }
    }

    async fn setup(hosts: &[&str]) -> Harness {
        let h = Harness::new();
        h.orchestrator
            .create(create_req("blk", hosts, hosts.len()))
            .await
            .unwrap();
        h.backend.reset_calls();
        h
    }

    #[tokio::test]
    async fn test_replace_moves_path() {
        let h = setup(&["h1", "h2"]).await;
        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();

        assert_eq!(response.result, Verdict::Success);
        assert_eq!(response.create, SubOpStatus::Success);
        assert_eq!(response.delete, SubOpStatus::Success);
        assert_eq!(response.replace_portal.succeeded, vec!["h2"]);

        let record = h.journal("blk").await.read_committed().await.unwrap();
        assert_eq!(record.status_of("h1"), Some(&NodeState::CleanupSuccess));
        assert_eq!(record.status_of("h2"), Some(&NodeState::ReplaceSuccess));
        assert_eq!(record.status_of("h3"), Some(&NodeState::ConfigSuccess));

        let create = h.backend.payload("h3", OpKind::Create).unwrap();
        assert_eq!(create.block_hosts, vec!["h3", "h2"]);
        let portal = h.backend.payload("h2", OpKind::ReplacePortal).unwrap();
        assert_eq!(portal.old_node.as_deref(), Some("h1"));
        assert_eq!(portal.new_node.as_deref(), Some("h3"));
    }

    #[tokio::test]
    async fn test_replace_twice_is_skipped() {
        let h = setup(&["h1", "h2"]).await;
        h.orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        h.backend.reset_calls();
        let before = h.journal_text("blk");

        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        assert_eq!(response.result, Verdict::Skipped);
        assert_eq!(response.replace_portal.skipped, vec!["h2"]);
        assert_eq!(h.journal_text("blk"), before);
        assert!(h.backend.calls().is_empty());
        assert!(h.backend.queried().is_empty());
    }

    #[tokio::test]
    async fn test_replace_onto_other_path_of_two_path_block_is_in_use() {
        let h = setup(&["h1", "h2"]).await;
        let before = h.journal_text("blk");

        let err = h
            .orchestrator
            .replace_node(replace_req("h1", "h2", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::NodeInUse { ref node, .. } if node == "h2"));
        assert_eq!(err.exit_code(), 224);
        assert_eq!(h.journal_text("blk"), before);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replace_onto_node_brought_in_by_other_replace_is_in_use() {
        let h = setup(&["h1", "h2"]).await;
        h.orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        h.backend.reset_calls();

        let err = h
            .orchestrator
            .replace_node(replace_req("h2", "h3", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::NodeInUse { .. }));
        assert!(h.backend.calls().is_empty());

        let record = h.journal("blk").await.read_committed().await.unwrap();
        assert_eq!(record.configured_hosts(), vec!["h2", "h3"]);
    }

    #[tokio::test]
    async fn test_replace_unknown_old_node() {
        let h = setup(&["h1"]).await;
        let err = h
            .orchestrator
            .replace_node(replace_req("h9", "h2", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::NodeNotExist { .. }));
        assert_eq!(err.exit_code(), 223);
    }

    #[tokio::test]
    async fn test_replace_onto_serving_node_is_in_use() {
        let h = setup(&["h1", "h2", "h3"]).await;
        let err = h
            .orchestrator
            .replace_node(replace_req("h1", "h2", false))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::NodeInUse { .. }));
        assert_eq!(err.exit_code(), 224);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_force_replace_of_dead_node() {
        let h = setup(&["h1", "h2"]).await;
        h.backend.unreachable("h1");

        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h3", true))
            .await
            .unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert_eq!(response.delete, SubOpStatus::Failed);
        assert!(response.delete_ignored);
        assert!(!h.backend.queried().contains("h1"));

        let record = h.journal("blk").await.read_committed().await.unwrap();
        assert_eq!(record.status_of("h1"), Some(&NodeState::CleanupSuccess));
    }

    #[tokio::test]
    async fn test_replace_without_force_fails_on_dead_node() {
        let h = setup(&["h1", "h2"]).await;
        h.backend.fail("h1", OpKind::Delete);

        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        assert_eq!(response.result, Verdict::Fail);
        assert!(!response.delete_ignored);

        // a retry only deletes on the old node
        h.backend.heal("h1");
        h.backend.reset_calls();
        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert_eq!(response.create, SubOpStatus::Skipped);
        assert_eq!(h.backend.calls(), vec![("h1".to_string(), OpKind::Delete)]);
    }

    #[tokio::test]
    async fn test_replace_moves_priority_path() {
        let h = Harness::new();
        h.backend.caps("h1", CapMode::Legacy);
        h.orchestrator
            .create(create_req("blk", &["h1", "h2"], 2))
            .await
            .unwrap();
        h.backend.caps("h1", CapMode::Full);

        h.orchestrator
            .replace_node(replace_req("h1", "h3", false))
            .await
            .unwrap();
        let record = h.journal("blk").await.read_committed().await.unwrap();
        assert_eq!(record.prio_path.as_deref(), Some("h3"));
        assert_eq!(
            h.backend.payload("h3", OpKind::Create).unwrap().prio_path.as_deref(),
            Some("h3")
        );

        let volume = h.journal("blk").await.volume().clone();
        let counters = PriorityCounters::new(volume.as_ref())
            .load(&hosts(&["h1", "h3"]))
            .await
            .unwrap();
        assert_eq!((counters["h1"], counters["h3"]), (0, 1));
    }

    #[tokio::test]
    async fn test_single_path_replace_reports_no_portal() {
        let h = setup(&["h1"]).await;
        let response = h
            .orchestrator
            .replace_node(replace_req("h1", "h2", false))
            .await
            .unwrap();
        assert_eq!(response.result, Verdict::Success);
        assert!(response.to_string().contains("REPLACE PORTAL SUCCESS ON: N/A"));
    }
}
