//! Authentication toggle with compensating rollback

use super::{BlockOrchestrator, record_payload};
use crate::backend::{BlockPayload, OpKind};
use crate::capability::{OpFeatures, required_capabilities};
use crate::error::{BlockError, BlockResult};
use crate::executor::{HostSummary, RemoteTask, collect_attempt_success};
use crate::journal::MetaJournal;
use crate::record::{BlockRecord, JournalEntry};
use crate::request::ModifyAuthRequest;
use crate::response::{ModifyAuthResponse, Verdict};
use crate::status::{MetaKey, NodeState};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Hosts that need the toggle towards `enable`
fn auth_targets(record: &BlockRecord, enable: bool) -> Vec<String> {
    record.hosts_where(|state| match state {
        NodeState::AuthEnforcing
        | NodeState::AuthClearEnforcing
        | NodeState::AuthClearEnforceFail => true,
        NodeState::AuthEnforced => !enable,
        NodeState::ConfigSuccess
        | NodeState::CleanupInProgress
        | NodeState::AuthEnforceFail
        | NodeState::AuthClearEnforced => enable,
        s => enable && (s.is_replace() || s.is_resize()),
    })
}

impl BlockOrchestrator {
    /// Enable or disable CHAP authentication on every configured host
    pub async fn modify_auth(&self, req: ModifyAuthRequest) -> BlockResult<ModifyAuthResponse> {
        let (_, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self.modify_auth_locked(&req, &journal).await;
        journal.unlock(lock);
        result
    }

    async fn modify_auth_locked(
        &self,
        req: &ModifyAuthRequest,
        journal: &MetaJournal,
    ) -> BlockResult<ModifyAuthResponse> {
        let record = journal.read_committed().await?;
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
            .negotiate(&configured, &required_capabilities(&OpFeatures::ModifyAuth))
            .await?;

        let previous = record.password.clone();
        let password = if req.enable {
            if let Some(password) = &previous {
                Some(password.clone())
            } else {
                let password = Uuid::new_v4().to_string();
                journal
                    .append(&[JournalEntry::meta(MetaKey::Password, &password)])
                    .await?;
                Some(password)
            }
        } else {
            journal
                .append(&[JournalEntry::meta(MetaKey::Password, "")])
                .await?;
            None
        };

        let targets = auth_targets(&record, req.enable);
        let skipped: Vec<String> = configured
            .iter()
            .filter(|h| !targets.contains(h))
            .cloned()
            .collect();
        if !skipped.is_empty() {
            info!("Authentication already in place on {}", skipped.join(" "));
        }

        let summary = self
            .toggle_auth(journal, &record, targets, req.enable, password.clone())
            .await?;

        let (rollback, result) = if summary.all_succeeded() {
            info!(
                "Authentication {} on {}/{}",
                if req.enable { "enabled" } else { "disabled" },
                req.volume,
                req.block
            );
            (None, Verdict::Success)
        } else {
            warn!(
                "Authentication toggle failed on {}, rolling back",
                summary.failed_text()
            );
            journal
                .append(&[JournalEntry::meta(
                    MetaKey::Password,
                    previous.as_deref().unwrap_or(""),
                )])
                .await?;
            let after = journal.read().await?;
            let targets = auth_targets(&after, !req.enable);
            let rollback = self
                .toggle_auth(journal, &after, targets, !req.enable, previous)
                .await?;
            if !rollback.all_succeeded() {
                warn!("Rollback failed on {}", rollback.failed_text());
            }
            (Some(rollback), Verdict::Fail)
        };

        Ok(ModifyAuthResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            enable: req.enable,
            iqn: self.iqn(&record.gbid),
            username: password.as_ref().map(|_| record.gbid.clone()),
            password,
            summary,
            skipped,
            rollback,
            result,
        })
    }

    async fn toggle_auth(
        &self,
        journal: &MetaJournal,
        record: &BlockRecord,
        targets: Vec<String>,
        enable: bool,
        password: Option<String>,
    ) -> BlockResult<HostSummary> {
        let payload = Arc::new(BlockPayload {
            auth: enable,
            password,
            ..record_payload(record)
        });
        let tasks = targets
            .into_iter()
            .map(|host| RemoteTask::new(host, OpKind::ModifyAuth, Arc::clone(&payload)))
            .collect();
        let outcomes = self.executor.fan_out(Some(journal), tasks).await?;
        Ok(collect_attempt_success(&outcomes))
    }
}
