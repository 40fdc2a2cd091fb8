//! Block creation
//!
//! States: validate, allocate GBID, create data object, configure the first
//! `mpath` hosts, audit. A short audit pulls in spare hosts from the request
//! list; when too few are left the block is rolled back.

use super::{BlockOrchestrator, bump_priority};
use crate::backend::{BlockPayload, CreateOutput, OpKind};
use crate::capability::{Negotiation, required_capabilities};
use crate::entry::{create_entry, delete_entry};
use crate::error::{BlockError, BlockResult};
use crate::executor::{HostSummary, Outcome, RemoteTask, collect_attempt_success};
use crate::journal::MetaJournal;
use crate::priority::PriorityCounters;
use crate::record::{BlockRecord, JournalEntry};
use crate::request::CreateRequest;
use crate::response::{CreateResponse, Verdict};
use crate::status::{EntryState, MetaKey, NodeState};
use crate::store::VolumeHandle;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Hosts whose create fully succeeded
fn created_hosts(record: &BlockRecord) -> Vec<String> {
    record.hosts_where(|s| matches!(s, NodeState::ConfigSuccess | NodeState::AuthEnforced))
}

impl BlockOrchestrator {
    /// Create a block and expose it on `mpath` hosts
    pub async fn create(&self, mut req: CreateRequest) -> BlockResult<CreateResponse> {
        req.validate()?;
        let negotiation = self
            .negotiator
            .negotiate(&req.hosts, &required_capabilities(&req.features()))
            .await?;

        let (volume, journal) = self.bind(&req.volume, &req.block).await?;
        let lock = journal.lock().await?;
        let result = self
            .create_locked(&req, volume.as_ref(), &journal, negotiation)
            .await;
        journal.unlock(lock);
        result
    }

    async fn create_locked(
        &self,
        req: &CreateRequest,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
        negotiation: Negotiation,
    ) -> BlockResult<CreateResponse> {
        if journal.exists().await? {
            let stale = journal.read().await?;
            if stale.is_committed() {
                return Err(BlockError::BlockExists {
                    volume: req.volume.to_string(),
                    block: req.block.to_string(),
                });
            }
            warn!(
                "Removing stale journal of {}/{} left by an interrupted create",
                req.volume, req.block
            );
            if !stale.gbid.is_empty() {
                delete_entry(volume, &stale.gbid).await?;
            }
            journal.remove().await?;
        }

        let first: Vec<String> = req.hosts[..req.mpath].to_vec();
        let prio_path = if negotiation.load_balance_missing {
            PriorityCounters::new(volume).select(&first).await?
        } else {
            None
        };

        let gbid = Uuid::new_v4().to_string();
        let mut entries = vec![
            JournalEntry::meta(MetaKey::Volume, &req.volume),
            JournalEntry::meta(MetaKey::Gbid, &gbid),
            JournalEntry::meta(MetaKey::Ha, req.mpath),
            JournalEntry::meta(MetaKey::EntryCreate, EntryState::InProgress),
        ];
        if let Some(prio) = &prio_path {
            entries.push(JournalEntry::meta(MetaKey::PrioPath, prio));
        }
        journal.append(&entries).await?;

        if let Err(e) = create_entry(volume, &gbid, req.size, req.prealloc).await {
            error!(
                "Failed to create data object of {}/{}: {}",
                req.volume, req.block, e
            );
            if let Err(je) = journal
                .append(&[JournalEntry::meta(MetaKey::EntryCreate, EntryState::Fail)])
                .await
            {
                warn!("Failed to record create failure: {}", je);
            }
            return Err(e.into());
        }

        let password = req.auth.then(|| Uuid::new_v4().to_string());
        let mut entries = vec![JournalEntry::meta(MetaKey::Size, req.size)];
        if let Some(rb) = req.ring_buffer {
            entries.push(JournalEntry::meta(MetaKey::RingBuffer, rb));
        }
        if let Some(blk) = req.block_size {
            entries.push(JournalEntry::meta(MetaKey::BlkSize, blk));
        }
        if let Some(timeout) = req.io_timeout {
            entries.push(JournalEntry::meta(MetaKey::IoTimeout, timeout));
        }
        entries.push(JournalEntry::meta(MetaKey::EntryCreate, EntryState::Success));
        if let Some(password) = &password {
            entries.push(JournalEntry::meta(MetaKey::Password, password));
        }
        journal.append(&entries).await?;
        info!(
            "Block {}/{} allocated with gbid {} ({} bytes)",
            req.volume, req.block, gbid, req.size
        );

        let mut payload = BlockPayload {
            volume: req.volume.to_string(),
            block_name: req.block.to_string(),
            gbid: gbid.clone(),
            size: req.size,
            auth: req.auth,
            password: password.clone(),
            ring_buffer: req.ring_buffer,
            block_size: req.block_size,
            io_timeout: req.io_timeout,
            prealloc: req.prealloc,
            prio_path: prio_path.clone(),
            ..BlockPayload::default()
        };

        let mut attempted: Vec<String> = Vec::new();
        let mut outcomes: Vec<Outcome> = Vec::new();
        let mut created: Vec<String> = Vec::new();
        let mut batch = first;
        loop {
            payload.block_hosts = created.iter().chain(batch.iter()).cloned().collect();
            let shared = Arc::new(payload.clone());
            let tasks = batch
                .iter()
                .map(|host| RemoteTask::new(host, OpKind::Create, Arc::clone(&shared)))
                .collect();
            attempted.append(&mut batch);
            outcomes.extend(self.executor.fan_out(Some(journal), tasks).await?);

            let record = journal.read().await?;
            created = created_hosts(&record);
            if created.len() >= req.mpath {
                break;
            }

            let needed = req.mpath - created.len();
            let spares: Vec<String> = req
                .hosts
                .iter()
                .filter(|h| !attempted.contains(h) && record.node(h).is_none())
                .cloned()
                .collect();
            if spares.len() < needed {
                warn!(
                    "Only {} of {} paths of {}/{} configured and {} spare hosts left, rolling back",
                    created.len(),
                    req.mpath,
                    req.volume,
                    req.block,
                    spares.len()
                );
                let rollback = self.rollback_create(volume, journal, &gbid).await;
                return Ok(CreateResponse {
                    name: req.block.to_string(),
                    volume: req.volume.to_string(),
                    gbid,
                    iqn: None,
                    username: None,
                    password: None,
                    portals: Vec::new(),
                    backend: None,
                    configure: collect_attempt_success(&outcomes),
                    rollback: Some(rollback),
                    result: Verdict::Fail,
                });
            }

            info!(
                "{} of {} paths of {}/{} configured, trying spares {:?}",
                created.len(),
                req.mpath,
                req.volume,
                req.block,
                &spares[..needed]
            );
            batch = spares.into_iter().take(needed).collect();
        }

        if let Some(prio) = &prio_path {
            bump_priority(volume, prio, true).await;
        }

        let mut iqn = None;
        let mut backend = None;
        let mut portals: Vec<String> = Vec::new();
        for outcome in outcomes.iter().filter(|o| o.succeeded()) {
            let parsed = CreateOutput::parse(&outcome.output);
            iqn = iqn.or(parsed.iqn);
            backend = backend.or(parsed.backend);
            for portal in parsed.portals {
                if !portals.contains(&portal) {
                    portals.push(portal);
                }
            }
            for failure in parsed.failures {
                warn!("{} reported: {}", outcome.host, failure);
            }
        }
        if portals.is_empty() {
            portals = created.iter().map(|h| self.portal(h)).collect();
        }

        info!(
            "Block {}/{} created on {}",
            req.volume,
            req.block,
            created.join(" ")
        );
        Ok(CreateResponse {
            name: req.block.to_string(),
            volume: req.volume.to_string(),
            iqn: Some(iqn.unwrap_or_else(|| self.iqn(&gbid))),
            username: password.as_ref().map(|_| gbid.clone()),
            password,
            portals,
            backend,
            configure: collect_attempt_success(&outcomes),
            rollback: None,
            result: Verdict::Success,
            gbid,
        })
    }

    /// Clean up every touched host, then drop the data object and journal
    async fn rollback_create(
        &self,
        volume: &dyn VolumeHandle,
        journal: &MetaJournal,
        gbid: &str,
    ) -> HostSummary {
        let summary = match journal.read().await {
            Ok(record) => match self.cleanup(journal, &record, false).await {
                Ok(report) => report.summary,
                Err(e) => {
                    warn!("Rollback cleanup failed: {}", e);
                    HostSummary::default()
                }
            },
            Err(e) => {
                warn!("Rollback could not read the journal: {}", e);
                HostSummary::default()
            }
        };
        if !summary.all_succeeded() {
            warn!("Rollback failed on {}", summary.failed_text());
        }
        if let Err(e) = delete_entry(volume, gbid).await {
            warn!("Rollback failed to remove data object {}: {}", gbid, e);
        }
        if let Err(e) = journal.remove().await {
            warn!("Rollback failed to remove journal: {}", e);
        }
        summary
    }
}
