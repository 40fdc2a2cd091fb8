//! Parallel fan-out of remote operations
//!
//! Every task becomes one future. Before the remote call the worker journals
//! `<host>: <OP>INPROGRESS`, afterwards `<host>: <OP>SUCCESS` or
//! `<host>: <OP>FAIL`. Workers own their [`Outcome`]; results are only looked
//! at after every worker has finished.

use crate::backend::{
    BackendError, BlockPayload, CapabilityReply, EXIT_DEFAULT_ERROR, EXIT_SUCCESS, OpKind,
    TargetBackend,
};
use crate::error::{BlockError, BlockResult};
use crate::journal::MetaJournal;
use crate::record::JournalEntry;
use crate::status::NodeState;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One remote operation on one host
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub host: String,
    pub op: OpKind,
    pub payload: Arc<BlockPayload>,
}

impl RemoteTask {
    pub fn new(host: impl Into<String>, op: OpKind, payload: Arc<BlockPayload>) -> Self {
        Self {
            host: host.into(),
            op,
            payload,
        }
    }
}

/// Result of one remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub host: String,
    pub op: OpKind,
    pub exit: i32,
    pub output: String,
}

impl Outcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit == EXIT_SUCCESS || self.op.tolerated_exit() == Some(self.exit)
    }
}

/// Hosts that failed and succeeded in one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub failed: Vec<String>,
    pub succeeded: Vec<String>,
}

impl HostSummary {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.succeeded.is_empty()
    }

    /// Failed hosts, space separated
    #[must_use]
    pub fn failed_text(&self) -> String {
        self.failed.join(" ")
    }

    /// Succeeded hosts, space separated
    #[must_use]
    pub fn succeeded_text(&self) -> String {
        self.succeeded.join(" ")
    }

    /// Attempted hosts (failed first), space separated
    #[must_use]
    pub fn attempt_text(&self) -> String {
        self.failed
            .iter()
            .chain(self.succeeded.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn extend(&mut self, other: Self) {
        self.failed.extend(other.failed);
        self.succeeded.extend(other.succeeded);
    }
}

/// Split outcomes into failed and succeeded hosts, keeping task order
#[must_use]
pub fn collect_attempt_success(outcomes: &[Outcome]) -> HostSummary {
    let mut summary = HostSummary::default();
    for outcome in outcomes {
        if outcome.succeeded() {
            summary.succeeded.push(outcome.host.clone());
        } else {
            summary.failed.push(outcome.host.clone());
        }
    }
    summary
}

/// Journal states written around a remote call: before, success, failure
fn progress_states(task: &RemoteTask) -> Option<(NodeState, NodeState, NodeState)> {
    match task.op {
        OpKind::Create => Some((
            NodeState::ConfigInProgress,
            NodeState::ConfigSuccess,
            NodeState::ConfigFail,
        )),
        OpKind::Delete => Some((
            NodeState::CleanupInProgress,
            NodeState::CleanupSuccess,
            NodeState::CleanupFail,
        )),
        OpKind::ModifyAuth if task.payload.auth => Some((
            NodeState::AuthEnforcing,
            NodeState::AuthEnforced,
            NodeState::AuthEnforceFail,
        )),
        OpKind::ModifyAuth => Some((
            NodeState::AuthClearEnforcing,
            NodeState::AuthClearEnforced,
            NodeState::AuthClearEnforceFail,
        )),
        OpKind::ModifySize => {
            let size = Some(task.payload.size);
            Some((
                NodeState::ResizeInProgress(size),
                NodeState::ResizeSuccess(size),
                NodeState::ResizeFail(size),
            ))
        }
        OpKind::ReplacePortal => Some((
            NodeState::ReplaceInProgress,
            NodeState::ReplaceSuccess,
            NodeState::ReplaceFail,
        )),
        OpKind::Reload => None,
    }
}

/// Runs remote operations concurrently against a [`TargetBackend`]
pub struct RemoteOpExecutor {
    backend: Arc<dyn TargetBackend>,
    timeout: Duration,
    capability_timeout: Duration,
}

impl RemoteOpExecutor {
    pub fn new(
        backend: Arc<dyn TargetBackend>,
        timeout: Duration,
        capability_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            timeout,
            capability_timeout,
        }
    }

    /// Run every task and wait for all of them.
    ///
    /// Remote failures become outcomes. A journal write failure in any
    /// worker fails the whole call once every worker is done.
    pub async fn fan_out(
        &self,
        journal: Option<&MetaJournal>,
        tasks: Vec<RemoteTask>,
    ) -> BlockResult<Vec<Outcome>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let count = tasks.len();
        let results = join_all(tasks.into_iter().map(|task| self.run_task(journal, task))).await;

        let mut outcomes = Vec::with_capacity(count);
        let mut journal_error = None;
        for (outcome, error) in results {
            if let Some(error) = error {
                journal_error.get_or_insert(error);
            }
            outcomes.push(outcome);
        }
        if let Some(error) = journal_error {
            return Err(error);
        }

        let summary = collect_attempt_success(&outcomes);
        info!(
            "Fan-out of {} tasks done: succeeded [{}] failed [{}]",
            count,
            summary.succeeded_text(),
            summary.failed_text()
        );
        Ok(outcomes)
    }

    async fn run_task(
        &self,
        journal: Option<&MetaJournal>,
        task: RemoteTask,
    ) -> (Outcome, Option<BlockError>) {
        let states = progress_states(&task);
        let journal = journal.filter(|_| states.is_some());

        if let (Some(journal), Some((before, _, _))) = (journal, &states)
            && let Err(e) = journal
                .append(&[JournalEntry::host(&task.host, before.clone())])
                .await
        {
            let outcome = Outcome {
                host: task.host,
                op: task.op,
                exit: EXIT_DEFAULT_ERROR,
                output: e.to_string(),
            };
            return (outcome, Some(e));
        }

        debug!("Invoking {} on {}", task.op, task.host);
        let reply = tokio::time::timeout(
            self.timeout,
            self.backend.invoke(&task.host, task.op, &task.payload),
        )
        .await;
        let (exit, output) = match reply {
            Ok(Ok(reply)) => (reply.exit, reply.output),
            Ok(Err(e)) => (EXIT_DEFAULT_ERROR, e.to_string()),
            Err(_) => (
                EXIT_DEFAULT_ERROR,
                BackendError::Timeout {
                    host: task.host.clone(),
                }
                .to_string(),
            ),
        };
        let outcome = Outcome {
            host: task.host,
            op: task.op,
            exit,
            output,
        };

        if outcome.succeeded() {
            info!("{} on {} succeeded (exit {})", outcome.op, outcome.host, outcome.exit);
        } else {
            warn!(
                "{} on {} failed (exit {}): {}",
                outcome.op,
                outcome.host,
                outcome.exit,
                outcome.output.trim()
            );
        }

        let mut error = None;
        if let (Some(journal), Some((_, success, failure))) = (journal, states) {
            let mut entries = Vec::with_capacity(2);
            if outcome.succeeded() {
                entries.push(JournalEntry::host(&outcome.host, success));
                if outcome.op == OpKind::Create && task.payload.auth {
                    entries.push(JournalEntry::host(&outcome.host, NodeState::AuthEnforced));
                }
            } else {
                entries.push(JournalEntry::host(&outcome.host, failure));
            }
            if let Err(e) = journal.append(&entries).await {
                error = Some(e);
            }
        }
        (outcome, error)
    }

    /// Query every host concurrently, in input order
    pub async fn query_capabilities(
        &self,
        hosts: &[String],
    ) -> Vec<(String, Result<CapabilityReply, BackendError>)> {
        let queries = hosts.iter().map(|host| async move {
            let reply =
                tokio::time::timeout(self.capability_timeout, self.backend.capabilities(host))
                    .await
                    .unwrap_or_else(|_| Err(BackendError::Timeout { host: host.clone() }));
            (host.clone(), reply)
        });
        join_all(queries).await
    }
}
