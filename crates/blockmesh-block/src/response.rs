//! Lifecycle responses
//!
//! Every response serializes to JSON and renders as the plain `KEY: VALUE`
//! summary operators read. Each one names the hosts that were attempted,
//! succeeded or skipped, and ends with a `RESULT:` verdict.

use crate::executor::HostSummary;
use blockmesh_common::format_size;
use serde::Serialize;
use std::fmt;

/// Terminal verdict of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Success,
    Fail,
    Skipped,
}

impl Verdict {
    /// Success or nothing to do
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    #[must_use]
    pub const fn from_success(ok: bool) -> Self {
        if ok { Self::Success } else { Self::Fail }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
        })
    }
}

fn write_hosts(f: &mut fmt::Formatter<'_>, label: &str, hosts: &[String]) -> fmt::Result {
    if hosts.is_empty() {
        return Ok(());
    }
    writeln!(f, "{label}: {}", hosts.join(" "))
}

fn write_rollback(f: &mut fmt::Formatter<'_>, rollback: Option<&HostSummary>) -> fmt::Result {
    if let Some(rollback) = rollback {
        write_hosts(f, "ROLLBACK FAILED ON", &rollback.failed)?;
        write_hosts(f, "ROLLBACK SUCCESS ON", &rollback.succeeded)?;
    }
    Ok(())
}

/// Result of a create
#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub name: String,
    pub volume: String,
    pub gbid: String,
    pub iqn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub portals: Vec<String>,
    pub backend: Option<String>,
    /// Hosts the block was configured on, across spare rounds
    pub configure: HostSummary,
    /// Cleanup hosts when the create was rolled back
    pub rollback: Option<HostSummary>,
    pub result: Verdict,
}

impl fmt::Display for CreateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.result.is_ok() {
            if let Some(iqn) = &self.iqn {
                writeln!(f, "IQN: {iqn}")?;
            }
            if let (Some(user), Some(password)) = (&self.username, &self.password) {
                writeln!(f, "USERNAME: {user}")?;
                writeln!(f, "PASSWORD: {password}")?;
            }
            writeln!(f, "PORTAL(S): {}", self.portals.join(" "))?;
            if let Some(backend) = &self.backend {
                writeln!(f, "BACKEND: {backend}")?;
            }
        }
        write_hosts(f, "FAILED ON", &self.configure.failed)?;
        write_rollback(f, self.rollback.as_ref())?;
        write!(f, "RESULT: {}", self.result)
    }
}

/// Result of a delete
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub name: String,
    pub volume: String,
    pub cleanup: HostSummary,
    /// Data object and journal were removed
    pub removed: bool,
    pub result: Verdict,
}

impl fmt::Display for DeleteResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hosts(f, "FAILED ON", &self.cleanup.failed)?;
        if self.cleanup.succeeded.is_empty() {
            writeln!(f, "SUCCESSFUL ON: None")?;
        } else {
            writeln!(f, "SUCCESSFUL ON: {}", self.cleanup.succeeded_text())?;
        }
        write!(f, "RESULT: {}", self.result)
    }
}

/// Result of an authentication toggle
#[derive(Debug, Clone, Serialize)]
pub struct ModifyAuthResponse {
    pub name: String,
    pub volume: String,
    pub enable: bool,
    pub iqn: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub summary: HostSummary,
    /// Configured hosts already in the requested mode
    pub skipped: Vec<String>,
    pub rollback: Option<HostSummary>,
    pub result: Verdict,
}

impl fmt::Display for ModifyAuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IQN: {}", self.iqn)?;
        if self.result.is_ok()
            && let (Some(user), Some(password)) = (&self.username, &self.password)
        {
            writeln!(f, "USERNAME: {user}")?;
            writeln!(f, "PASSWORD: {password}")?;
        }
        write_hosts(f, "SUCCESSFUL ON", &self.summary.succeeded)?;
        write_hosts(f, "FAILED ON", &self.summary.failed)?;
        write_hosts(f, "SKIPPED ON", &self.skipped)?;
        write_rollback(f, self.rollback.as_ref())?;
        write!(f, "RESULT: {}", self.result)
    }
}

/// Host that failed a resize, with the size it still serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedResize {
    pub host: String,
    pub size: u64,
}

/// Result of a resize
#[derive(Debug, Clone, Serialize)]
pub struct ModifySizeResponse {
    pub name: String,
    pub volume: String,
    pub size: u64,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedResize>,
    /// Hosts already serving the requested size
    pub skipped: Vec<String>,
    pub result: Verdict,
}

impl fmt::Display for ModifySizeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NAME: {}", self.name)?;
        writeln!(f, "SIZE: {}", format_size(self.size))?;
        write_hosts(f, "SUCCESSFUL ON", &self.succeeded)?;
        if !self.failed.is_empty() {
            let failed: Vec<String> = self
                .failed
                .iter()
                .map(|r| format!("{} ({})", r.host, format_size(r.size)))
                .collect();
            writeln!(f, "FAILED ON: {}", failed.join(" "))?;
        }
        write_hosts(f, "SKIPPED ON", &self.skipped)?;
        write!(f, "RESULT: {}", self.result)
    }
}

/// Outcome of one replace sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubOpStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for SubOpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        })
    }
}

/// Portal replacement on the remaining hosts
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortalReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl PortalReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Result of a node replacement
#[derive(Debug, Clone, Serialize)]
pub struct ReplaceResponse {
    pub name: String,
    pub volume: String,
    pub old_node: String,
    pub new_node: String,
    pub create: SubOpStatus,
    pub delete: SubOpStatus,
    /// Delete failure tolerated because of force
    pub delete_ignored: bool,
    pub replace_portal: PortalReport,
    pub result: Verdict,
}

impl fmt::Display for ReplaceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NAME: {}", self.name)?;
        writeln!(f, "CREATE {}: {}", self.create, self.new_node)?;
        if self.delete_ignored {
            writeln!(f, "DELETE {} (ignored): {}", self.delete, self.old_node)?;
        } else {
            writeln!(f, "DELETE {}: {}", self.delete, self.old_node)?;
        }
        let portal = &self.replace_portal;
        if portal.is_empty() {
            writeln!(f, "REPLACE PORTAL SUCCESS ON: N/A")?;
        } else {
            write_hosts(f, "REPLACE PORTAL SUCCESS ON", &portal.succeeded)?;
            write_hosts(f, "REPLACE PORTAL FAILED ON", &portal.failed)?;
            write_hosts(f, "REPLACE PORTAL SKIPPED ON", &portal.skipped)?;
        }
        write!(f, "RESULT: {}", self.result)
    }
}

/// Result of a reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadResponse {
    pub name: String,
    pub volume: String,
    pub summary: HostSummary,
    pub result: Verdict,
}

impl fmt::Display for ReloadResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hosts(f, "FAILED ON", &self.summary.failed)?;
        if self.summary.succeeded.is_empty() {
            writeln!(f, "SUCCESSFUL ON: None")?;
        } else {
            writeln!(f, "SUCCESSFUL ON: {}", self.summary.succeeded_text())?;
        }
        write!(f, "RESULT: {}", self.result)
    }
}

/// One host of a block and its journal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub host: String,
    pub status: String,
}

/// Details of one block
#[derive(Debug, Clone, Serialize)]
pub struct BlockInfo {
    pub name: String,
    pub volume: String,
    pub gbid: String,
    pub size: u64,
    pub ha: usize,
    pub password: Option<String>,
    pub prio_path: Option<String>,
    pub ring_buffer: Option<u32>,
    pub block_size: Option<u64>,
    pub io_timeout: Option<u32>,
    pub exported_on: Vec<String>,
    pub failures_on: Vec<String>,
    pub nodes: Vec<NodeView>,
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NAME: {}", self.name)?;
        writeln!(f, "VOLUME: {}", self.volume)?;
        writeln!(f, "GBID: {}", self.gbid)?;
        writeln!(f, "SIZE: {}", format_size(self.size))?;
        writeln!(f, "HA: {}", self.ha)?;
        writeln!(f, "PASSWORD: {}", self.password.as_deref().unwrap_or(""))?;
        if let Some(prio) = &self.prio_path {
            writeln!(f, "PRIORITY PATH: {prio}")?;
        }
        if let Some(rb) = self.ring_buffer {
            writeln!(f, "RINGBUFFER: {rb}")?;
        }
        if let Some(blk) = self.block_size {
            writeln!(f, "BLOCKSIZE: {blk}")?;
        }
        if let Some(timeout) = self.io_timeout {
            writeln!(f, "IO TIMEOUT: {timeout}")?;
        }
        writeln!(f, "EXPORTED ON: {}", self.exported_on.join(" "))?;
        write_hosts(f, "ENCOUNTERED FAILURES ON", &self.failures_on)?;
        write!(f, "HOST STATUS:")?;
        for node in &self.nodes {
            write!(f, "\n  {}: {}", node.host, node.status)?;
        }
        Ok(())
    }
}

/// Blocks of one volume
#[derive(Debug, Clone, Serialize)]
pub struct BlockList {
    pub volume: String,
    pub blocks: Vec<String>,
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocks.is_empty() {
            return write!(f, "*Nil*");
        }
        write!(f, "{}", self.blocks.join("\n"))
    }
}
