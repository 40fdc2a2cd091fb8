//! Target backend seam
//!
//! Every gateway host runs an agent that applies iSCSI target configuration
//! for a block. The engine only needs the operation's exit code and output;
//! the only output it interprets is the portal and IQN summary of a create.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Operation completed
pub const EXIT_SUCCESS: i32 = 0;
/// Nothing to do on this host
pub const EXIT_OP_SKIPPED: i32 = 222;
/// Node is not part of the block
pub const EXIT_NODE_NOT_EXIST: i32 = 223;
/// Node already serves the block
pub const EXIT_NODE_IN_USE: i32 = 224;
/// Block not loaded in the target
pub const EXIT_BLOCK_NOT_LOADED: i32 = 225;
/// Block unknown to the target
pub const EXIT_BLOCK_NOT_FOUND: i32 = 226;
/// Catch-all failure
pub const EXIT_DEFAULT_ERROR: i32 = 255;

/// Remote operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Delete,
    ModifyAuth,
    ModifySize,
    ReplacePortal,
    Reload,
}

impl OpKind {
    /// Wire name, also the last path segment of the agent endpoint
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::ModifyAuth => "modify_auth",
            Self::ModifySize => "modify_size",
            Self::ReplacePortal => "replace_portal",
            Self::Reload => "reload",
        }
    }

    /// Exit code meaning success for this operation, besides zero
    #[must_use]
    pub const fn tolerated_exit(self) -> Option<i32> {
        match self {
            Self::Delete => Some(EXIT_BLOCK_NOT_FOUND),
            Self::ReplacePortal => Some(EXIT_OP_SKIPPED),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a host needs to apply one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub volume: String,
    pub block_name: String,
    pub gbid: String,
    pub size: u64,
    /// Create: authentication requested. Modify-auth: enable (true) or disable.
    pub auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring_buffer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_timeout: Option<u32>,
    pub prealloc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prio_path: Option<String>,
    /// Hosts serving the block once the operation completes
    pub block_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_node: Option<String>,
    pub force: bool,
}

/// Result reported by a host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReply {
    pub exit: i32,
    pub output: String,
}

/// Answer to a capability query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityReply {
    /// Capability name to supported flag
    Supported(BTreeMap<String, bool>),
    /// Host predates capability queries
    Unsupported,
}

/// Failure to obtain an answer from a host
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("host {host} timed out")]
    Timeout { host: String },

    #[error("bad reply from {host}: {reason}")]
    Protocol { host: String, reason: String },
}

/// Applies operations on gateway hosts
#[async_trait]
pub trait TargetBackend: Send + Sync {
    /// Run one operation on one host
    async fn invoke(
        &self,
        host: &str,
        op: OpKind,
        payload: &BlockPayload,
    ) -> Result<BackendReply, BackendError>;

    /// Ask a host what it supports
    async fn capabilities(&self, host: &str) -> Result<CapabilityReply, BackendError>;
}

/// Summary lines printed by a host after a create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOutput {
    pub iqn: Option<String>,
    pub portals: Vec<String>,
    pub backend: Option<String>,
    /// Lines starting with `FAILED`, kept as diagnostics
    pub failures: Vec<String>,
}

impl CreateOutput {
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let mut parsed = Self::default();
        for line in output.lines().map(str::trim) {
            if line.starts_with("FAILED") {
                parsed.failures.push(line.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "IQN" if !value.is_empty() => parsed.iqn = Some(value.to_string()),
                "PORTAL" | "PORTAL(S)" => parsed
                    .portals
                    .extend(value.split_whitespace().map(str::to_string)),
                "BACKEND" if !value.is_empty() => parsed.backend = Some(value.to_string()),
                _ => {}
            }
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_output() {
        let out = CreateOutput::parse(
            "IQN: iqn.2016-12.org.blockmesh:abc\nPORTAL(S): 10.0.0.1:3260 10.0.0.2:3260\n\
             BACKEND: tcmu-runner\nFAILED ON: 10.0.0.3\nRESULT: SUCCESS\n",
        );
        assert_eq!(out.iqn.as_deref(), Some("iqn.2016-12.org.blockmesh:abc"));
        assert_eq!(out.portals, vec!["10.0.0.1:3260", "10.0.0.2:3260"]);
        assert_eq!(out.backend.as_deref(), Some("tcmu-runner"));
        assert_eq!(out.failures, vec!["FAILED ON: 10.0.0.3"]);
    }

    #[test]
    fn test_parse_free_text_output() {
        let out = CreateOutput::parse("something went fine\n");
        assert_eq!(out, CreateOutput::default());
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = BlockPayload {
            volume: "vol".into(),
            block_name: "blk".into(),
            gbid: "g".into(),
            size: 1024,
            ..BlockPayload::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["block_name"], "blk");
        assert!(json.get("password").is_none());
        assert_eq!(serde_json::to_value(OpKind::ReplacePortal).unwrap(), "replace_portal");
    }
}
