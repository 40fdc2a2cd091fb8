//! Block orchestration error types

use crate::backend::{EXIT_DEFAULT_ERROR, EXIT_NODE_IN_USE, EXIT_NODE_NOT_EXIST};
use crate::store::StoreError;
use nix::errno::Errno;
use thiserror::Error;

/// Block orchestration error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Block journal missing or never committed
    #[error("Block {block} does not exist on volume {volume}")]
    BlockNotFound { volume: String, block: String },

    /// Block already committed
    #[error("Block {block} already exists on volume {volume}")]
    BlockExists { volume: String, block: String },

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid or misaligned size
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// Multipath factor larger than the host list
    #[error("Multipath {mpath} exceeds the number of hosts ({hosts})")]
    MultipathExceedsHosts { mpath: usize, hosts: usize },

    /// Fewer configured hosts than the multipath factor
    #[error("Some of the nodes are missing configuration: {0}")]
    MissingConfiguration(String),

    /// A host did not answer the capability query
    #[error("Version check failed on {host}: {reason} (Hint: See if all servers are up)")]
    CapabilityQuery { host: String, reason: String },

    /// A host lacks a capability the request needs
    #[error("Host {host} does not support {capability}, upgrade it and retry")]
    CapabilityMismatch { host: String, capability: String },

    /// Replace source never part of the block
    #[error("Node {node} is not part of block {block}")]
    NodeNotExist { node: String, block: String },

    /// Replace target already serves the block
    #[error("Node {node} is already configured for block {block}")]
    NodeInUse { node: String, block: String },

    /// Durable store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Journal write or read failure
    #[error("Journal error: {0}")]
    Journal(String),

    /// Lock acquisition failure
    #[error("Lock error: {0}")]
    Lock(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<blockmesh_common::Error> for BlockError {
    fn from(err: blockmesh_common::Error) -> Self {
        match err {
            blockmesh_common::Error::InvalidSize(msg) => Self::InvalidSize(msg),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

impl BlockError {
    /// Process exit code reported for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::BlockNotFound { .. } => Errno::ENOENT as i32,
            Self::BlockExists { .. } => Errno::EEXIST as i32,
            Self::InvalidRequest(_)
            | Self::InvalidSize(_)
            | Self::MultipathExceedsHosts { .. }
            | Self::CapabilityMismatch { .. } => Errno::EINVAL as i32,
            Self::MissingConfiguration(_) => Errno::ENODEV as i32,
            Self::NodeNotExist { .. } => EXIT_NODE_NOT_EXIST,
            Self::NodeInUse { .. } => EXIT_NODE_IN_USE,
            Self::Store(_) | Self::Journal(_) | Self::Lock(_) => Errno::EIO as i32,
            Self::CapabilityQuery { .. } | Self::Internal(_) => EXIT_DEFAULT_ERROR,
        }
    }

    /// Check if the request was rejected before anything was mutated
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidSize(_)
                | Self::MultipathExceedsHosts { .. }
                | Self::CapabilityQuery { .. }
                | Self::CapabilityMismatch { .. }
        )
    }

    pub(crate) fn not_found(volume: impl ToString, block: impl ToString) -> Self {
        Self::BlockNotFound {
            volume: volume.to_string(),
            block: block.to_string(),
        }
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;
