#![allow(clippy::result_large_err)]
//! blockmesh Block Orchestration
//!
//! This crate drives the lifecycle of multipathed iSCSI blocks whose data
//! lives on a shared volume and whose target configuration is spread across
//! a set of gateway hosts.
//!
//! # Features
//!
//! - **Durable journal**: one append-only `KEY: VALUE` log per block, replayed
//!   into a [`BlockRecord`] on every read
//! - **Parallel fan-out**: remote operations run concurrently on every host,
//!   progress is journaled per host
//! - **Audit and rollback**: quorum against the multipath factor with spare
//!   host substitution, compensating fan-outs on partial failure
//! - **Capability negotiation**: operations are gated on what every host
//!   supports, legacy hosts get a fixed subset
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   BlockOrchestrator  │  create / delete / modify / replace / reload
//! └───┬─────────┬────────┘
//!     │         │
//! ┌───▼───┐ ┌───▼───────────────┐     ┌──────────────────┐
//! │Journal│ │ CapabilityNegot.  │────▶│ RemoteOpExecutor │──▶ TargetBackend
//! └───┬───┘ └───────────────────┘     └──────────────────┘      (per host)
//!     │
//! ┌───▼──────────────┐
//! │ VolumeHandleCache│──▶ VolumeConnector (local dir / memory)
//! └──────────────────┘
//! ```

pub mod backend;
pub mod cache;
pub mod capability;
pub mod entry;
pub mod error;
pub mod executor;
pub mod journal;
pub mod orchestrator;
pub mod priority;
pub mod record;
pub mod request;
pub mod response;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use backend::{
    BackendError, BackendReply, BlockPayload, CapabilityReply, CreateOutput, OpKind,
    TargetBackend,
};
pub use cache::{CacheStats, VolumeHandleCache};
pub use capability::{
    Capability, CapabilityNegotiator, CapabilitySet, Negotiation, OpFeatures,
    required_capabilities,
};
pub use error::{BlockError, BlockResult};
pub use executor::{HostSummary, Outcome, RemoteOpExecutor, RemoteTask, collect_attempt_success};
pub use journal::{JournalLock, MetaJournal};
pub use orchestrator::{BlockOrchestrator, OrchestratorSettings};
pub use priority::PriorityCounters;
pub use record::{BlockRecord, JournalEntry, NodeStatus};
pub use request::{
    CreateRequest, DeleteRequest, ModifyAuthRequest, ModifySizeRequest, ReloadRequest,
    ReplaceRequest,
};
pub use response::{
    BlockInfo, BlockList, CreateResponse, DeleteResponse, FailedResize, ModifyAuthResponse,
    ModifySizeResponse, NodeView, PortalReport, ReloadResponse, ReplaceResponse, SubOpStatus,
    Verdict,
};
pub use status::{EntryState, MetaKey, NodeState};
pub use store::{
    LocalConnector, MemoryConnector, ObjectLock, StoreError, StoreResult, VolumeConnector,
    VolumeHandle,
};

/// Directory holding block journals
pub const META_DIR: &str = "block-meta";

/// Directory holding the per-block lock objects (never removed)
pub const LOCK_DIR: &str = "block-meta/.locks";

/// Directory holding block data objects
pub const DATA_DIR: &str = "block-store";

/// Largest accepted ring buffer size in MiB
pub const RING_BUFFER_MAX_MIB: u32 = 1024;
