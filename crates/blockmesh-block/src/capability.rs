//! Capability negotiation
//!
//! Hosts may run different agent versions. Before anything is mutated the
//! capabilities an operation needs are checked on every host it will touch.
//! Hosts that predate capability queries are assumed to support
//! [`Capability::LEGACY`].

use crate::backend::CapabilityReply;
use crate::error::{BlockError, BlockResult};
use crate::executor::RemoteOpExecutor;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional feature a host agent may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Create,
    CreateHa,
    CreatePrealloc,
    CreateAuth,
    Delete,
    DeleteForce,
    Modify,
    ModifyAuth,
    ModifySize,
    Replace,
    CreateRingBuffer,
    CreateLoadBalance,
    Json,
    CreateBlockSize,
    Reload,
    CreateIoTimeout,
}

impl Capability {
    /// Every known capability
    pub const ALL: [Self; 16] = [
        Self::Create,
        Self::CreateHa,
        Self::CreatePrealloc,
        Self::CreateAuth,
        Self::Delete,
        Self::DeleteForce,
        Self::Modify,
        Self::ModifyAuth,
        Self::ModifySize,
        Self::Replace,
        Self::CreateRingBuffer,
        Self::CreateLoadBalance,
        Self::Json,
        Self::CreateBlockSize,
        Self::Reload,
        Self::CreateIoTimeout,
    ];

    /// Assumed for hosts that cannot answer a capability query
    pub const LEGACY: [Self; 9] = [
        Self::Create,
        Self::CreateHa,
        Self::CreatePrealloc,
        Self::CreateAuth,
        Self::Delete,
        Self::DeleteForce,
        Self::Modify,
        Self::ModifyAuth,
        Self::Json,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateHa => "create_ha",
            Self::CreatePrealloc => "create_prealloc",
            Self::CreateAuth => "create_auth",
            Self::Delete => "delete",
            Self::DeleteForce => "delete_force",
            Self::Modify => "modify",
            Self::ModifyAuth => "modify_auth",
            Self::ModifySize => "modify_size",
            Self::Replace => "replace",
            Self::CreateRingBuffer => "create_ring_buffer",
            Self::CreateLoadBalance => "create_load_balance",
            Self::Json => "json",
            Self::CreateBlockSize => "create_block_size",
            Self::Reload => "reload",
            Self::CreateIoTimeout => "create_io_timeout",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities supported by one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    #[must_use]
    pub fn legacy() -> Self {
        Self(Capability::LEGACY.into_iter().collect())
    }

    /// Build from a query reply. Unknown names are ignored.
    #[must_use]
    pub fn from_reply(reply: &CapabilityReply) -> Self {
        match reply {
            CapabilityReply::Unsupported => Self::legacy(),
            CapabilityReply::Supported(map) => Self(
                map.iter()
                    .filter(|(_, supported)| **supported)
                    .filter_map(|(name, _)| Capability::from_name(name))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

/// Features of a request that decide which capabilities it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFeatures {
    Create {
        mpath: usize,
        prealloc: bool,
        auth: bool,
        ring_buffer: bool,
        block_size: bool,
        io_timeout: bool,
    },
    Delete {
        force: bool,
    },
    ModifyAuth,
    ModifySize,
    Replace,
    Reload,
}

/// Capabilities every host must support for a request
#[must_use]
pub fn required_capabilities(features: &OpFeatures) -> BTreeSet<Capability> {
    let mut required = BTreeSet::new();
    match *features {
        OpFeatures::Create {
            mpath,
            prealloc,
            auth,
            ring_buffer,
            block_size,
            io_timeout,
        } => {
            required.insert(Capability::Create);
            required.insert(Capability::CreateLoadBalance);
            let optional = [
                (mpath > 1, Capability::CreateHa),
                (prealloc, Capability::CreatePrealloc),
                (auth, Capability::CreateAuth),
                (ring_buffer, Capability::CreateRingBuffer),
                (block_size, Capability::CreateBlockSize),
                (io_timeout, Capability::CreateIoTimeout),
            ];
            required.extend(optional.into_iter().filter(|(used, _)| *used).map(|(_, c)| c));
        }
        OpFeatures::Delete { force } => {
            required.insert(Capability::Delete);
            if force {
                required.insert(Capability::DeleteForce);
            }
        }
        OpFeatures::ModifyAuth => {
            required.insert(Capability::Modify);
            required.insert(Capability::ModifyAuth);
        }
        OpFeatures::ModifySize => {
            required.insert(Capability::ModifySize);
        }
        OpFeatures::Replace => {
            required.insert(Capability::Replace);
        }
        OpFeatures::Reload => {
            required.insert(Capability::Reload);
        }
    }
    required
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Negotiation {
    /// Some host cannot balance paths itself, a priority path must be assigned
    pub load_balance_missing: bool,
}

/// Checks required capabilities on a set of hosts
#[derive(Clone)]
pub struct CapabilityNegotiator {
    executor: Arc<RemoteOpExecutor>,
}

impl CapabilityNegotiator {
    pub fn new(executor: Arc<RemoteOpExecutor>) -> Self {
        Self { executor }
    }

    /// Query every host and fail closed on the first missing capability.
    ///
    /// A missing `create_load_balance` only sets
    /// [`Negotiation::load_balance_missing`].
    pub async fn negotiate(
        &self,
        hosts: &[String],
        required: &BTreeSet<Capability>,
    ) -> BlockResult<Negotiation> {
        let mut negotiation = Negotiation::default();
        if hosts.is_empty() || required.is_empty() {
            return Ok(negotiation);
        }

        for (host, reply) in self.executor.query_capabilities(hosts).await {
            let reply = reply.map_err(|e| {
                warn!("Capability query on {} failed: {}", host, e);
                BlockError::CapabilityQuery {
                    host: host.clone(),
                    reason: e.to_string(),
                }
            })?;
            if reply == CapabilityReply::Unsupported {
                debug!("{} predates capability queries, assuming legacy set", host);
            }
            let supported = CapabilitySet::from_reply(&reply);

            for capability in required {
                if supported.contains(*capability) {
                    continue;
                }
                if *capability == Capability::CreateLoadBalance {
                    if !negotiation.load_balance_missing {
                        info!("{} cannot balance paths, a priority path will be assigned", host);
                    }
                    negotiation.load_balance_missing = true;
                    continue;
                }
                warn!("{} lacks capability {}", host, capability);
                return Err(BlockError::CapabilityMismatch {
                    host,
                    capability: capability.to_string(),
                });
            }
        }
        Ok(negotiation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CapMode, FakeBackend, hosts};
    use std::time::Duration;

    fn negotiator(backend: &Arc<FakeBackend>) -> CapabilityNegotiator {
        CapabilityNegotiator::new(Arc::new(RemoteOpExecutor::new(
            backend.clone(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )))
    }

    fn create_features(mpath: usize, auth: bool) -> OpFeatures {
        OpFeatures::Create {
            mpath,
            prealloc: false,
            auth,
            ring_buffer: false,
            block_size: false,
            io_timeout: false,
        }
    }

    #[test]
    fn test_required_capabilities() {
        let required = required_capabilities(&create_features(3, true));
        assert!(required.contains(&Capability::CreateHa));
        assert!(required.contains(&Capability::CreateAuth));
        assert!(!required.contains(&Capability::CreatePrealloc));

        let single = required_capabilities(&create_features(1, false));
        assert_eq!(
            single.into_iter().collect::<Vec<_>>(),
            vec![Capability::Create, Capability::CreateLoadBalance]
        );

        let delete = required_capabilities(&OpFeatures::Delete { force: true });
        assert!(delete.contains(&Capability::DeleteForce));
    }

    #[test]
    fn test_capability_names_round_trip() {
        for capability in Capability::ALL {
            assert_eq!(Capability::from_name(capability.as_str()), Some(capability));
        }
        assert_eq!(Capability::from_name("teleport"), None);
    }

    #[tokio::test]
    async fn test_legacy_host_gets_fixed_subset() {
        let backend = Arc::new(FakeBackend::new());
        backend.caps("old", CapMode::Legacy);
        let negotiator = negotiator(&backend);

        // legacy hosts can modify auth
        negotiator
            .negotiate(
                &hosts(&["new", "old"]),
                &required_capabilities(&OpFeatures::ModifyAuth),
            )
            .await
            .unwrap();

        // but not resize
        let err = negotiator
            .negotiate(
                &hosts(&["new", "old"]),
                &required_capabilities(&OpFeatures::ModifySize),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BlockError::CapabilityMismatch { ref host, ref capability }
                if host == "old" && capability == "modify_size"
        ));
    }

    #[tokio::test]
    async fn test_missing_load_balance_selects_priority_path() {
        let backend = Arc::new(FakeBackend::new());
        backend.caps("h2", CapMode::Without(vec![Capability::CreateLoadBalance]));
        let negotiation = negotiator(&backend)
            .negotiate(
                &hosts(&["h1", "h2"]),
                &required_capabilities(&create_features(2, false)),
            )
            .await
            .unwrap();
        assert!(negotiation.load_balance_missing);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_version_check() {
        let backend = Arc::new(FakeBackend::new());
        backend.caps("h2", CapMode::Unreachable);
        let err = negotiator(&backend)
            .negotiate(&hosts(&["h1", "h2"]), &required_capabilities(&OpFeatures::Reload))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Version check failed"));
    }
}
