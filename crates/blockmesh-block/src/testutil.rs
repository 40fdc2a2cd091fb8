//! Scripted backend and store fixtures shared by the test modules

use crate::backend::{
    BackendError, BackendReply, BlockPayload, CapabilityReply, EXIT_DEFAULT_ERROR, OpKind,
    TargetBackend,
};
use crate::cache::VolumeHandleCache;
use crate::capability::Capability;
use crate::executor::RemoteOpExecutor;
use crate::journal::MetaJournal;
use crate::orchestrator::{BlockOrchestrator, OrchestratorSettings};
use crate::request::CreateRequest;
use crate::store::{MemoryConnector, VolumeConnector};
use async_trait::async_trait;
use blockmesh_common::{BlockName, VolumeName};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// How a host answers capability queries
#[derive(Debug, Clone)]
pub enum CapMode {
    Full,
    Legacy,
    Without(Vec<Capability>),
    Unreachable,
}

#[derive(Debug, Clone)]
struct HostScript {
    caps: CapMode,
    exits: HashMap<OpKind, i32>,
    unreachable: bool,
    delay: Option<Duration>,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            caps: CapMode::Full,
            exits: HashMap::new(),
            unreachable: false,
            delay: None,
        }
    }
}

/// Target backend whose behaviour is scripted per host
#[derive(Default)]
pub struct FakeBackend {
    hosts: Mutex<HashMap<String, HostScript>>,
    calls: Mutex<Vec<(String, OpKind, BlockPayload)>>,
    queried: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, host: &str, f: impl FnOnce(&mut HostScript)) {
        f(self.hosts.lock().entry(host.to_string()).or_default());
    }

    pub fn caps(&self, host: &str, mode: CapMode) {
        self.script(host, |s| s.caps = mode);
    }

    pub fn fail(&self, host: &str, op: OpKind) {
        self.exit(host, op, EXIT_DEFAULT_ERROR);
    }

    pub fn exit(&self, host: &str, op: OpKind, code: i32) {
        self.script(host, |s| {
            s.exits.insert(op, code);
        });
    }

    pub fn heal(&self, host: &str) {
        self.script(host, |s| {
            s.exits.clear();
            s.unreachable = false;
        });
    }

    pub fn unreachable(&self, host: &str) {
        self.script(host, |s| s.unreachable = true);
    }

    pub fn delay(&self, host: &str, delay: Duration) {
        self.script(host, |s| s.delay = Some(delay));
    }

    /// Every invocation as (host, op)
    pub fn calls(&self) -> Vec<(String, OpKind)> {
        self.calls
            .lock()
            .iter()
            .map(|(h, op, _)| (h.clone(), *op))
            .collect()
    }

    /// Hosts that received `op`, sorted
    pub fn hosts_for(&self, op: OpKind) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .calls
            .lock()
            .iter()
            .filter(|(_, o, _)| *o == op)
            .map(|(h, _, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Payload of the last `op` sent to `host`
    pub fn payload(&self, host: &str, op: OpKind) -> Option<BlockPayload> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(h, o, _)| h == host && *o == op)
            .map(|(_, _, p)| p.clone())
    }

    pub fn queried(&self) -> HashSet<String> {
        self.queried.lock().iter().cloned().collect()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
        self.queried.lock().clear();
    }
}

#[async_trait]
impl TargetBackend for FakeBackend {
    async fn invoke(
        &self,
        host: &str,
        op: OpKind,
        payload: &BlockPayload,
    ) -> Result<BackendReply, BackendError> {
        self.calls
            .lock()
            .push((host.to_string(), op, payload.clone()));
        let script = self.hosts.lock().get(host).cloned().unwrap_or_default();
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if script.unreachable {
            return Err(BackendError::Unreachable {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let exit = script.exits.get(&op).copied().unwrap_or(0);
        let output = if op == OpKind::Create && exit == 0 {
            format!(
                "IQN: iqn.test:{}\nPORTAL(S): {host}:3260\nBACKEND: fake\nRESULT: SUCCESS\n",
                payload.gbid
            )
        } else if exit == 0 {
            "RESULT: SUCCESS\n".to_string()
        } else {
            format!("{op} failed on {host}\nRESULT: FAIL\n")
        };
        Ok(BackendReply { exit, output })
    }

    async fn capabilities(&self, host: &str) -> Result<CapabilityReply, BackendError> {
        self.queried.lock().push(host.to_string());
        let script = self.hosts.lock().get(host).cloned().unwrap_or_default();
        if script.unreachable {
            return Err(BackendError::Unreachable {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let without = match script.caps {
            CapMode::Full => Vec::new(),
            CapMode::Without(caps) => caps,
            CapMode::Legacy => return Ok(CapabilityReply::Unsupported),
            CapMode::Unreachable => {
                return Err(BackendError::Unreachable {
                    host: host.to_string(),
                    reason: "no route to host".to_string(),
                });
            }
        };
        let map: BTreeMap<String, bool> = Capability::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), !without.contains(c)))
            .collect();
        Ok(CapabilityReply::Supported(map))
    }
}

/// A journal for `block` on a fresh in-memory volume named `vol`
pub async fn memory_journal(block: &str) -> (Arc<MemoryConnector>, MetaJournal) {
    let connector = Arc::new(MemoryConnector::new());
    connector.add_volume("vol");
    let volume_name = VolumeName::new("vol").unwrap();
    let volume = connector.connect(&volume_name).await.unwrap();
    let journal = MetaJournal::bind(volume, volume_name, BlockName::new(block).unwrap());
    (connector, journal)
}

/// Orchestrator over an in-memory volume `vol` and a scripted backend
pub struct Harness {
    pub connector: Arc<MemoryConnector>,
    pub backend: Arc<FakeBackend>,
    pub orchestrator: BlockOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(timeout, 5)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self::build(Duration::from_secs(5), capacity)
    }

    fn build(timeout: Duration, capacity: usize) -> Self {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_volume("vol");
        let backend = Arc::new(FakeBackend::new());
        let cache = Arc::new(VolumeHandleCache::new(connector.clone(), capacity));
        let executor = Arc::new(RemoteOpExecutor::new(
            backend.clone(),
            timeout,
            Duration::from_secs(5),
        ));
        let orchestrator = BlockOrchestrator::new(
            cache,
            executor,
            OrchestratorSettings {
                iqn_prefix: "iqn.2016-12.org.blockmesh".to_string(),
                portal_port: 3260,
            },
        );
        Self {
            connector,
            backend,
            orchestrator,
        }
    }

    pub async fn journal(&self, block: &str) -> MetaJournal {
        let volume_name = VolumeName::new("vol").unwrap();
        let volume = self.connector.connect(&volume_name).await.unwrap();
        MetaJournal::bind(volume, volume_name, BlockName::new(block).unwrap())
    }

    /// Raw journal text of `block`
    pub fn journal_text(&self, block: &str) -> Option<String> {
        self.connector
            .volume("vol")
            .unwrap()
            .contents(&format!("block-meta/{block}"))
            .map(|data| String::from_utf8(data).unwrap())
    }

    pub fn data_exists(&self, gbid: &str) -> bool {
        self.connector
            .volume("vol")
            .unwrap()
            .contents(&format!("block-store/{gbid}"))
            .is_some()
    }
}

pub fn hosts(list: &[&str]) -> Vec<String> {
    list.iter().map(|h| (*h).to_string()).collect()
}

/// Plain 1 MiB create request on volume `vol`
pub fn create_req(block: &str, hosts_list: &[&str], mpath: usize) -> CreateRequest {
    CreateRequest {
        volume: VolumeName::new("vol").unwrap(),
        block: BlockName::new(block).unwrap(),
        hosts: hosts(hosts_list),
        mpath,
        size: 1 << 20,
        auth: false,
        prealloc: false,
        ring_buffer: None,
        block_size: None,
        io_timeout: None,
    }
}
