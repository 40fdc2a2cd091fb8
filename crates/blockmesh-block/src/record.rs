//! Journal lines and the block record rebuilt from them
//!
//! A journal is a sequence of `KEY: VALUE\n` lines. Replaying it from offset
//! zero folds the lines into a [`BlockRecord`]; later lines win, and every
//! value written for a host is kept in that host's history.

use crate::status::{EntryState, MetaKey, NodeState};
use blockmesh_common::BlockName;
use std::fmt;

/// One journal line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    /// Well-known key
    Meta(MetaKey, String),
    /// Host address with its new state
    Host(String, NodeState),
}

impl JournalEntry {
    pub fn meta(key: MetaKey, value: impl fmt::Display) -> Self {
        Self::Meta(key, value.to_string())
    }

    pub fn host(addr: impl Into<String>, state: NodeState) -> Self {
        Self::Host(addr.into(), state)
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(key, value) => write!(f, "{key}: {value}"),
            Self::Host(addr, state) => write!(f, "{addr}: {state}"),
        }
    }
}

/// Journal view of one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Host address
    pub addr: String,
    /// Last state written for the host
    pub status: NodeState,
    /// Every state written for the host, oldest first
    pub history: Vec<NodeState>,
}

impl NodeStatus {
    /// Size of the last successful resize on this host, if any
    #[must_use]
    pub fn last_resized(&self) -> Option<u64> {
        self.history.iter().rev().find_map(|state| match state {
            NodeState::ResizeSuccess(Some(size)) => Some(*size),
            _ => None,
        })
    }
}

/// State of a block reconstructed from its journal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRecord {
    pub volume: String,
    pub block: String,
    pub gbid: String,
    /// Current size in bytes
    pub size: u64,
    /// First size ever recorded
    pub initial_size: u64,
    /// Ring buffer size in MiB (0 when unset)
    pub rb_size: u32,
    /// Fixed block size in bytes (0 when unset)
    pub blk_size: u64,
    /// I/O timeout in seconds (0 when unset)
    pub io_timeout: u32,
    /// Multipath factor
    pub mpath: usize,
    pub prio_path: Option<String>,
    pub password: Option<String>,
    pub entry_create: Option<EntryState>,
    pub entry_delete: Option<EntryState>,
    /// Hosts in order of first appearance
    pub nodes: Vec<NodeStatus>,
}

impl BlockRecord {
    /// Fold a raw journal into a record.
    ///
    /// Total over any input: a trailing line without a newline is ignored,
    /// as are lines without a key separator and values that fail to parse.
    #[must_use]
    pub fn replay(block: &BlockName, data: &[u8]) -> Self {
        let mut record = Self {
            block: block.to_string(),
            ..Self::default()
        };

        let complete = match data.iter().rposition(|b| *b == b'\n') {
            Some(end) => &data[..=end],
            None => return record,
        };
        let text = String::from_utf8_lossy(complete);

        for line in text.lines() {
            let Some((key, value)) = split_line(line) else {
                continue;
            };
            match MetaKey::parse(key) {
                Some(meta) => record.apply_meta(meta, value),
                None => record.apply_host(key, NodeState::parse(value)),
            }
        }
        record
    }

    fn apply_meta(&mut self, key: MetaKey, value: &str) {
        match key {
            MetaKey::Volume => self.volume = value.to_string(),
            MetaKey::Gbid => self.gbid = value.to_string(),
            MetaKey::Size => {
                if let Ok(size) = value.parse() {
                    if self.initial_size == 0 {
                        self.initial_size = size;
                    }
                    self.size = size;
                }
            }
            MetaKey::Ha => {
                if let Ok(mpath) = value.parse() {
                    self.mpath = mpath;
                }
            }
            MetaKey::EntryCreate => {
                if let Some(state) = EntryState::parse(value) {
                    self.entry_create = Some(state);
                }
            }
            MetaKey::EntryDelete => {
                if let Some(state) = EntryState::parse(value) {
                    self.entry_delete = Some(state);
                }
            }
            MetaKey::Password => {
                self.password = (!value.is_empty()).then(|| value.to_string());
            }
            MetaKey::RingBuffer => {
                if let Ok(rb) = value.parse() {
                    self.rb_size = rb;
                }
            }
            MetaKey::BlkSize => {
                if let Ok(blk) = value.parse() {
                    self.blk_size = blk;
                }
            }
            MetaKey::IoTimeout => {
                if let Ok(timeout) = value.parse() {
                    self.io_timeout = timeout;
                }
            }
            MetaKey::PrioPath => {
                self.prio_path = (!value.is_empty()).then(|| value.to_string());
            }
        }
    }

    fn apply_host(&mut self, addr: &str, state: NodeState) {
        if addr.is_empty() {
            return;
        }
        match self.nodes.iter_mut().find(|n| n.addr == addr) {
            Some(node) => {
                node.history.push(state.clone());
                node.status = state;
            }
            None => self.nodes.push(NodeStatus {
                addr: addr.to_string(),
                status: state.clone(),
                history: vec![state],
            }),
        }
    }

    /// Block was fully created
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.entry_create == Some(EntryState::Success)
    }

    #[must_use]
    pub fn node(&self, addr: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.addr == addr)
    }

    /// Current state of a host, `None` if it never appeared
    #[must_use]
    pub fn status_of(&self, addr: &str) -> Option<&NodeState> {
        self.node(addr).map(|n| &n.status)
    }

    /// Hosts currently exposing the block
    #[must_use]
    pub fn configured_hosts(&self) -> Vec<String> {
        self.hosts_where(NodeState::is_configured)
    }

    /// Hosts whose current state matches `pred`, in journal order
    pub fn hosts_where(&self, pred: impl Fn(&NodeState) -> bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| pred(&n.status))
            .map(|n| n.addr.clone())
            .collect()
    }
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    if let Some((key, value)) = line.split_once(": ") {
        return Some((key.trim(), value.trim()));
    }
    line.strip_suffix(':').map(|key| (key.trim(), ""))
}
