//! Lifecycle requests
//!
//! Every request is validated before any journal is touched.

use crate::RING_BUFFER_MAX_MIB;
use crate::capability::OpFeatures;
use crate::error::{BlockError, BlockResult};
use blockmesh_common::{BlockName, VolumeName};
use serde::{Deserialize, Serialize};

/// Create a block exposed by `mpath` hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    /// Candidate hosts, the first `mpath` are tried first
    pub hosts: Vec<String>,
    pub mpath: usize,
    /// Size in bytes
    pub size: u64,
    pub auth: bool,
    pub prealloc: bool,
    /// Ring buffer in MiB
    pub ring_buffer: Option<u32>,
    /// Fixed block size in bytes
    pub block_size: Option<u64>,
    /// Device I/O timeout in seconds
    pub io_timeout: Option<u32>,
}

impl CreateRequest {
    pub fn validate(&mut self) -> BlockResult<()> {
        let mut seen = Vec::with_capacity(self.hosts.len());
        for host in self.hosts.drain(..) {
            let host = host.trim().to_string();
            if !host.is_empty() && !seen.contains(&host) {
                seen.push(host);
            }
        }
        self.hosts = seen;

        if self.hosts.is_empty() {
            return Err(BlockError::InvalidRequest("no hosts given".into()));
        }
        if self.mpath == 0 {
            return Err(BlockError::InvalidRequest(
                "multipath count must be at least 1".into(),
            ));
        }
        if self.mpath > self.hosts.len() {
            return Err(BlockError::MultipathExceedsHosts {
                mpath: self.mpath,
                hosts: self.hosts.len(),
            });
        }
        if self.size == 0 {
            return Err(BlockError::InvalidSize("size must be greater than zero".into()));
        }
        if let Some(blk) = self.block_size {
            if blk == 0 || blk % 512 != 0 {
                return Err(BlockError::InvalidSize(format!(
                    "block size {blk} is not a multiple of 512"
                )));
            }
            if self.size % blk != 0 {
                return Err(BlockError::InvalidSize(format!(
                    "size {} is not a multiple of block size {blk}",
                    self.size
                )));
            }
        }
        if let Some(rb) = self.ring_buffer
            && !(1..=RING_BUFFER_MAX_MIB).contains(&rb)
        {
            return Err(BlockError::InvalidRequest(format!(
                "ring buffer must be between 1 and {RING_BUFFER_MAX_MIB} MiB, got {rb}"
            )));
        }
        if self.io_timeout == Some(0) {
            return Err(BlockError::InvalidRequest(
                "io timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn features(&self) -> OpFeatures {
        OpFeatures::Create {
            mpath: self.mpath,
            prealloc: self.prealloc,
            auth: self.auth,
            ring_buffer: self.ring_buffer.is_some(),
            block_size: self.block_size.is_some(),
            io_timeout: self.io_timeout.is_some(),
        }
    }
}

/// Delete a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    /// Remove the block even if some hosts could not be cleaned up
    pub force: bool,
    /// Remove the data object; when false only the metadata goes
    pub unlink: bool,
}

/// Enable or disable authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyAuthRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    pub enable: bool,
}

/// Resize a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifySizeRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    pub size: u64,
    /// Allow shrinking
    pub force: bool,
}

impl ModifySizeRequest {
    pub fn validate(&self) -> BlockResult<()> {
        if self.size == 0 {
            return Err(BlockError::InvalidSize("size must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Move a block from one host to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    pub old_node: String,
    pub new_node: String,
    /// Tolerate an unreachable old node
    pub force: bool,
}

impl ReplaceRequest {
    pub fn validate(&self) -> BlockResult<()> {
        if self.old_node.trim().is_empty() || self.new_node.trim().is_empty() {
            return Err(BlockError::InvalidRequest("node address missing".into()));
        }
        if self.old_node == self.new_node {
            return Err(BlockError::InvalidRequest(format!(
                "old and new node are both {}",
                self.old_node
            )));
        }
        Ok(())
    }
}

/// Re-apply the target configuration of a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadRequest {
    pub volume: VolumeName,
    pub block: BlockName,
    /// Report success even if some hosts fail
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(hosts: &[&str], mpath: usize) -> CreateRequest {
        CreateRequest {
            volume: VolumeName::new("vol").unwrap(),
            block: BlockName::new("blk").unwrap(),
            hosts: hosts.iter().map(|h| (*h).to_string()).collect(),
            mpath,
            size: 1 << 20,
            auth: false,
            prealloc: false,
            ring_buffer: None,
            block_size: None,
            io_timeout: None,
        }
    }

    #[test]
    fn test_create_dedups_hosts() {
        let mut req = create(&["h1", " h2", "h1", ""], 2);
        req.validate().unwrap();
        assert_eq!(req.hosts, vec!["h1", "h2"]);
    }

    #[test]
    fn test_create_rejects_mpath_over_hosts() {
        let mut req = create(&["h1", "h1"], 2);
        assert!(matches!(
            req.validate(),
            Err(BlockError::MultipathExceedsHosts { mpath: 2, hosts: 1 })
        ));
    }

    #[test]
    fn test_create_rejects_bad_options() {
        let mut req = create(&["h1"], 1);
        req.block_size = Some(4096);
        req.size = 4096 * 3 + 512;
        assert!(matches!(req.validate(), Err(BlockError::InvalidSize(_))));

        let mut req = create(&["h1"], 1);
        req.ring_buffer = Some(2048);
        assert!(matches!(req.validate(), Err(BlockError::InvalidRequest(_))));
    }

    #[test]
    fn test_replace_rejects_same_node() {
        let req = ReplaceRequest {
            volume: VolumeName::new("vol").unwrap(),
            block: BlockName::new("blk").unwrap(),
            old_node: "h1".into(),
            new_node: "h1".into(),
            force: false,
        };
        assert!(req.validate().is_err());
    }
}
