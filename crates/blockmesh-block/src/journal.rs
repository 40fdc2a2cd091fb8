//! Per-block metadata journal
//!
//! Each block owns one append-only object under `block-meta/`. Its lock
//! lives in a separate object under `block-meta/.locks/` so that the journal
//! can be removed while the lock is still held.
//!
//! ```text
//! block-meta/
//! ├── <block>            VOLUME: vol\nGBID: ..\nENTRYCREATE: SUCCESS\n<host>: CONFIGSUCCESS\n...
//! └── .locks/
//!     └── <block>        flock target, never removed
//! ```

use crate::error::{BlockError, BlockResult};
use crate::record::{BlockRecord, JournalEntry};
use crate::store::{ObjectLock, VolumeHandle};
use crate::{LOCK_DIR, META_DIR};
use blockmesh_common::{BlockName, VolumeName};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Exclusive lock on one block's journal
#[derive(Debug)]
pub struct JournalLock(ObjectLock);

/// Append-only journal of one block
pub struct MetaJournal {
    volume: Arc<dyn VolumeHandle>,
    volume_name: VolumeName,
    block: BlockName,
    path: String,
    lock_path: String,
    /// Serializes appends issued by concurrent fan-out workers
    append_lock: tokio::sync::Mutex<()>,
}

impl MetaJournal {
    /// Bind to a block's journal without touching the store
    pub fn bind(volume: Arc<dyn VolumeHandle>, volume_name: VolumeName, block: BlockName) -> Self {
        Self {
            path: format!("{META_DIR}/{block}"),
            lock_path: format!("{LOCK_DIR}/{block}"),
            volume,
            volume_name,
            block,
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Bind to an existing journal
    pub async fn open(
        volume: Arc<dyn VolumeHandle>,
        volume_name: VolumeName,
        block: BlockName,
    ) -> BlockResult<Self> {
        let journal = Self::bind(volume, volume_name, block);
        if !journal.exists().await? {
            return Err(BlockError::not_found(&journal.volume_name, &journal.block));
        }
        Ok(journal)
    }

    pub fn block(&self) -> &BlockName {
        &self.block
    }

    pub fn volume_name(&self) -> &VolumeName {
        &self.volume_name
    }

    pub fn volume(&self) -> &Arc<dyn VolumeHandle> {
        &self.volume
    }

    pub async fn exists(&self) -> BlockResult<bool> {
        Ok(self.volume.exists(&self.path).await?)
    }

    /// Take the block's exclusive lock, waiting for any holder
    pub async fn lock(&self) -> BlockResult<JournalLock> {
        self.volume
            .mkdir(LOCK_DIR)
            .await
            .map_err(|e| BlockError::Lock(format!("{}: {e}", self.lock_path)))?;
        let lock = self
            .volume
            .lock(&self.lock_path)
            .await
            .map_err(|e| BlockError::Lock(format!("{}: {e}", self.lock_path)))?;
        debug!("Locked journal of {}/{}", self.volume_name, self.block);
        Ok(JournalLock(lock))
    }

    /// Release the lock. Failures are logged only.
    pub fn unlock(&self, lock: JournalLock) {
        match lock.0.release() {
            Ok(()) => debug!("Unlocked journal of {}/{}", self.volume_name, self.block),
            Err(e) => warn!(
                "Failed to unlock journal of {}/{}: {}",
                self.volume_name, self.block, e
            ),
        }
    }

    /// Append entries in a single write, returning the journal length after it
    pub async fn append(&self, entries: &[JournalEntry]) -> BlockResult<u64> {
        if entries.is_empty() {
            return Ok(self.volume.stat(&self.path).await.map_or(0, |s| s.size));
        }
        let mut buf = String::new();
        for entry in entries {
            let _ = writeln!(buf, "{entry}");
        }

        let _guard = self.append_lock.lock().await;
        self.volume.mkdir(META_DIR).await.map_err(|e| {
            BlockError::Journal(format!("{}: {e}", self.path))
        })?;
        let offset = self
            .volume
            .append(&self.path, buf.as_bytes())
            .await
            .map_err(|e| {
                BlockError::Journal(format!("append to {} failed: {e}", self.path))
            })?;
        debug!("Journal {} += {:?} (offset {})", self.path, buf.trim_end(), offset);
        Ok(offset)
    }

    /// Replay the journal
    pub async fn read(&self) -> BlockResult<BlockRecord> {
        let data = match self.volume.read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Err(BlockError::not_found(&self.volume_name, &self.block));
            }
            Err(e) => {
                return Err(BlockError::Journal(format!(
                    "read of {} failed: {e}",
                    self.path
                )));
            }
        };
        Ok(BlockRecord::replay(&self.block, &data))
    }

    /// Replay the journal, treating an uncommitted block as absent
    pub async fn read_committed(&self) -> BlockResult<BlockRecord> {
        let record = self.read().await?;
        if !record.is_committed() {
            return Err(BlockError::not_found(&self.volume_name, &self.block));
        }
        Ok(record)
    }

    /// Remove the journal object, a missing journal is fine
    pub async fn remove(&self) -> BlockResult<()> {
        match self.volume.unlink(&self.path).await {
            Ok(()) => {
                info!("Removed journal of {}/{}", self.volume_name, self.block);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(BlockError::Journal(format!(
                "remove of {} failed: {e}",
                self.path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{EntryState, MetaKey, NodeState};
    use crate::store::{LocalConnector, MemoryConnector, VolumeConnector};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn memory_journal() -> (Arc<MemoryConnector>, Arc<MetaJournal>) {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_volume("vol");
        let volume_name = VolumeName::new("vol").unwrap();
        let volume = connector.connect(&volume_name).await.unwrap();
        let journal = MetaJournal::bind(volume, volume_name, BlockName::new("blk").unwrap());
        (connector, Arc::new(journal))
    }

    #[tokio::test]
    async fn test_open_missing_journal() {
        let (connector, _) = memory_journal().await;
        let volume_name = VolumeName::new("vol").unwrap();
        let volume = connector.connect(&volume_name).await.unwrap();
        let result = MetaJournal::open(volume, volume_name, BlockName::new("nope").unwrap()).await;
        assert!(matches!(result, Err(BlockError::BlockNotFound { .. })));
    }

    #[tokio::test]
    async fn test_append_and_read_committed() {
        let (_, journal) = memory_journal().await;
        journal
            .append(&[
                JournalEntry::meta(MetaKey::Volume, "vol"),
                JournalEntry::meta(MetaKey::EntryCreate, EntryState::InProgress),
            ])
            .await
            .unwrap();
        assert!(matches!(
            journal.read_committed().await,
            Err(BlockError::BlockNotFound { .. })
        ));

        journal
            .append(&[
                JournalEntry::meta(MetaKey::EntryCreate, EntryState::Success),
                JournalEntry::host("h1", NodeState::ConfigSuccess),
            ])
            .await
            .unwrap();
        let record = journal.read_committed().await.unwrap();
        assert_eq!(record.configured_hosts(), vec!["h1"]);

        journal.remove().await.unwrap();
        journal.remove().await.unwrap();
        assert!(!journal.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_append_failure_is_reported() {
        let (connector, journal) = memory_journal().await;
        connector.volume("vol").unwrap().fail_writes("block-meta/blk");
        let result = journal
            .append(&[JournalEntry::meta(MetaKey::Ha, 1)])
            .await;
        assert!(matches!(result, Err(BlockError::Journal(_))));
    }

    #[tokio::test]
    async fn test_locked_writers_never_interleave() {
        let (_, journal) = memory_journal().await;

        let mut tasks = Vec::new();
        for writer in 0..2 {
            let journal = Arc::clone(&journal);
            tasks.push(tokio::spawn(async move {
                let lock = journal.lock().await.unwrap();
                let mut offsets = Vec::new();
                for line in 0..3 {
                    let entry = JournalEntry::host(format!("w{writer}"), NodeState::Unknown(format!("L{line}")));
                    offsets.push(journal.append(&[entry]).await.unwrap());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                journal.unlock(lock);
                offsets
            }));
        }

        let mut ranges = Vec::new();
        for task in tasks {
            let offsets = task.await.unwrap();
            ranges.push((offsets[0], offsets[2]));
        }
        ranges.sort_unstable();
        // the later writer's first line lands after the earlier writer's last
        assert!(ranges[1].0 > ranges[0].1);
    }

    #[tokio::test]
    async fn test_journal_on_local_store() {
        let dir = tempdir().unwrap();
        let connector = LocalConnector::new(dir.path());
        let volume_name = VolumeName::new("vol").unwrap();
        connector.create_volume(&volume_name).await.unwrap();
        let volume = connector.connect(&volume_name).await.unwrap();
        let journal = MetaJournal::bind(volume, volume_name, BlockName::new("blk").unwrap());

        let lock = journal.lock().await.unwrap();
        journal
            .append(&[
                JournalEntry::meta(MetaKey::Gbid, "g-1"),
                JournalEntry::meta(MetaKey::EntryCreate, EntryState::Success),
            ])
            .await
            .unwrap();
        journal.remove().await.unwrap();
        journal.unlock(lock);

        assert!(dir.path().join("vol/block-meta/.locks/blk").exists());
        assert!(!dir.path().join("vol/block-meta/blk").exists());
    }
}
