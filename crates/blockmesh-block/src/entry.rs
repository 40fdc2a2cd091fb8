//! Block data objects and block enumeration

use crate::store::{StoreError, StoreResult, VolumeHandle};
use crate::{DATA_DIR, META_DIR};
use blockmesh_common::BlockName;
use tracing::{debug, info, warn};

fn data_path(gbid: &str) -> String {
    format!("{DATA_DIR}/{gbid}")
}

/// Create the data object of a block, sized and optionally zero-filled.
/// A partially created object is removed again on failure.
pub async fn create_entry(
    volume: &dyn VolumeHandle,
    gbid: &str,
    size: u64,
    prealloc: bool,
) -> StoreResult<()> {
    let path = data_path(gbid);
    volume.mkdir(DATA_DIR).await?;
    volume.create(&path, true).await?;

    let sized = async {
        volume.truncate(&path, size).await?;
        if prealloc {
            volume.zero_fill(&path, 0, size).await?;
        }
        Ok::<_, StoreError>(())
    }
    .await;

    if let Err(e) = &sized {
        warn!("Sizing {} on {} failed: {}", path, volume.name(), e);
        if let Err(e) = volume.unlink(&path).await {
            warn!("Failed to remove partial {}: {}", path, e);
        }
    } else {
        info!("Created data object {} ({} bytes, prealloc={})", path, size, prealloc);
    }
    sized
}

/// Remove the data object of a block, missing is fine
pub async fn delete_entry(volume: &dyn VolumeHandle, gbid: &str) -> StoreResult<()> {
    let path = data_path(gbid);
    match volume.unlink(&path).await {
        Ok(()) => {
            info!("Removed data object {}", path);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!("Data object {} already gone", path);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Resize the data object of a block
pub async fn resize_entry(volume: &dyn VolumeHandle, gbid: &str, size: u64) -> StoreResult<()> {
    let path = data_path(gbid);
    volume.truncate(&path, size).await?;
    info!("Resized data object {} to {} bytes", path, size);
    Ok(())
}

/// Check whether the data object of a block exists
pub async fn entry_exists(volume: &dyn VolumeHandle, gbid: &str) -> StoreResult<bool> {
    volume.exists(&data_path(gbid)).await
}

/// Names of all blocks with a journal in the volume
pub async fn list_blocks(volume: &dyn VolumeHandle) -> StoreResult<Vec<BlockName>> {
    let names = match volume.list_dir(META_DIR).await {
        Ok(names) => names,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(names
        .into_iter()
        .filter(|n| !n.starts_with('.'))
        .filter_map(|n| BlockName::new(n).ok())
        .collect())
}
