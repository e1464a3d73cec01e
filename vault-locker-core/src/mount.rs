//! Mount detection for the vault mountpoint.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::VaultError;

/// Answers whether a path currently has a filesystem mounted on it.
#[async_trait::async_trait]
pub trait MountProbe: Send + Sync {
    async fn is_mount_point(&self, path: &Path) -> Result<bool, VaultError>;
}

/// Compares the device id of a path with the device id of its parent.
///
/// A differing id means something is mounted there. Bind mounts of a
/// directory from the same filesystem share the parent's device id and are
/// reported as not mounted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceIdProbe;

#[async_trait::async_trait]
impl MountProbe for DeviceIdProbe {
    async fn is_mount_point(&self, path: &Path) -> Result<bool, VaultError> {
        let dev = lstat_dev(path).await?;
        let parent_dev = lstat_dev(&parent_of(path)).await?;
        Ok(dev != parent_dev)
    }
}

async fn lstat_dev(path: &Path) -> Result<u64, VaultError> {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|meta| meta.dev())
        .map_err(|source| VaultError::Stat {
            path: path.to_path_buf(),
            source,
        })
}

/// Lexical parent: `/` for `/`, `.` for a bare relative name.
fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => path.to_path_buf(),
    }
}
