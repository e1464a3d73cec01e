//! Seal, unseal and query the vault.
//!
//! The vault keeps no state of its own: whether it is unsealed is read from
//! the mount metadata on every call, and every mutation goes through the
//! external tools via a [`CommandRunner`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, ToolsConfig};
use crate::error::{ExecError, VaultError};
use crate::exec::{CommandRunner, SystemRunner};
use crate::mount::{DeviceIdProbe, MountProbe};

/// cryptsetup exit code for "wrong device or file specified"; `close` uses it
/// when the mapping does not exist.
const CRYPTSETUP_EXIT_NO_DEVICE: i32 = 4;

/// Seal/unseal capability shared by the watcher, the bus listener and the CLI.
#[async_trait::async_trait]
pub trait VaultControl: Send + Sync {
    /// `Ok(false)` when the mountpoint is not a distinct mount; `Err` only
    /// when the mountpoint or its parent cannot be stat'ed.
    async fn is_unsealed(&self) -> Result<bool, VaultError>;

    /// Opens the encrypted mapping with the key file, then mounts it.
    ///
    /// When opening succeeds but mounting fails the mapping stays open.
    async fn unseal(&self) -> Result<(), VaultError>;

    /// Unmounts and closes the mapping. Succeeds on an already sealed vault.
    async fn seal(&self) -> Result<(), VaultError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    /// Device-mapper name passed to `cryptsetup open`/`close`.
    pub name: String,
    /// Raw encrypted block device.
    pub device: PathBuf,
    /// Decrypted device exposed once the mapping is open.
    pub mapper: PathBuf,
    pub mountpoint: PathBuf,
    pub key_file: PathBuf,
}

impl VaultPaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.vault.name.clone(),
            device: config.vault.device.clone(),
            mapper: config.vault.mapper_path(),
            mountpoint: config.vault.mountpoint.clone(),
            key_file: config.vault.key_file.clone(),
        }
    }
}

pub struct Vault {
    paths: VaultPaths,
    tools: ToolsConfig,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn MountProbe>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("paths", &self.paths)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Vault {
    pub fn new(
        paths: VaultPaths,
        tools: ToolsConfig,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn MountProbe>,
    ) -> Self {
        Self {
            paths,
            tools,
            runner,
            probe,
        }
    }

    /// Host vault: real commands, device-id mount detection.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            VaultPaths::from_config(config),
            config.tools.clone(),
            Arc::new(SystemRunner::new()),
            Arc::new(DeviceIdProbe),
        )
    }

    async fn open_mapping(&self) -> Result<(), ExecError> {
        let args = vec![
            "open".to_string(),
            path_arg(&self.paths.device),
            self.paths.name.clone(),
            format!("--key-file={}", self.paths.key_file.display()),
        ];
        self.runner.run(&self.tools.cryptsetup, &args).await
    }

    async fn close_mapping(&self) -> Result<(), ExecError> {
        let args = vec!["close".to_string(), self.paths.name.clone()];
        self.runner.run(&self.tools.cryptsetup, &args).await
    }

    async fn mount(&self) -> Result<(), ExecError> {
        let args = vec![path_arg(&self.paths.mapper), path_arg(&self.paths.mountpoint)];
        self.runner.run(&self.tools.mount, &args).await
    }

    async fn unmount(&self) -> Result<(), ExecError> {
        let args = vec![path_arg(&self.paths.mountpoint)];
        self.runner.run(&self.tools.umount, &args).await
    }
}

#[async_trait::async_trait]
impl VaultControl for Vault {
    async fn is_unsealed(&self) -> Result<bool, VaultError> {
        self.probe.is_mount_point(&self.paths.mountpoint).await
    }

    async fn unseal(&self) -> Result<(), VaultError> {
        // Other stat failures fall through and let cryptsetup report them.
        if let Ok(false) = tokio::fs::try_exists(&self.paths.device).await {
            return Err(VaultError::DeviceNotFound(self.paths.device.clone()));
        }

        self.open_mapping()
            .await
            .map_err(|err| VaultError::UnsealFailed {
                detail: err.to_string(),
            })?;
        tracing::debug!(mapper = %self.paths.mapper.display(), "encrypted mapping opened");

        self.mount().await.map_err(|err| VaultError::MountFailed {
            detail: format!(
                "{} on {}: {err}",
                self.paths.mapper.display(),
                self.paths.mountpoint.display()
            ),
        })?;
        Ok(())
    }

    async fn seal(&self) -> Result<(), VaultError> {
        match self.unmount().await {
            Ok(()) => {}
            Err(err) if is_not_mounted(&err) => {
                tracing::debug!(mountpoint = %self.paths.mountpoint.display(), "already unmounted");
            }
            Err(err) => {
                return Err(VaultError::UnmountFailed {
                    detail: err.to_string(),
                });
            }
        }

        match self.close_mapping().await {
            Ok(()) => Ok(()),
            Err(err) if is_mapping_inactive(&err) => {
                tracing::debug!(name = %self.paths.name, "mapping already closed");
                Ok(())
            }
            Err(err) => Err(VaultError::SealFailed {
                detail: err.to_string(),
            }),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// umount has no dedicated exit code for "not mounted" (32 covers every
/// failure), so this matches util-linux's message.
fn is_not_mounted(err: &ExecError) -> bool {
    err.stderr().is_some_and(|stderr| stderr.contains("not mounted"))
}

/// Exit code first; the message match covers builds that report a different
/// code for an inactive mapping.
fn is_mapping_inactive(err: &ExecError) -> bool {
    err.code() == Some(CRYPTSETUP_EXIT_NO_DEVICE)
        || err.stderr().is_some_and(|stderr| stderr.contains("is not active"))
}
