//! Seal/unseal with user feedback, shared by the CLI commands and the bus
//! handler.

use std::sync::Arc;

use crate::bus::SealListener;
use crate::dialog::{Dialog, report_error, report_info};
use crate::error::VaultError;
use crate::vault::VaultControl;

pub async fn seal_and_report(vault: &dyn VaultControl, dialog: &dyn Dialog) -> Result<(), VaultError> {
    match vault.seal().await {
        Ok(()) => {
            tracing::info!("vault has been sealed");
            report_info(dialog, "vault is sealed!").await;
            Ok(())
        }
        Err(err) => {
            tracing::error!("{err}");
            report_error(dialog, &err.to_string()).await;
            Err(err)
        }
    }
}

pub async fn unseal_and_report(
    vault: &dyn VaultControl,
    dialog: &dyn Dialog,
) -> Result<(), VaultError> {
    match vault.unseal().await {
        Ok(()) => {
            tracing::info!("vault has been unsealed");
            report_info(dialog, "vault is unsealed!").await;
            Ok(())
        }
        Err(err) => {
            tracing::error!("{err}");
            report_error(dialog, &err.to_string()).await;
            Err(err)
        }
    }
}

/// The bus handler the daemon registers: bus requests drive the vault.
pub struct VaultListener {
    vault: Arc<dyn VaultControl>,
    dialog: Arc<dyn Dialog>,
}

impl VaultListener {
    pub fn new(vault: Arc<dyn VaultControl>, dialog: Arc<dyn Dialog>) -> Self {
        Self { vault, dialog }
    }
}

#[async_trait::async_trait]
impl SealListener for VaultListener {
    async fn on_seal(&self) {
        // Already logged and shown.
        let _ = seal_and_report(self.vault.as_ref(), self.dialog.as_ref()).await;
    }

    async fn on_unseal(&self) {
        let _ = unseal_and_report(self.vault.as_ref(), self.dialog.as_ref()).await;
    }
}
