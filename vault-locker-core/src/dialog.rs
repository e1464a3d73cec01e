//! Desktop dialogs reporting seal/unseal outcomes.

use std::sync::Arc;

use crate::config::DialogConfig;
use crate::error::DialogError;
use crate::exec::{CommandRunner, SystemRunner};

#[async_trait::async_trait]
pub trait Dialog: Send + Sync {
    async fn show_error(&self, text: &str) -> Result<(), DialogError>;
    async fn show_info(&self, text: &str) -> Result<(), DialogError>;
}

/// zenity-compatible dialog program (`qarma` by default):
/// `<program> --error --text <text>`.
pub struct CommandDialog {
    program: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandDialog {
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    async fn show(&self, kind: &str, text: &str) -> Result<(), DialogError> {
        let args = vec![kind.to_string(), "--text".to_string(), text.to_string()];
        self.runner.run(&self.program, &args).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dialog for CommandDialog {
    async fn show_error(&self, text: &str) -> Result<(), DialogError> {
        self.show("--error", text).await
    }

    async fn show_info(&self, text: &str) -> Result<(), DialogError> {
        self.show("--info", text).await
    }
}

/// Headless setups: nothing is shown, outcomes only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDialog;

#[async_trait::async_trait]
impl Dialog for NoDialog {
    async fn show_error(&self, _text: &str) -> Result<(), DialogError> {
        Ok(())
    }

    async fn show_info(&self, _text: &str) -> Result<(), DialogError> {
        Ok(())
    }
}

pub fn dialog_from_config(config: &DialogConfig) -> Arc<dyn Dialog> {
    if config.enabled {
        Arc::new(CommandDialog::new(
            config.program.clone(),
            Arc::new(SystemRunner::new()),
        ))
    } else {
        Arc::new(NoDialog)
    }
}

/// Shows an error dialog; a failure to show it is logged and dropped.
pub async fn report_error(dialog: &dyn Dialog, text: &str) {
    if let Err(err) = dialog.show_error(text).await {
        tracing::warn!("{err}");
    }
}

/// Shows an info dialog; a failure to show it is logged and dropped.
pub async fn report_info(dialog: &dyn Dialog, text: &str) {
    if let Err(err) = dialog.show_info(text).await {
        tracing::warn!("{err}");
    }
}
