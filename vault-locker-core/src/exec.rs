//! Runs the external privileged tools (cryptsetup, mount, umount, dialogs).

use std::process::Stdio;

use crate::error::ExecError;

/// Runs one external command to completion.
///
/// Implementations capture stderr and must keep the two failure kinds apart:
/// a process that ran and exited non-zero is [`ExecError::Failed`], a process
/// that could not be started is [`ExecError::Spawn`].
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), ExecError>;
}

/// Runs commands on the host with `tokio::process`.
///
/// No timeout is applied: a hung tool hangs the caller.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), ExecError> {
        tracing::debug!(program, ?args, "running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            // Keep tool messages in English; the seal tolerance checks match on them.
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(ExecError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: normalize_stderr(&output.stderr),
        })
    }
}

/// Lossy-decodes stderr and strips surrounding whitespace and newlines.
pub fn normalize_stderr(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}
