//! Error types shared by the vault, executor and dialog layers.

use std::path::PathBuf;

/// Failure of an external command run through a [`crate::exec::CommandRunner`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process ran and exited unsuccessfully.
    #[error("{stderr}")]
    Failed {
        program: String,
        /// `None` when the process was killed by a signal.
        code: Option<i32>,
        /// Captured stderr with surrounding whitespace trimmed.
        stderr: String,
    },

    /// The process could not be started at all.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Exit code of a process that ran, if it exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            Self::Spawn { .. } => None,
        }
    }

    /// Normalized stderr of a process that ran.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            Self::Spawn { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("device {} does not exist", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("unable to unseal vault: {detail}")]
    UnsealFailed { detail: String },

    #[error("unable to mount vault: {detail}")]
    MountFailed { detail: String },

    #[error("unable to unmount vault: {detail}")]
    UnmountFailed { detail: String },

    #[error("unable to seal vault: {detail}")]
    SealFailed { detail: String },

    #[error("stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A dialog could not be shown. Never fatal: callers log it and move on.
#[derive(Debug, thiserror::Error)]
#[error("unable to show dialog: {0}")]
pub struct DialogError(#[from] pub ExecError);
