//! Lifecycle of a LUKS-encrypted vault: seal, unseal, query, an autoseal
//! watcher and a D-Bus front door.

pub mod bus;
pub mod config;
pub mod dialog;
pub mod duration;
pub mod error;
pub mod exec;
pub mod listener;
pub mod mount;
pub mod vault;
pub mod watcher;

pub use config::Config;
pub use error::{DialogError, ExecError, VaultError};
pub use vault::{Vault, VaultControl, VaultPaths};
