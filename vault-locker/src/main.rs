mod daemon;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use vault_locker_core::bus::{self, SealRequest};
use vault_locker_core::config::{Config, DEFAULT_CONFIG_PATH};
use vault_locker_core::dialog::dialog_from_config;
use vault_locker_core::duration::parse_duration;
use vault_locker_core::listener::{seal_and_report, unseal_and_report};
use vault_locker_core::watcher::AutoSealConfig;
use vault_locker_core::{Vault, VaultControl};

/// Exit code of `unsealed` when the mount state cannot be read.
const EXIT_QUERY_FAILED: u8 = 2;

/// vault-locker: lock and unlock a secure vault.
#[derive(Debug, Parser)]
#[command(name = "vault-locker", version, about)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Unseal the vault.
    Unseal,
    /// Seal the vault.
    Seal,
    /// Exit 0 if the vault is unsealed, 1 if it is sealed.
    Unsealed,
    /// Run the autoseal watcher and the D-Bus listener.
    Daemon {
        /// Time before an unsealed vault is sealed again (e.g. `60s`, `5m`).
        #[arg(long, value_parser = parse_duration)]
        autoseal_duration: Option<Duration>,
        /// How often the mount state is sampled.
        #[arg(long, value_parser = parse_duration)]
        poll_interval: Option<Duration>,
    },
    /// Ask a running daemon to seal or unseal over D-Bus.
    Signal {
        #[arg(value_enum)]
        request: RequestArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RequestArg {
    Seal,
    Unseal,
}

impl From<RequestArg> for SealRequest {
    fn from(arg: RequestArg) -> Self {
        match arg {
            RequestArg::Seal => SealRequest::Seal,
            RequestArg::Unseal => SealRequest::Unseal,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Unseal => {
            let vault = Vault::from_config(&config);
            let dialog = dialog_from_config(&config.dialog);
            Ok(exit_code(unseal_and_report(&vault, dialog.as_ref()).await.is_ok()))
        }
        Command::Seal => {
            let vault = Vault::from_config(&config);
            let dialog = dialog_from_config(&config.dialog);
            Ok(exit_code(seal_and_report(&vault, dialog.as_ref()).await.is_ok()))
        }
        Command::Unsealed => match Vault::from_config(&config).is_unsealed().await {
            Ok(unsealed) => Ok(exit_code(unsealed)),
            Err(err) => {
                tracing::error!("unable to verify if vault is unsealed: {err}");
                Ok(ExitCode::from(EXIT_QUERY_FAILED))
            }
        },
        Command::Daemon {
            autoseal_duration,
            poll_interval,
        } => {
            let autoseal = AutoSealConfig {
                duration: autoseal_duration.unwrap_or_else(|| config.autoseal.duration()),
                poll_interval: poll_interval.unwrap_or_else(|| config.autoseal.poll_interval()),
            };
            daemon::run(&config, autoseal).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Signal { request } => {
            let request = SealRequest::from(request);
            bus::emit_request(&config.bus, request)
                .await
                .with_context(|| format!("cannot send {} signal", request.member()))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
