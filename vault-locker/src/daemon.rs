use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::Stream;
use tokio::sync::watch;
use vault_locker_core::bus::{Bus, Dispatcher, SealRequest, dispatch_requests};
use vault_locker_core::config::Config;
use vault_locker_core::dialog::dialog_from_config;
use vault_locker_core::duration::format_duration;
use vault_locker_core::listener::VaultListener;
use vault_locker_core::watcher::{AutoSealConfig, AutoSealWatcher};
use vault_locker_core::{Vault, VaultControl};

/// Runs the autoseal watcher and the bus listener until SIGINT/SIGTERM, then
/// seals the vault one last time.
pub async fn run(config: &Config, autoseal: AutoSealConfig) -> Result<()> {
    let vault: Arc<dyn VaultControl> = Arc::new(Vault::from_config(config));
    let watcher =
        AutoSealWatcher::new(Arc::clone(&vault), autoseal).context("invalid autoseal settings")?;

    if autoseal.poll_interval >= autoseal.duration {
        tracing::warn!(
            autoseal = %format_duration(autoseal.duration),
            poll_interval = %format_duration(autoseal.poll_interval),
            "poll interval is not shorter than the autoseal duration, sealing may be late"
        );
    }

    let bus = Bus::connect(&config.bus)
        .await
        .with_context(|| format!("cannot connect to the {:?} bus", config.bus.kind))?;
    let requests = bus
        .requests()
        .await
        .context("cannot subscribe to vault signals")?;

    let mut dispatcher = Dispatcher::new();
    dispatcher.subscribe(Arc::new(VaultListener::new(
        Arc::clone(&vault),
        dialog_from_config(&config.dialog),
    )));

    tracing::info!(
        listeners = dispatcher.len(),
        "daemon is running with an autoseal duration of {}",
        format_duration(autoseal.duration)
    );

    serve(vault, watcher, dispatcher, requests, shutdown_signal()).await
}

/// Drives both loops until `shutdown` resolves, waits for them to stop, then
/// performs the final seal.
async fn serve<S, F>(
    vault: Arc<dyn VaultControl>,
    watcher: AutoSealWatcher,
    dispatcher: Dispatcher,
    requests: S,
    shutdown: F,
) -> Result<()>
where
    S: Stream<Item = SealRequest> + Send + 'static,
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher_task = tokio::spawn(watcher.run(shutdown_rx.clone()));
    let bus_task = tokio::spawn(async move {
        if let Err(e) = dispatch_requests(requests, &dispatcher, shutdown_rx).await {
            tracing::warn!("bus listener exited: {e}");
        }
    });

    shutdown.await;
    tracing::info!("received shutdown signal, stopping");

    // Receivers may already be gone if both loops exited on their own.
    let _ = shutdown_tx.send(true);
    for (name, task) in [("autoseal watcher", watcher_task), ("bus listener", bus_task)] {
        if let Err(e) = task.await {
            tracing::warn!("{name} task failed: {e}");
        }
    }

    vault
        .seal()
        .await
        .context("unable to seal vault before quitting")?;
    tracing::info!("vault has been sealed before quitting");
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}
