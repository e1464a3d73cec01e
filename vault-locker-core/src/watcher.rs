//! Autoseal watcher.
//!
//! Mount state changes are not delivered as events, so the watcher samples
//! [`VaultControl::is_unsealed`] on a fixed interval and keeps a single
//! one-shot deadline:
//!
//! ```text
//!            unsealed observed
//!   Idle ─────────────────────────► Armed(deadline)
//!    ▲  ◄───────────────────────────   │
//!    │        sealed observed          │ deadline reached:
//!    └─────────────────────────────────┘ re-check, seal if still unsealed
//! ```
//!
//! Every error is logged and the loop carries on; only the shutdown channel
//! stops it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::duration::format_duration;
use crate::error::VaultError;
use crate::vault::VaultControl;

pub const DEFAULT_AUTOSEAL_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Timing of the watcher. The poll interval must be non-zero and should be
/// well below the autoseal duration; only the former is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSealConfig {
    pub duration: Duration,
    pub poll_interval: Duration,
}

impl Default for AutoSealConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_AUTOSEAL_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Per-tick failures are logged, never propagated; only construction fails.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("unable to verify if vault is unsealed: {0}")]
    QueryFailed(#[source] VaultError),
    #[error("unable to auto-seal vault: {0}")]
    AutoSealFailed(#[source] VaultError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed { deadline: Instant },
}

/// Result of feeding one poll observation to [`AutoSealTimer::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Armed(Instant),
    Disarmed,
}

/// The watcher's state machine, free of any I/O.
#[derive(Debug, Clone)]
pub struct AutoSealTimer {
    duration: Duration,
    state: TimerState,
}

impl AutoSealTimer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            state: TimerState::Idle,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimerState::Armed { deadline } => Some(deadline),
            TimerState::Idle => None,
        }
    }

    /// Applies a poll result. Only the two edges change state; a steady
    /// unsealed vault never pushes the deadline back.
    pub fn observe(&mut self, unsealed: bool, now: Instant) -> Transition {
        match (self.state, unsealed) {
            (TimerState::Idle, true) => {
                let deadline = now + self.duration;
                self.state = TimerState::Armed { deadline };
                Transition::Armed(deadline)
            }
            (TimerState::Armed { .. }, false) => {
                self.state = TimerState::Idle;
                Transition::Disarmed
            }
            _ => Transition::Unchanged,
        }
    }

    /// Back to idle after the deadline has been handled.
    pub fn disarm(&mut self) {
        self.state = TimerState::Idle;
    }

    /// Keeps the timer armed but moves the deadline. No-op when idle.
    pub fn postpone(&mut self, until: Instant) {
        if self.is_armed() {
            self.state = TimerState::Armed { deadline: until };
        }
    }
}

pub struct AutoSealWatcher {
    vault: Arc<dyn VaultControl>,
    config: AutoSealConfig,
}

impl AutoSealWatcher {
    /// Fails on a zero poll interval, which the ticker cannot run with.
    pub fn new(
        vault: Arc<dyn VaultControl>,
        config: AutoSealConfig,
    ) -> Result<Self, WatcherError> {
        if config.poll_interval.is_zero() {
            return Err(WatcherError::ZeroPollInterval);
        }
        Ok(Self { vault, config })
    }

    /// Runs until `shutdown` turns `true` or its sender is dropped.
    ///
    /// An operation already in progress when shutdown arrives runs to
    /// completion first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = AutoSealTimer::new(self.config.duration);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            autoseal = %format_duration(self.config.duration),
            poll_interval = %format_duration(self.config.poll_interval),
            "autoseal watcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let deadline = timer.deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.poll(&mut timer).await,
                _ = sleep_until_deadline(deadline) => self.expire(&mut timer).await,
            }
        }

        tracing::info!("autoseal watcher stopped");
    }

    async fn poll(&self, timer: &mut AutoSealTimer) {
        let unsealed = match self.vault.is_unsealed().await {
            Ok(unsealed) => unsealed,
            Err(err) => {
                tracing::warn!("{}", WatcherError::QueryFailed(err));
                return;
            }
        };

        match timer.observe(unsealed, Instant::now()) {
            Transition::Armed(_) => tracing::info!(
                "unsealed vault detected, autoseal will happen in {}",
                format_duration(self.config.duration)
            ),
            Transition::Disarmed => tracing::info!("vault has been sealed manually"),
            Transition::Unchanged => {}
        }
    }

    async fn expire(&self, timer: &mut AutoSealTimer) {
        match self.vault.is_unsealed().await {
            Ok(true) => {
                match self.vault.seal().await {
                    Ok(()) => tracing::info!("vault has been auto-sealed"),
                    Err(err) => tracing::error!("{}", WatcherError::AutoSealFailed(err)),
                }
                timer.disarm();
            }
            Ok(false) => {
                tracing::debug!("autoseal deadline reached on an already sealed vault");
                timer.disarm();
            }
            Err(err) => {
                // Deadline already consumed: stay armed and look again next interval.
                tracing::warn!("{}", WatcherError::QueryFailed(err));
                timer.postpone(Instant::now() + self.config.poll_interval);
            }
        }
    }
}

/// Sleeps until `deadline`, or forever when no timer is armed (disables the
/// `select!` branch).
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// In-memory vault. `seal` flips the state; `queries` can inject failures.
    #[derive(Default)]
    struct FakeVault {
        unsealed: AtomicBool,
        seals: AtomicUsize,
        queries: AtomicUsize,
        fail_seal: AtomicBool,
        query_failures: Mutex<VecDeque<bool>>,
    }

    impl FakeVault {
        fn unsealed() -> Arc<Self> {
            let vault = Self::default();
            vault.unsealed.store(true, Ordering::SeqCst);
            Arc::new(vault)
        }

        fn set_unsealed(&self, value: bool) {
            self.unsealed.store(value, Ordering::SeqCst);
        }

        fn seals(&self) -> usize {
            self.seals.load(Ordering::SeqCst)
        }

        /// Next queries fail while the queued values are `true`.
        fn fail_next_queries(&self, count: usize) {
            let mut queue = self.query_failures.lock().unwrap();
            queue.extend(std::iter::repeat_n(true, count));
        }
    }

    #[async_trait::async_trait]
    impl VaultControl for FakeVault {
        async fn is_unsealed(&self) -> Result<bool, VaultError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.query_failures.lock().unwrap().pop_front() == Some(true) {
                return Err(VaultError::Stat {
                    path: PathBuf::from("/vault"),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(self.unsealed.load(Ordering::SeqCst))
        }

        async fn unseal(&self) -> Result<(), VaultError> {
            self.set_unsealed(true);
            Ok(())
        }

        async fn seal(&self) -> Result<(), VaultError> {
            self.seals.fetch_add(1, Ordering::SeqCst);
            if self.fail_seal.load(Ordering::SeqCst) {
                return Err(VaultError::SealFailed {
                    detail: "Device vault is still in use.".to_string(),
                });
            }
            self.set_unsealed(false);
            Ok(())
        }
    }

    struct Running {
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Running {
        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            self.handle.await.unwrap();
        }
    }

    fn spawn_watcher(vault: Arc<FakeVault>, duration: Duration, poll: Duration) -> Running {
        let (shutdown, rx) = watch::channel(false);
        let watcher = AutoSealWatcher::new(
            vault,
            AutoSealConfig {
                duration,
                poll_interval: poll,
            },
        )
        .unwrap();
        let handle = tokio::spawn(watcher.run(rx));
        Running { shutdown, handle }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn observation_sequence_arms_and_disarms_on_edges() {
        let start = Instant::now();
        let mut timer = AutoSealTimer::new(secs(60));

        let observations = [false, true, true, false, true];
        let transitions: Vec<Transition> = observations
            .iter()
            .enumerate()
            .map(|(i, &unsealed)| timer.observe(unsealed, start + secs(5 * i as u64)))
            .collect();

        assert_eq!(
            transitions,
            vec![
                Transition::Unchanged,
                Transition::Armed(start + secs(5 + 60)),
                Transition::Unchanged,
                Transition::Disarmed,
                Transition::Armed(start + secs(20 + 60)),
            ]
        );
        assert_eq!(timer.deadline(), Some(start + secs(80)));
    }

    #[test]
    fn steady_unsealed_keeps_first_deadline() {
        let start = Instant::now();
        let mut timer = AutoSealTimer::new(secs(60));
        timer.observe(true, start);
        for i in 1..10 {
            assert_eq!(timer.observe(true, start + secs(i)), Transition::Unchanged);
        }
        assert_eq!(timer.deadline(), Some(start + secs(60)));
    }

    #[test]
    fn postpone_only_applies_when_armed() {
        let start = Instant::now();
        let mut timer = AutoSealTimer::new(secs(60));

        timer.postpone(start + secs(5));
        assert!(!timer.is_armed());
        assert_eq!(timer.deadline(), None);

        timer.observe(true, start);
        timer.postpone(start + secs(65));
        assert_eq!(timer.deadline(), Some(start + secs(65)));

        timer.disarm();
        assert!(!timer.is_armed());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let settings: crate::config::Config =
            toml::from_str("[autoseal]\npoll_interval_secs = 0\n").unwrap();
        let config = AutoSealConfig {
            duration: settings.autoseal.duration(),
            poll_interval: settings.autoseal.poll_interval(),
        };

        let result = AutoSealWatcher::new(FakeVault::unsealed(), config);
        assert!(matches!(result, Err(WatcherError::ZeroPollInterval)));
    }

    #[test]
    fn zero_duration_is_accepted() {
        let config = AutoSealConfig {
            duration: Duration::ZERO,
            poll_interval: secs(1),
        };
        assert!(AutoSealWatcher::new(FakeVault::unsealed(), config).is_ok());
    }

    // -----------------------------------------------------------------------
    // Run loop (paused clock)
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn seals_once_after_duration() {
        let vault = FakeVault::unsealed();
        let running = spawn_watcher(Arc::clone(&vault), secs(10), secs(5));

        tokio::time::sleep(secs(9)).await;
        assert_eq!(vault.seals(), 0);

        tokio::time::sleep(secs(2)).await;
        assert_eq!(vault.seals(), 1);
        assert!(!vault.is_unsealed().await.unwrap());

        // Stays sealed: no further seal calls.
        tokio::time::sleep(secs(60)).await;
        assert_eq!(vault.seals(), 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn duration_of_two_ticks_seals_once() {
        let vault = FakeVault::unsealed();
        let running = spawn_watcher(Arc::clone(&vault), secs(10), secs(5));

        tokio::time::sleep(secs(12)).await;
        assert_eq!(vault.seals(), 1);
        assert!(!vault.is_unsealed().await.unwrap());

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_seal_before_expiry_prevents_autoseal() {
        let vault = FakeVault::unsealed();
        let running = spawn_watcher(Arc::clone(&vault), secs(12), secs(5));

        // Polls at 0, 5 and 10 see the vault unsealed; deadline is 12.
        tokio::time::sleep(secs(11)).await;
        vault.set_unsealed(false);

        tokio::time::sleep(secs(30)).await;
        assert_eq!(vault.seals(), 0);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reunseal_rearms_a_fresh_timer() {
        let vault = Arc::new(FakeVault::default());
        let running = spawn_watcher(Arc::clone(&vault), secs(20), secs(5));

        // sealed, then unsealed at 3 (seen at 5), sealed at 8 (seen at 10)
        tokio::time::sleep(secs(3)).await;
        vault.set_unsealed(true);
        tokio::time::sleep(secs(5)).await;
        vault.set_unsealed(false);

        // unsealed again at 13, seen at 15: deadline 35, not 25.
        tokio::time::sleep(secs(5)).await;
        vault.set_unsealed(true);

        tokio::time::sleep(secs(20)).await; // t = 33
        assert_eq!(vault.seals(), 0);

        tokio::time::sleep(secs(3)).await; // t = 36
        assert_eq!(vault.seals(), 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn query_failure_does_not_arm() {
        let vault = FakeVault::unsealed();
        vault.fail_next_queries(3);
        let running = spawn_watcher(Arc::clone(&vault), secs(10), secs(5));

        // Polls at 0, 5, 10 fail; poll at 15 arms; expiry at 25.
        tokio::time::sleep(secs(24)).await;
        assert_eq!(vault.seals(), 0);

        tokio::time::sleep(secs(2)).await;
        assert_eq!(vault.seals(), 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_autoseal_keeps_running_and_retries_later() {
        let vault = FakeVault::unsealed();
        vault.fail_seal.store(true, Ordering::SeqCst);
        let running = spawn_watcher(Arc::clone(&vault), secs(10), secs(5));

        tokio::time::sleep(secs(11)).await;
        assert_eq!(vault.seals(), 1);
        assert!(vault.is_unsealed().await.unwrap());

        // Back to idle, the next poll (15) re-arms: second attempt by 25.
        vault.fail_seal.store(false, Ordering::SeqCst);
        tokio::time::sleep(secs(15)).await;
        assert_eq!(vault.seals(), 2);
        assert!(!vault.is_unsealed().await.unwrap());

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_query_failure_retries_after_poll_interval() {
        let vault = FakeVault::unsealed();
        let running = spawn_watcher(Arc::clone(&vault), secs(12), secs(5));

        // Polls at 0, 5, 10 succeed; the expiry check at 12 fails.
        tokio::time::sleep(secs(11)).await;
        let queries = vault.queries.load(Ordering::SeqCst);
        assert_eq!(queries, 3);
        vault.fail_next_queries(1);

        tokio::time::sleep(secs(2)).await; // t = 13
        assert_eq!(vault.seals(), 0);

        // Retry at 17.
        tokio::time::sleep(secs(5)).await; // t = 18
        assert_eq!(vault.seals(), 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sender_dropped() {
        let vault = FakeVault::unsealed();
        let running = spawn_watcher(Arc::clone(&vault), secs(10), secs(5));
        drop(running.shutdown);
        running.handle.await.unwrap();
        assert_eq!(vault.seals(), 0);
    }
}
