//! Background keep-alive for assigned servers.
//!
//! Each pass refreshes connections whose proxy token is about to expire and
//! then pings every assigned runtime so the backend does not reclaim it as
//! idle. Passes run on a jittered interval, with exponential backoff after
//! failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng as _;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::AssignmentError;
use crate::manager::AssignmentManager;

/// Keep-alive configuration.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Base interval between passes.
    pub interval: Duration,
    /// Maximum jitter added to the interval, as a fraction of it.
    pub jitter_fraction: f64,
    /// Connections expiring within this margin are refreshed.
    pub refresh_margin: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// After this many failures in a row, passes run every `max_backoff`.
    pub max_consecutive_failures: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            jitter_fraction: 0.1,
            refresh_margin: Duration::from_secs(600),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

impl KeepAliveConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Interval plus or minus up to `jitter_fraction` of it.
    pub fn next_delay(&self) -> Duration {
        let base = self.interval.as_secs_f64();
        let range = base * self.jitter_fraction;
        let jitter = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// Backoff after `consecutive_failures` failed passes.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_secs_f64();
        let multiplier = self
            .backoff_multiplier
            .powi(consecutive_failures.saturating_sub(1) as i32);
        let delay = (base * multiplier).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(delay)
    }

    fn refresh_margin_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_margin).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Commands accepted by a running [`KeepAlive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveCommand {
    /// Run a pass now.
    TickNow,
    Pause,
    Resume,
    Stop,
}

/// Progress of the keep-alive loop.
#[derive(Debug, Clone, Default)]
pub struct KeepAliveState {
    pub paused: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Servers pinged by the last successful pass.
    pub last_pinged: usize,
}

impl KeepAliveState {
    pub fn record_success(&mut self, pinged: usize) {
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        self.last_attempt = self.last_success;
        self.last_error = None;
        self.last_pinged = pinged;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures += 1;
        self.last_attempt = Some(Utc::now());
        self.last_error = Some(error.into());
    }
}

type SharedState = Arc<RwLock<KeepAliveState>>;

/// The keep-alive loop. Start it with [`run`](Self::run), steer it through a
/// [`KeepAliveHandle`].
pub struct KeepAlive {
    config: KeepAliveConfig,
    manager: Arc<AssignmentManager>,
    state: SharedState,
    command_tx: mpsc::Sender<KeepAliveCommand>,
    command_rx: mpsc::Receiver<KeepAliveCommand>,
}

impl KeepAlive {
    pub fn new(config: KeepAliveConfig, manager: Arc<AssignmentManager>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            config,
            manager,
            state: SharedState::default(),
            command_tx,
            command_rx,
        }
    }

    pub fn handle(&self) -> KeepAliveHandle {
        KeepAliveHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs passes until a [`KeepAliveCommand::Stop`] arrives.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            refresh_margin_secs = self.config.refresh_margin.as_secs(),
            "keep-alive started"
        );

        self.tick().await;

        loop {
            let delay = self.next_delay().await;
            debug!(delay_secs = delay.as_secs(), "next keep-alive pass");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if self.state.read().await.paused {
                        debug!("keep-alive paused, skipping pass");
                        continue;
                    }
                    self.tick().await;
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(KeepAliveCommand::TickNow) => self.tick().await,
                        Some(KeepAliveCommand::Pause) => {
                            info!("keep-alive paused");
                            self.state.write().await.paused = true;
                        }
                        Some(KeepAliveCommand::Resume) => {
                            info!("keep-alive resumed");
                            self.state.write().await.paused = false;
                        }
                        Some(KeepAliveCommand::Stop) | None => {
                            info!("keep-alive stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn next_delay(&self) -> Duration {
        let failures = self.state.read().await.consecutive_failures;
        if failures >= self.config.max_consecutive_failures {
            return self.config.max_backoff;
        }
        if failures > 0 {
            let backoff = self.config.backoff_delay(failures);
            debug!(failures, backoff_secs = backoff.as_secs(), "backing off");
            return backoff;
        }
        self.config.next_delay()
    }

    async fn tick(&self) {
        match self.pass().await {
            Ok(pinged) => {
                debug!(pinged, "keep-alive pass done");
                self.state.write().await.record_success(pinged);
            }
            Err(e) => {
                warn!(error = %e, "keep-alive pass failed");
                let mut state = self.state.write().await;
                state.record_failure(e);
                if state.consecutive_failures == self.config.max_consecutive_failures {
                    error!(
                        failures = state.consecutive_failures,
                        retry_secs = self.config.max_backoff.as_secs(),
                        "keep-alive keeps failing, retrying at the slowest rate"
                    );
                }
            }
        }
    }

    /// Refreshes expiring connections and pings every server once.
    ///
    /// A failure for one server does not stop the others; the pass fails if
    /// any server failed.
    async fn pass(&self) -> Result<usize, String> {
        let servers = self
            .manager
            .assigned_servers()
            .await
            .map_err(|e| e.to_string())?;
        let margin = self.config.refresh_margin_chrono();

        let mut pinged = 0;
        let mut failures = Vec::new();
        for server in servers {
            let server = if server.connection_information.expires_within(margin) {
                match self.manager.refresh_connection(server.id).await {
                    Ok(refreshed) => refreshed,
                    // Unassigned while this pass was running.
                    Err(AssignmentError::NotAssigned(_)) => continue,
                    Err(e) => {
                        failures.push(format!("{}: {}", server.label(), e));
                        continue;
                    }
                }
            } else {
                server
            };

            match self.manager.keep_alive(&server).await {
                Ok(()) => pinged += 1,
                Err(e) => failures.push(format!("{}: {}", server.label(), e)),
            }
        }

        if failures.is_empty() {
            Ok(pinged)
        } else {
            Err(failures.join("; "))
        }
    }
}

/// Handle for steering a running [`KeepAlive`].
#[derive(Clone, Debug)]
pub struct KeepAliveHandle {
    command_tx: mpsc::Sender<KeepAliveCommand>,
    state: SharedState,
}

impl KeepAliveHandle {
    pub async fn tick_now(&self) -> Result<(), mpsc::error::SendError<KeepAliveCommand>> {
        self.command_tx.send(KeepAliveCommand::TickNow).await
    }

    pub async fn pause(&self) -> Result<(), mpsc::error::SendError<KeepAliveCommand>> {
        self.command_tx.send(KeepAliveCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), mpsc::error::SendError<KeepAliveCommand>> {
        self.command_tx.send(KeepAliveCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<KeepAliveCommand>> {
        self.command_tx.send(KeepAliveCommand::Stop).await
    }

    pub async fn state(&self) -> KeepAliveState {
        self.state.read().await.clone()
    }

    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use colab_core::default_server;
    use uuid::Uuid;

    use crate::manager::testing::FakeBackend;
    use crate::storage::{MemoryServerStorage, ServerStorage};

    fn setup(config: KeepAliveConfig) -> (KeepAlive, Arc<FakeBackend>, Arc<AssignmentManager>) {
        let backend = FakeBackend::new();
        let manager = Arc::new(AssignmentManager::new(
            backend.clone(),
            Arc::new(MemoryServerStorage::new()),
        ));
        (KeepAlive::new(config, manager.clone()), backend, manager)
    }

    #[test]
    fn next_delay_stays_within_jitter() {
        let config = KeepAliveConfig::new(Duration::from_secs(60)).with_jitter(0.1);
        for _ in 0..20 {
            let delay = config.next_delay().as_secs_f64();
            assert!((54.0..=66.0).contains(&delay), "delay {} out of range", delay);
        }
        let exact = KeepAliveConfig::new(Duration::from_secs(60)).with_jitter(0.0);
        assert_eq!(exact.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let config = KeepAliveConfig::default().with_backoff(
            Duration::from_secs(5),
            Duration::from_secs(300),
            2.0,
        );
        assert_eq!(config.backoff_delay(0), Duration::ZERO);
        assert_eq!(config.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(config.backoff_delay(12), Duration::from_secs(300));
    }

    #[test]
    fn state_tracks_failures() {
        let mut state = KeepAliveState::default();
        state.record_failure("boom");
        state.record_failure("boom again");
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_error.as_deref(), Some("boom again"));

        state.record_success(3);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_pinged, 3);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn pass_pings_every_server() {
        let (keep_alive, backend, manager) = setup(KeepAliveConfig::default());
        let a = manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        let b = manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();

        assert_eq!(keep_alive.pass().await.unwrap(), 2);
        let pinged = backend.keep_alives.lock().unwrap().clone();
        assert_eq!(pinged, vec![a.endpoint, b.endpoint]);
        assert_eq!(backend.assigns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiring_connections_are_refreshed_first() {
        let config = KeepAliveConfig::default().with_refresh_margin(Duration::from_secs(7200));
        let (keep_alive, backend, manager) = setup(config);
        let server = manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();

        keep_alive.pass().await.unwrap();

        assert_eq!(backend.assigns.load(Ordering::SeqCst), 2);
        let stored = manager.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.connection_information.token, "token-2");
    }

    #[tokio::test]
    async fn failed_pings_fail_the_pass() {
        let (keep_alive, backend, manager) = setup(KeepAliveConfig::default());
        manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        backend.fail_keep_alive.store(true, Ordering::SeqCst);

        let err = keep_alive.pass().await.unwrap_err();
        assert!(err.contains("Colab CPU"));
        assert!(err.contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_set_is_a_successful_pass() {
        let (keep_alive, backend, _) = setup(KeepAliveConfig::default());
        assert_eq!(keep_alive.pass().await.unwrap(), 0);
        assert!(backend.keep_alives.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commands_drive_the_loop() {
        let (keep_alive, backend, manager) = setup(KeepAliveConfig::new(Duration::from_secs(60)));
        manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        let handle = keep_alive.handle();
        let task = tokio::spawn(keep_alive.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.keep_alives.lock().unwrap().len(), 1);

        handle.tick_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.keep_alives.lock().unwrap().len(), 2);
        assert_eq!(handle.state().await.last_pinged, 1);

        handle.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_paused().await);

        handle.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_paused().await);

        handle.stop().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failures_are_recorded_in_state() {
        let config = KeepAliveConfig::new(Duration::from_secs(60)).with_backoff(
            Duration::from_secs(30),
            Duration::from_secs(60),
            2.0,
        );
        let (keep_alive, backend, manager) = setup(config);
        manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        backend.fail_keep_alive.store(true, Ordering::SeqCst);
        let handle = keep_alive.handle();
        let task = tokio::spawn(keep_alive.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = handle.state().await;
        assert_eq!(state.consecutive_failures, 1);
        assert!(state.last_error.is_some());

        backend.fail_keep_alive.store(false, Ordering::SeqCst);
        handle.tick_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state().await.consecutive_failures, 0);

        handle.stop().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_reaching_the_failure_cap() {
        let mut config = KeepAliveConfig::new(Duration::from_secs(60))
            .with_jitter(0.0)
            .with_backoff(Duration::from_secs(5), Duration::from_secs(10), 2.0);
        config.max_consecutive_failures = 1;
        let (keep_alive, backend, manager) = setup(config);
        manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        backend.fail_keep_alive.store(true, Ordering::SeqCst);
        let handle = keep_alive.handle();
        let task = tokio::spawn(keep_alive.run());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state().await.consecutive_failures, 1);

        // The scheduled pass still runs once the backend is back.
        backend.fail_keep_alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(11)).await;
        let state = handle.state().await;
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_pinged, 1);
        assert_eq!(backend.keep_alives.lock().unwrap().len(), 1);

        backend.fail_keep_alive.store(true, Ordering::SeqCst);
        handle.tick_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state().await.consecutive_failures, 1);

        backend.fail_keep_alive.store(false, Ordering::SeqCst);
        handle.tick_now().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state().await.consecutive_failures, 0);
        assert_eq!(backend.keep_alives.lock().unwrap().len(), 2);

        handle.stop().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn storage_is_untouched_for_fresh_connections() {
        let backend = FakeBackend::new();
        let storage = Arc::new(MemoryServerStorage::new());
        let manager = Arc::new(AssignmentManager::new(backend, storage.clone()));
        manager.assign_server(Uuid::new_v4(), &default_server()).await.unwrap();
        let writes = storage.write_count();

        KeepAlive::new(KeepAliveConfig::default(), manager).pass().await.unwrap();
        assert_eq!(storage.write_count(), writes);
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }
}
