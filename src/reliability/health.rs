//! Connection health monitor.
//!
//! A driver-supplied health check runs on a heartbeat timer; latency and
//! failure streaks derive a status. Account-list sync runs on its own
//! interval and reports membership changes.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{Account, WalletError};
use crate::events::{ConnectorEvent, EventBus};

/// Derived health status, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Stale,
    Lost,
}

impl ConnectionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Stale => "stale",
            Self::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub max_consecutive_failures: u32,
    pub stale_threshold: Duration,
    pub degraded_latency_threshold: Duration,
    /// Rolling latency window size.
    pub latency_window: usize,
    /// Account sync is decoupled from the heartbeat; `None` disables it.
    pub account_sync_interval: Option<Duration>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_consecutive_failures: 3,
            stale_threshold: Duration::from_secs(120),
            degraded_latency_threshold: Duration::from_secs(1),
            latency_window: 10,
            account_sync_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug)]
struct HealthState {
    last_heartbeat: Option<Instant>,
    last_interaction: Instant,
    consecutive_failures: u32,
    latencies: Vec<Duration>,
    current: ConnectionHealth,
    known_account_ids: HashSet<String>,
}

type CheckFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), WalletError>> + Send>> + Send + Sync,
>;
type AccountsFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Vec<Account>, WalletError>> + Send>>
        + Send
        + Sync,
>;

/// Monitors one wallet connection.
pub struct HealthMonitor {
    config: HealthConfig,
    wallet_id: String,
    state: Arc<Mutex<HealthState>>,
    events: EventBus,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl HealthMonitor {
    pub fn new(wallet_id: impl Into<String>, config: HealthConfig, events: EventBus) -> Self {
        Self {
            config,
            wallet_id: wallet_id.into(),
            state: Arc::new(Mutex::new(HealthState {
                last_heartbeat: None,
                last_interaction: Instant::now(),
                consecutive_failures: 0,
                latencies: Vec::new(),
                current: ConnectionHealth::Healthy,
                known_account_ids: HashSet::new(),
            })),
            events,
            shutdown: Mutex::new(None),
        }
    }

    /// Current derived status.
    pub fn status(&self) -> ConnectionHealth {
        self.state.lock().unwrap().current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().unwrap().consecutive_failures
    }

    /// Record app-level activity; staleness derives from this.
    pub fn record_interaction(&self) {
        self.state.lock().unwrap().last_interaction = Instant::now();
    }

    /// Feed one heartbeat outcome and re-derive the status.
    pub fn record_check(&self, outcome: Result<Duration, ()>) -> ConnectionHealth {
        let (previous, next) = {
            let mut state = self.state.lock().unwrap();
            let previous = state.current;
            match outcome {
                Ok(latency) => {
                    state.last_heartbeat = Some(Instant::now());
                    state.consecutive_failures = 0;
                    state.latencies.push(latency);
                    let window = self.config.latency_window.max(1);
                    if state.latencies.len() > window {
                        let excess = state.latencies.len() - window;
                        state.latencies.drain(..excess);
                    }
                }
                Err(()) => state.consecutive_failures += 1,
            }
            let next = self.derive(&state);
            state.current = next;
            (previous, next)
        };

        if next != previous {
            debug!(
                wallet_id = %self.wallet_id,
                from = previous.as_str(),
                to = next.as_str(),
                "Connection health changed"
            );
            self.events.emit(&ConnectorEvent::HealthChanged {
                wallet_id: self.wallet_id.clone(),
                status: next,
            });
            if next == ConnectionHealth::Healthy {
                self.events.emit(&ConnectorEvent::HealthRestored {
                    wallet_id: self.wallet_id.clone(),
                });
            }
        }
        next
    }

    fn derive(&self, state: &HealthState) -> ConnectionHealth {
        if state.consecutive_failures >= self.config.max_consecutive_failures {
            return ConnectionHealth::Lost;
        }
        if state.last_interaction.elapsed() > self.config.stale_threshold {
            return ConnectionHealth::Stale;
        }
        if !state.latencies.is_empty() {
            let total: Duration = state.latencies.iter().sum();
            let avg = total / state.latencies.len() as u32;
            if avg > self.config.degraded_latency_threshold {
                return ConnectionHealth::Degraded;
            }
        }
        ConnectionHealth::Healthy
    }

    /// Compare a fresh account list against the last known set, emitting
    /// `accounts:changed` when membership differs.
    pub fn sync_accounts(&self, accounts: &[Account]) {
        let ids: HashSet<String> = accounts.iter().map(|a| a.account_id.clone()).collect();
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.known_account_ids == ids {
                false
            } else {
                state.known_account_ids = ids;
                true
            }
        };
        if changed {
            self.events.emit(&ConnectorEvent::AccountsChanged {
                wallet_id: self.wallet_id.clone(),
                accounts: accounts.to_vec(),
            });
        }
    }

    /// Start the heartbeat (and optional account-sync) timers.
    pub fn start(self: &Arc<Self>, check: CheckFn, accounts: Option<AccountsFn>) {
        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let monitor = Arc::clone(self);
        let mut hb_rx = rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let outcome = match check().await {
                            Ok(()) => Ok(started.elapsed()),
                            Err(e) => {
                                warn!(wallet_id = %monitor.wallet_id, error = %e, "Health check failed");
                                Err(())
                            }
                        };
                        monitor.record_check(outcome);
                    }
                    _ = hb_rx.changed() => break,
                }
            }
        });

        if let (Some(interval), Some(fetch)) = (self.config.account_sync_interval, accounts) {
            let monitor = Arc::clone(self);
            let mut sync_rx = rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match fetch().await {
                                Ok(accounts) => monitor.sync_accounts(&accounts),
                                Err(e) => {
                                    debug!(wallet_id = %monitor.wallet_id, error = %e, "Account sync failed");
                                }
                            }
                        }
                        _ = sync_rx.changed() => break,
                    }
                }
            });
        }
    }

    /// Stop timers. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor(config: HealthConfig) -> (HealthMonitor, EventBus) {
        let events = EventBus::new();
        (HealthMonitor::new("w", config, events.clone()), events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_after_max_consecutive_failures() {
        let (m, _) = monitor(HealthConfig {
            max_consecutive_failures: 3,
            ..Default::default()
        });
        assert_eq!(m.record_check(Err(())), ConnectionHealth::Healthy);
        assert_eq!(m.record_check(Err(())), ConnectionHealth::Healthy);
        assert_eq!(m.record_check(Err(())), ConnectionHealth::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_interaction_gap() {
        let (m, _) = monitor(HealthConfig {
            stale_threshold: Duration::from_secs(10),
            ..Default::default()
        });
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(m.record_check(Ok(Duration::from_millis(5))), ConnectionHealth::Stale);

        m.record_interaction();
        assert_eq!(m.record_check(Ok(Duration::from_millis(5))), ConnectionHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_on_high_average_latency() {
        let (m, _) = monitor(HealthConfig {
            degraded_latency_threshold: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(m.record_check(Ok(Duration::from_millis(500))), ConnectionHealth::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_window_rolls() {
        let (m, _) = monitor(HealthConfig {
            degraded_latency_threshold: Duration::from_millis(100),
            latency_window: 2,
            ..Default::default()
        });
        m.record_check(Ok(Duration::from_millis(500)));
        // Two fast samples push the slow one out of the window.
        m.record_check(Ok(Duration::from_millis(10)));
        assert_eq!(m.record_check(Ok(Duration::from_millis(10))), ConnectionHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_event_emitted_once_on_recovery() {
        let (m, events) = monitor(HealthConfig {
            max_consecutive_failures: 1,
            ..Default::default()
        });
        let restored = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&restored);
        let _sub = events.subscribe("health:restored", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        m.record_check(Err(()));
        assert_eq!(m.status(), ConnectionHealth::Lost);
        m.record_check(Ok(Duration::from_millis(1)));
        m.record_check(Ok(Duration::from_millis(1)));
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_sync_emits_on_membership_change_only() {
        let (m, events) = monitor(HealthConfig::default());
        let changes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&changes);
        let _sub = events.subscribe("accounts:changed", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        m.sync_accounts(&[Account::new("a.near")]);
        m.sync_accounts(&[Account::new("a.near")]);
        m.sync_accounts(&[Account::new("a.near"), Account::new("b.near")]);
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_drives_checks() {
        let events = EventBus::new();
        let m = Arc::new(HealthMonitor::new(
            "w",
            HealthConfig {
                heartbeat_interval: Duration::from_secs(1),
                account_sync_interval: None,
                ..Default::default()
            },
            events,
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let check: CheckFn = Arc::new(move || {
            let calls = Arc::clone(&calls_in);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        m.start(check, None);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(calls.load(Ordering::SeqCst) >= 3);
        m.stop();
    }
}
