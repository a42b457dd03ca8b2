//! Per-wallet circuit breaker.
//!
//! Entries are created lazily per wallet id. Closed passes everything, Open
//! rejects everything, HalfOpen admits exactly one probe; the admission
//! decision is taken under the entry guard so concurrent callers observe a
//! consistent result.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::{ErrorKind, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip Closed -> Open.
    pub failure_threshold: u32,
    /// How long Open rejects before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let failure_threshold = env::var("CONNECT_CIRCUIT_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.failure_threshold);
        let cooldown = env::var("CONNECT_CIRCUIT_COOLDOWN_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.cooldown);

        Self {
            failure_threshold,
            cooldown,
        }
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Failure isolator keyed by wallet id.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    entries: DashMap<String, CircuitEntry>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Whether a request may be dispatched right now. A `true` answer while
    /// the circuit is cooling down consumes the single HalfOpen probe slot.
    pub fn is_allowed(&self, wallet_id: &str) -> bool {
        let mut entry = self.entries.entry(wallet_id.to_string()).or_default();
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    info!(wallet_id, "Circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    false
                } else {
                    entry.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Remaining cooldown while Open, if any.
    pub fn remaining_cooldown(&self, wallet_id: &str) -> Option<Duration> {
        let entry = self.entries.get(wallet_id)?;
        if entry.state != CircuitState::Open {
            return None;
        }
        let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        Some(self.config.cooldown.saturating_sub(elapsed))
    }

    pub fn record_success(&self, wallet_id: &str) {
        let mut entry = self.entries.entry(wallet_id.to_string()).or_default();
        let was = entry.state;
        entry.consecutive_failures = 0;
        entry.last_success_at = Some(Instant::now());
        entry.probe_in_flight = false;
        entry.opened_at = None;
        entry.state = CircuitState::Closed;
        if was != CircuitState::Closed {
            info!(wallet_id, from = was.as_str(), "Circuit closed");
        }
    }

    pub fn record_failure(&self, wallet_id: &str) {
        let mut entry = self.entries.entry(wallet_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(Instant::now());

        match entry.state {
            CircuitState::HalfOpen => {
                // Probe failed: reopen and restart the cooldown clock.
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.probe_in_flight = false;
                warn!(wallet_id, "Circuit probe failed, reopening");
            }
            CircuitState::Closed => {
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                    warn!(
                        wallet_id,
                        failures = entry.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give back an admitted HalfOpen probe slot without recording an
    /// outcome (the gated call never reached the wallet).
    pub fn release_probe(&self, wallet_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(wallet_id)
            && entry.state == CircuitState::HalfOpen
        {
            entry.probe_in_flight = false;
        }
    }

    /// Manual reset back to Closed.
    pub fn reset(&self, wallet_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(wallet_id) {
            *entry = CircuitEntry::default();
            info!(wallet_id, "Circuit manually reset");
        }
    }

    pub fn state(&self, wallet_id: &str) -> CircuitState {
        self.entries
            .get(wallet_id)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, wallet_id: &str) -> u32 {
        self.entries
            .get(wallet_id)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Build the rejection error for a gated wallet.
    pub fn rejection(&self, wallet_id: &str) -> WalletError {
        let remaining = self
            .remaining_cooldown(wallet_id)
            .unwrap_or(self.config.cooldown);
        WalletError::new(
            ErrorKind::ConnectionTimeout,
            format!(
                "circuit open for wallet, retry in {}ms",
                remaining.as_millis()
            ),
        )
        .with_wallet(wallet_id)
    }

    /// Gate and run `operation`, feeding the outcome back into the breaker.
    /// User rejections are user action, not system failure, and do not feed
    /// the failure counter.
    pub async fn execute<T, Fut>(
        &self,
        wallet_id: &str,
        operation: Fut,
    ) -> Result<T, WalletError>
    where
        Fut: Future<Output = Result<T, WalletError>>,
    {
        if !self.is_allowed(wallet_id) {
            return Err(self.rejection(wallet_id));
        }

        match operation.await {
            Ok(value) => {
                self.record_success(wallet_id);
                Ok(value)
            }
            Err(error) => {
                if error.kind != ErrorKind::UserRejected {
                    self.record_failure(wallet_id);
                } else {
                    // Release the probe slot without reopening.
                    if let Some(mut entry) = self.entries.get_mut(wallet_id) {
                        entry.probe_in_flight = false;
                    }
                }
                Err(error)
            }
        }
    }
}
