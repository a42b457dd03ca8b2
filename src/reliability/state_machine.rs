//! Connection state machine.
//!
//! A fixed transition table governs the connection lifecycle. Illegal
//! transitions fail loudly and leave the state unchanged. A bounded history
//! ring records every transition for diagnostics, and only `Connected`
//! states survive persistence.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{Account, ErrorKind, WalletError};
use crate::events::{ConnectorEvent, EventBus};

/// Connection lifecycle state. Every in-flight variant carries the wallet it
/// refers to and the instant it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Detecting {
        wallet_id: String,
        since: DateTime<Utc>,
    },
    Connecting {
        wallet_id: String,
        since: DateTime<Utc>,
    },
    Authenticating {
        wallet_id: String,
        since: DateTime<Utc>,
    },
    Connected {
        wallet_id: String,
        accounts: Vec<Account>,
        since: DateTime<Utc>,
    },
    Signing {
        wallet_id: String,
        operation: String,
        since: DateTime<Utc>,
    },
    Reconnecting {
        wallet_id: String,
        attempt: u32,
        since: DateTime<Utc>,
    },
    Disconnecting {
        wallet_id: String,
        since: DateTime<Utc>,
    },
    Error {
        wallet_id: Option<String>,
        message: String,
        since: DateTime<Utc>,
    },
}

impl ConnectionState {
    pub fn connecting(wallet_id: impl Into<String>) -> Self {
        Self::Connecting { wallet_id: wallet_id.into(), since: Utc::now() }
    }

    pub fn detecting(wallet_id: impl Into<String>) -> Self {
        Self::Detecting { wallet_id: wallet_id.into(), since: Utc::now() }
    }

    pub fn authenticating(wallet_id: impl Into<String>) -> Self {
        Self::Authenticating { wallet_id: wallet_id.into(), since: Utc::now() }
    }

    pub fn connected(wallet_id: impl Into<String>, accounts: Vec<Account>) -> Self {
        Self::Connected { wallet_id: wallet_id.into(), accounts, since: Utc::now() }
    }

    pub fn signing(wallet_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Signing {
            wallet_id: wallet_id.into(),
            operation: operation.into(),
            since: Utc::now(),
        }
    }

    pub fn reconnecting(wallet_id: impl Into<String>, attempt: u32) -> Self {
        Self::Reconnecting { wallet_id: wallet_id.into(), attempt, since: Utc::now() }
    }

    pub fn disconnecting(wallet_id: impl Into<String>) -> Self {
        Self::Disconnecting { wallet_id: wallet_id.into(), since: Utc::now() }
    }

    pub fn error(wallet_id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error { wallet_id, message: message.into(), since: Utc::now() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detecting { .. } => "detecting",
            Self::Connecting { .. } => "connecting",
            Self::Authenticating { .. } => "authenticating",
            Self::Connected { .. } => "connected",
            Self::Signing { .. } => "signing",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Disconnecting { .. } => "disconnecting",
            Self::Error { .. } => "error",
        }
    }

    /// Stable states resolve `wait_for_stable`.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Idle | Self::Connected { .. } | Self::Error { .. })
    }

    pub fn wallet_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Detecting { wallet_id, .. }
            | Self::Connecting { wallet_id, .. }
            | Self::Authenticating { wallet_id, .. }
            | Self::Connected { wallet_id, .. }
            | Self::Signing { wallet_id, .. }
            | Self::Reconnecting { wallet_id, .. }
            | Self::Disconnecting { wallet_id, .. } => Some(wallet_id),
            Self::Error { wallet_id, .. } => wallet_id.as_deref(),
        }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Idle => None,
            Self::Detecting { since, .. }
            | Self::Connecting { since, .. }
            | Self::Authenticating { since, .. }
            | Self::Connected { since, .. }
            | Self::Signing { since, .. }
            | Self::Reconnecting { since, .. }
            | Self::Disconnecting { since, .. }
            | Self::Error { since, .. } => Some(*since),
        }
    }
}

/// Fixed transition table: rows = current, entries = allowed next.
fn transition_allowed(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Idle, Detecting { .. })
            | (Idle, Connecting { .. })
            | (Detecting { .. }, Connecting { .. })
            | (Detecting { .. }, Error { .. })
            | (Detecting { .. }, Idle)
            | (Connecting { .. }, Authenticating { .. })
            | (Connecting { .. }, Connected { .. })
            | (Connecting { .. }, Error { .. })
            | (Connecting { .. }, Idle)
            | (Authenticating { .. }, Connected { .. })
            | (Authenticating { .. }, Error { .. })
            | (Authenticating { .. }, Idle)
            | (Connected { .. }, Signing { .. })
            | (Connected { .. }, Disconnecting { .. })
            | (Connected { .. }, Reconnecting { .. })
            | (Connected { .. }, Error { .. })
            | (Signing { .. }, Connected { .. })
            | (Signing { .. }, Error { .. })
            | (Reconnecting { .. }, Connected { .. })
            | (Reconnecting { .. }, Error { .. })
            | (Reconnecting { .. }, Idle)
            | (Disconnecting { .. }, Idle)
            | (Disconnecting { .. }, Error { .. })
            | (Error { .. }, Idle)
            | (Error { .. }, Connecting { .. })
            | (Error { .. }, Reconnecting { .. })
    )
}

/// One history ring entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    pub history_capacity: usize,
    /// Persisted `Connected` states older than this are dropped on restore.
    pub persist_ttl: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 50,
            persist_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

type TransitionHook = Box<dyn Fn(&ConnectionState, &ConnectionState) + Send + Sync>;
type StateHook = Box<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_enter: Vec<StateHook>,
    on_exit: Vec<StateHook>,
    on_transition: Vec<TransitionHook>,
    on_invalid: Option<TransitionHook>,
}

struct Inner {
    state: ConnectionState,
    history: VecDeque<TransitionRecord>,
    entered_at: DateTime<Utc>,
}

/// Serialized wrapper for durable storage.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    state: ConnectionState,
    saved_at: DateTime<Utc>,
}

pub struct ConnectionStateMachine {
    config: StateMachineConfig,
    inner: Mutex<Inner>,
    hooks: Mutex<Hooks>,
    notify: watch::Sender<ConnectionState>,
    events: Option<EventBus>,
}

impl ConnectionStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        let (notify, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                history: VecDeque::new(),
                entered_at: Utc::now(),
            }),
            hooks: Mutex::new(Hooks::default()),
            notify,
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn add_enter_hook(&self, hook: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().on_enter.push(Box::new(hook));
    }

    pub fn add_exit_hook(&self, hook: impl Fn(&ConnectionState) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().on_exit.push(Box::new(hook));
    }

    pub fn add_transition_hook(
        &self,
        hook: impl Fn(&ConnectionState, &ConnectionState) + Send + Sync + 'static,
    ) {
        self.hooks.lock().unwrap().on_transition.push(Box::new(hook));
    }

    pub fn set_invalid_handler(
        &self,
        hook: impl Fn(&ConnectionState, &ConnectionState) + Send + Sync + 'static,
    ) {
        self.hooks.lock().unwrap().on_invalid = Some(Box::new(hook));
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Wall-clock time spent in the current state.
    pub fn time_in_state(&self) -> chrono::Duration {
        let inner = self.inner.lock().unwrap();
        let since = inner.state.since().unwrap_or(inner.entered_at);
        Utc::now() - since
    }

    /// Attempt a transition. Invalid transitions error, notify the invalid
    /// handler, and leave the state unchanged.
    pub fn transition(
        &self,
        next: ConnectionState,
        reason: &str,
    ) -> Result<(), WalletError> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            if !transition_allowed(&inner.state, &next) {
                let from = inner.state.clone();
                drop(inner);
                if let Some(on_invalid) = &self.hooks.lock().unwrap().on_invalid {
                    on_invalid(&from, &next);
                }
                warn!(from = from.name(), to = next.name(), "Invalid state transition");
                return Err(WalletError::new(
                    ErrorKind::UnknownError,
                    format!("invalid transition from {} to {}", from.name(), next.name()),
                ));
            }

            let previous = std::mem::replace(&mut inner.state, next.clone());
            inner.entered_at = Utc::now();
            let entered_at = inner.entered_at;
            inner.history.push_back(TransitionRecord {
                from: previous.name().to_string(),
                to: next.name().to_string(),
                at: entered_at,
                reason: reason.to_string(),
            });
            while inner.history.len() > self.config.history_capacity {
                inner.history.pop_front();
            }
            previous
        };

        debug!(from = previous.name(), to = next.name(), reason, "State transition");

        {
            let hooks = self.hooks.lock().unwrap();
            for hook in &hooks.on_enter {
                hook(&next);
            }
            for hook in &hooks.on_exit {
                hook(&previous);
            }
            for hook in &hooks.on_transition {
                hook(&previous, &next);
            }
        }

        if let Some(events) = &self.events {
            events.emit(&ConnectorEvent::StateChanged {
                from: previous.name().to_string(),
                to: next.name().to_string(),
            });
        }

        let _ = self.notify.send(next);
        Ok(())
    }

    /// Resolve on the next stable state (`Idle`, `Connected`, `Error`), or
    /// time out.
    pub async fn wait_for_stable(&self, timeout: Duration) -> Result<ConnectionState, WalletError> {
        let mut rx = self.notify.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = self.current();
            if current.is_stable() {
                return Ok(current);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(WalletError::new(
                    ErrorKind::ConnectionTimeout,
                    "timed out waiting for stable connection state",
                ));
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    return Err(WalletError::new(
                        ErrorKind::ConnectionTimeout,
                        "timed out waiting for stable connection state",
                    ));
                }
            }
        }
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().unwrap().history.iter().cloned().collect()
    }

    /// Serialize the current state for durable storage. Only `Connected` is
    /// worth restoring; transient states return `None`.
    pub fn to_persisted(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        match &inner.state {
            state @ ConnectionState::Connected { .. } => serde_json::to_string(&PersistedState {
                state: state.clone(),
                saved_at: Utc::now(),
            })
            .ok(),
            _ => None,
        }
    }

    /// Restore a persisted state. Non-`Connected` and expired payloads are
    /// discarded.
    pub fn restore_persisted(&self, json: &str) -> Option<ConnectionState> {
        let persisted: PersistedState = serde_json::from_str(json).ok()?;
        if !matches!(persisted.state, ConnectionState::Connected { .. }) {
            return None;
        }
        let age = Utc::now() - persisted.saved_at;
        if age > chrono::Duration::from_std(self.config.persist_ttl).ok()? {
            debug!("Dropping expired persisted connection state");
            return None;
        }
        Some(persisted.state)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(StateMachineConfig::default())
    }
}
