//! Typed event bus.
//!
//! Subscribers register per event name (or for all events) and get back an
//! unsubscribe handle. Listeners fire in registration order; a panicking
//! listener is isolated and logged, never preventing the others from firing.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::domain::Account;

/// Device-interactive operation a hardware event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Connect,
    GetPublicKey,
    Sign,
    SignMessage,
}

impl DeviceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::GetPublicKey => "get_public_key",
            Self::Sign => "sign",
            Self::SignMessage => "sign_message",
        }
    }
}

/// Hardware driver event surface.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub wallet_id: String,
    pub action: DeviceAction,
    pub kind: DeviceEventKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// A user-interactive device call is about to start.
    Waiting,
    /// The user approved on the device.
    Confirm,
    /// The user declined on the device.
    Rejected,
    Connected,
    Disconnected,
}

/// Events emitted by the runtime for consumers and the UI layer.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    WalletConnected {
        wallet_id: String,
        accounts: Vec<Account>,
    },
    WalletDisconnected {
        wallet_id: String,
    },
    AccountsChanged {
        wallet_id: String,
        accounts: Vec<Account>,
    },
    StateChanged {
        from: String,
        to: String,
    },
    HealthChanged {
        wallet_id: String,
        status: crate::reliability::health::ConnectionHealth,
    },
    HealthRestored {
        wallet_id: String,
    },
    ReconnectAttempt {
        wallet_id: String,
        attempt: u32,
    },
    Hardware(DeviceEvent),
    /// Another tab updated the shared session record; treat as cache
    /// invalidation, never as proof of liveness.
    SessionUpdated {
        wallet_id: String,
    },
    AppNotInstalledHint {
        wallet_id: String,
        app_store_url: Option<String>,
    },
    TransactionBlocked {
        wallet_id: String,
        reasons: Vec<String>,
    },
    RateLimited {
        action: String,
        retry_after_ms: u64,
    },
    WalletError {
        wallet_id: Option<String>,
        kind: crate::domain::ErrorKind,
        message: String,
    },
}

impl ConnectorEvent {
    /// Stable event name used as the subscription topic.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WalletConnected { .. } => "wallet:connected",
            Self::WalletDisconnected { .. } => "wallet:disconnected",
            Self::AccountsChanged { .. } => "accounts:changed",
            Self::StateChanged { .. } => "state:changed",
            Self::HealthChanged { .. } => "health:changed",
            Self::HealthRestored { .. } => "health:restored",
            Self::ReconnectAttempt { .. } => "reconnect:attempt",
            Self::Hardware(_) => "hardware:event",
            Self::SessionUpdated { .. } => "session:updated",
            Self::AppNotInstalledHint { .. } => "deeplink:app-not-installed",
            Self::TransactionBlocked { .. } => "tx:blocked",
            Self::RateLimited { .. } => "rate:limited",
            Self::WalletError { .. } => "wallet:error",
        }
    }
}

type Listener = Arc<dyn Fn(&ConnectorEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    /// Topic -> ordered listener list. The empty topic subscribes to all.
    listeners: HashMap<String, Vec<(u64, Listener)>>,
}

const ALL_TOPICS: &str = "*";

/// Cheaply cloneable event bus shared across the runtime.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event name. The returned handle unsubscribes
    /// when dropped.
    pub fn subscribe(
        &self,
        topic: &str,
        listener: impl Fn(&ConnectorEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.register(topic.to_string(), Arc::new(listener))
    }

    /// Subscribe to every event.
    pub fn subscribe_all(
        &self,
        listener: impl Fn(&ConnectorEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.register(ALL_TOPICS.to_string(), Arc::new(listener))
    }

    fn register(&self, topic: String, listener: Listener) -> EventSubscription {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.entry(topic.clone()).or_default().push((id, listener));
        EventSubscription {
            id,
            topic,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Emit an event to topic subscribers, then to all-event subscribers,
    /// each group in registration order.
    pub fn emit(&self, event: &ConnectorEvent) {
        let snapshot: Vec<Listener> = {
            let inner = self.inner.lock().unwrap();
            let mut listeners = Vec::new();
            if let Some(for_topic) = inner.listeners.get(event.name()) {
                listeners.extend(for_topic.iter().map(|(_, l)| Arc::clone(l)));
            }
            if let Some(for_all) = inner.listeners.get(ALL_TOPICS) {
                listeners.extend(for_all.iter().map(|(_, l)| Arc::clone(l)));
            }
            listeners
        };

        for listener in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                warn!(event = event.name(), panic = %detail, "Event listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Handle returned by [`EventBus::subscribe`]; unsubscribes on drop.
pub struct EventSubscription {
    id: u64,
    topic: String,
    bus: Weak<Mutex<BusInner>>,
}

impl EventSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut inner = bus.lock().unwrap();
            if let Some(listeners) = inner.listeners.get_mut(&self.topic) {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
