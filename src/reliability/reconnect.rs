//! Reconnection manager and operation replay queue.
//!
//! Triggers (visibility, network-online, wake-from-sleep, heartbeat failure,
//! user activity) each attempt at most one reconnect at a time. Queued
//! operations replay in FIFO order after a successful reconnect, with
//! at-most-once delivery to the driver-supplied replay callback.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{ErrorKind, WalletError};
use crate::events::{ConnectorEvent, EventBus};
use crate::reliability::retry::{RetryConfig, RetryHooks, with_retry_if};

/// What woke the manager up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    VisibilityChange,
    NetworkOnline,
    WakeFromSleep,
    HeartbeatFailure,
    UserActivity,
}

impl ReconnectTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VisibilityChange => "visibility_change",
            Self::NetworkOnline => "network_online",
            Self::WakeFromSleep => "wake_from_sleep",
            Self::HeartbeatFailure => "heartbeat_failure",
            Self::UserActivity => "user_activity",
        }
    }
}

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Sign,
    Send,
    SignMessage,
    SignAndSend,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::Send => "send",
            Self::SignMessage => "sign_message",
            Self::SignAndSend => "sign_and_send",
        }
    }
}

/// Replay outcome delivered back through the queued operation's receiver.
pub type ReplayResult = Result<Option<serde_json::Value>, WalletError>;

struct QueuedOperation {
    id: u64,
    kind: OperationKind,
    payload: serde_json::Value,
    enqueued_at: Instant,
    retries: u32,
    max_retries: u32,
    tx: oneshot::Sender<ReplayResult>,
}

/// FIFO queue of operations awaiting replay.
#[derive(Default)]
pub struct OperationQueue {
    inner: Mutex<VecDeque<QueuedOperation>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an operation; the receiver resolves when it is replayed,
    /// cleared, or dropped.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
        max_retries: u32,
    ) -> oneshot::Receiver<ReplayResult> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().push_back(QueuedOperation {
            id,
            kind,
            payload,
            enqueued_at: Instant::now(),
            retries: 0,
            max_retries,
            tx,
        });
        debug!(op_id = id, kind = kind.as_str(), "Operation queued for replay");
        rx
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Reject everything with a user-cancelled error.
    pub fn clear(&self) {
        let drained: Vec<QueuedOperation> = self.inner.lock().unwrap().drain(..).collect();
        for op in drained {
            let _ = op.tx.send(Err(WalletError::new(
                ErrorKind::UserRejected,
                "queued operation cancelled",
            )));
        }
    }

    /// Replay everything in FIFO order. Each operation is removed from the
    /// queue before its callback result is delivered, so replay is
    /// at-most-once even if the process dies mid-loop. Failed operations
    /// with retry budget left are re-queued at the back.
    pub async fn replay<F, Fut>(&self, mut replay_fn: F)
    where
        F: FnMut(OperationKind, serde_json::Value) -> Fut,
        Fut: Future<Output = ReplayResult>,
    {
        loop {
            let Some(mut op) = self.inner.lock().unwrap().pop_front() else {
                break;
            };
            match replay_fn(op.kind, op.payload.clone()).await {
                Ok(value) => {
                    let _ = op.tx.send(Ok(value));
                }
                Err(error) => {
                    op.retries += 1;
                    if op.retries <= op.max_retries && error.kind.is_retryable() {
                        warn!(
                            op_id = op.id,
                            retries = op.retries,
                            "Replay failed, re-queueing"
                        );
                        self.inner.lock().unwrap().push_back(op);
                    } else {
                        let _ = op.tx.send(Err(error));
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Reentry window: a new attempt is refused this soon after the last.
    pub min_reconnect_interval: Duration,
    /// Debounce for visibility-change bursts.
    pub visibility_debounce: Duration,
    /// A recurring 10 s tick lagging by at least this much means the host
    /// slept.
    pub sleep_threshold: Duration,
    pub tick_interval: Duration,
    pub retry: RetryConfig,
    pub on_visibility_change: bool,
    pub on_network_online: bool,
    pub on_wake_from_sleep: bool,
    pub on_heartbeat_failure: bool,
    pub on_user_activity: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_reconnect_interval: Duration::from_secs(5),
            visibility_debounce: Duration::from_millis(300),
            sleep_threshold: Duration::from_secs(30),
            tick_interval: Duration::from_secs(10),
            retry: RetryConfig::default(),
            on_visibility_change: true,
            on_network_online: true,
            on_wake_from_sleep: true,
            on_heartbeat_failure: true,
            on_user_activity: false,
        }
    }
}

type ReconnectFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<(), WalletError>> + Send>> + Send + Sync,
>;
type ReplayFn = Arc<
    dyn Fn(OperationKind, serde_json::Value) -> Pin<Box<dyn Future<Output = ReplayResult> + Send>>
        + Send
        + Sync,
>;

/// Drives reconnect attempts for one wallet.
pub struct ReconnectionManager {
    config: ReconnectConfig,
    wallet_id: String,
    attempting: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    last_visibility: Mutex<Option<Instant>>,
    pub queue: Arc<OperationQueue>,
    reconnect_fn: ReconnectFn,
    replay_fn: ReplayFn,
    events: EventBus,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl ReconnectionManager {
    pub fn new(
        wallet_id: impl Into<String>,
        config: ReconnectConfig,
        events: EventBus,
        reconnect_fn: ReconnectFn,
        replay_fn: ReplayFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            wallet_id: wallet_id.into(),
            attempting: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            last_visibility: Mutex::new(None),
            queue: Arc::new(OperationQueue::new()),
            reconnect_fn,
            replay_fn,
            events,
            shutdown: Mutex::new(None),
        })
    }

    /// Default replay callback: resolve with no outcome. Real replay is
    /// supplied by the driver integration.
    pub fn null_replay() -> ReplayFn {
        Arc::new(|_, _| Box::pin(async { Ok(None) }))
    }

    /// Start the wake-from-sleep detection tick.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_tick = Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.config.tick_interval) => {
                        let lag = last_tick
                            .elapsed()
                            .saturating_sub(manager.config.tick_interval);
                        last_tick = Instant::now();
                        if lag >= manager.config.sleep_threshold {
                            info!(wallet_id = %manager.wallet_id, lag_ms = lag.as_millis() as u64, "Wake from sleep detected");
                            manager.notify_trigger(ReconnectTrigger::WakeFromSleep).await;
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
    }

    /// Feed a trigger. Returns true if a reconnect attempt actually ran.
    pub async fn notify_trigger(self: &Arc<Self>, trigger: ReconnectTrigger) -> bool {
        if !self.trigger_enabled(trigger) {
            return false;
        }

        if trigger == ReconnectTrigger::VisibilityChange {
            let mut last = self.last_visibility.lock().unwrap();
            if let Some(at) = *last
                && at.elapsed() < self.config.visibility_debounce
            {
                return false;
            }
            *last = Some(Instant::now());
        }

        // Single-flight: refuse reentry while attempting or inside the
        // minimum interval.
        if self.attempting.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let last = self.last_attempt.lock().unwrap();
            if let Some(at) = *last
                && at.elapsed() < self.config.min_reconnect_interval
            {
                self.attempting.store(false, Ordering::SeqCst);
                return false;
            }
        }

        let ran = self.attempt(trigger).await;
        *self.last_attempt.lock().unwrap() = Some(Instant::now());
        self.attempting.store(false, Ordering::SeqCst);
        ran
    }

    fn trigger_enabled(&self, trigger: ReconnectTrigger) -> bool {
        match trigger {
            ReconnectTrigger::VisibilityChange => self.config.on_visibility_change,
            ReconnectTrigger::NetworkOnline => self.config.on_network_online,
            ReconnectTrigger::WakeFromSleep => self.config.on_wake_from_sleep,
            ReconnectTrigger::HeartbeatFailure => self.config.on_heartbeat_failure,
            ReconnectTrigger::UserActivity => self.config.on_user_activity,
        }
    }

    async fn attempt(&self, trigger: ReconnectTrigger) -> bool {
        info!(
            wallet_id = %self.wallet_id,
            trigger = trigger.as_str(),
            queued = self.queue.len(),
            "Reconnect attempt starting"
        );

        let reconnect = Arc::clone(&self.reconnect_fn);
        let events = self.events.clone();
        let wallet_id = self.wallet_id.clone();
        let result = with_retry_if(
            &self.config.retry,
            move |attempt| {
                events.emit(&ConnectorEvent::ReconnectAttempt {
                    wallet_id: wallet_id.clone(),
                    attempt: attempt + 1,
                });
                reconnect()
            },
            |e| e.kind.is_retryable(),
            RetryHooks::default(),
        )
        .await;

        match result {
            Ok(()) => {
                info!(wallet_id = %self.wallet_id, "Reconnected, replaying queue");
                let replay = Arc::clone(&self.replay_fn);
                self.queue.replay(|kind, payload| replay(kind, payload)).await;
                true
            }
            Err(error) => {
                warn!(wallet_id = %self.wallet_id, error = %error, "Reconnect attempt failed");
                false
            }
        }
    }

    /// Destructive teardown: cancel timers and reject the queue.
    pub fn destroy(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        self.queue.clear();
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
