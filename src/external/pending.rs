//! Pending external request registry.
//!
//! Requests dispatched to out-of-process wallets are correlated back by an
//! opaque request id. Each entry holds resolve/reject continuations and a
//! deadline; a sweep rejects overdue entries with a timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{ErrorKind, WalletError};

/// Default request lifetime: five minutes.
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(5 * 60);

/// What an external request is asking the wallet to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalRequestKind {
    Connect,
    SignTransaction,
    SignMessage,
}

impl ExternalRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SignTransaction => "sign_transaction",
            Self::SignMessage => "sign_message",
        }
    }
}

/// Serializable snapshot of a pending request, persisted across redirects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub request_id: String,
    pub kind: ExternalRequestKind,
    pub wallet_id: String,
    pub enqueued_at_ms: i64,
    pub payload: serde_json::Value,
}

struct PendingEntry {
    kind: ExternalRequestKind,
    wallet_id: String,
    deadline: Instant,
    payload: serde_json::Value,
    tx: oneshot::Sender<Result<serde_json::Value, WalletError>>,
}

/// In-memory registry keyed by request id.
#[derive(Default)]
pub struct PendingRequestRegistry {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the receiver its resolution arrives on.
    pub fn register(
        &self,
        request_id: &str,
        kind: ExternalRequestKind,
        wallet_id: &str,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> oneshot::Receiver<Result<serde_json::Value, WalletError>> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            kind,
            wallet_id: wallet_id.to_string(),
            deadline: Instant::now() + ttl,
            payload,
            tx,
        };
        self.inner.lock().unwrap().insert(request_id.to_string(), entry);
        debug!(request_id, kind = kind.as_str(), wallet_id, "External request registered");
        rx
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn kind_of(&self, request_id: &str) -> Option<ExternalRequestKind> {
        self.inner.lock().unwrap().get(request_id).map(|e| e.kind)
    }

    /// Resolve a pending request. Returns false when the id is unknown
    /// (expired, replayed, or never ours).
    pub fn resolve(&self, request_id: &str, result: serde_json::Value) -> bool {
        match self.inner.lock().unwrap().remove(request_id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(result));
                true
            }
            None => {
                warn!(request_id, "Callback for unknown request id");
                false
            }
        }
    }

    pub fn reject(&self, request_id: &str, error: WalletError) -> bool {
        match self.inner.lock().unwrap().remove(request_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject everything past its deadline. Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, PendingEntry)> = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<String> = inner
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = expired.len();
        for (request_id, entry) in expired {
            warn!(request_id, wallet_id = %entry.wallet_id, "External request timed out");
            let _ = entry.tx.send(Err(WalletError::new(
                ErrorKind::ConnectionTimeout,
                format!("external request {request_id} timed out"),
            )
            .with_wallet(entry.wallet_id)));
        }
        count
    }

    /// Reject everything, e.g. on teardown.
    pub fn clear(&self) {
        let drained: Vec<PendingEntry> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(WalletError::new(
                ErrorKind::UserRejected,
                "pending request cancelled",
            )));
        }
    }

    /// Snapshot one entry for redirect persistence.
    pub fn snapshot(&self, request_id: &str) -> Option<PendingRecord> {
        let inner = self.inner.lock().unwrap();
        inner.get(request_id).map(|entry| PendingRecord {
            request_id: request_id.to_string(),
            kind: entry.kind,
            wallet_id: entry.wallet_id.clone(),
            enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
            payload: entry.payload.clone(),
        })
    }
}
