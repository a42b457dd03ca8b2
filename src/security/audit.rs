//! Audit log.
//!
//! Bounded in-memory ring of security-relevant events. Security-class
//! events always reach the structured console sink regardless of general
//! logging config. An optional remote sink flushes on a debounce timer and
//! re-queues failed batches at the head; an optional persistent mirror
//! keeps the last 100 events in durable storage.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::StorageBackend;
use crate::security::risk::RiskLevel;
use crate::storage::keys::StorageKeys;

/// Closed set of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "wallet:connect")]
    WalletConnect,
    #[serde(rename = "wallet:disconnect")]
    WalletDisconnect,
    #[serde(rename = "wallet:switch")]
    WalletSwitch,
    #[serde(rename = "tx:sign")]
    TxSign,
    #[serde(rename = "tx:broadcast")]
    TxBroadcast,
    #[serde(rename = "tx:blocked")]
    TxBlocked,
    #[serde(rename = "tx:failed")]
    TxFailed,
    #[serde(rename = "message:sign")]
    MessageSign,
    #[serde(rename = "security:violation")]
    SecurityViolation,
    #[serde(rename = "security:warning")]
    SecurityWarning,
    #[serde(rename = "rate:limited")]
    RateLimited,
    #[serde(rename = "session:create")]
    SessionCreate,
    #[serde(rename = "session:restore")]
    SessionRestore,
    #[serde(rename = "session:expire")]
    SessionExpire,
    #[serde(rename = "hardware:connect")]
    HardwareConnect,
    #[serde(rename = "hardware:disconnect")]
    HardwareDisconnect,
    #[serde(rename = "hardware:error")]
    HardwareError,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WalletConnect => "wallet:connect",
            Self::WalletDisconnect => "wallet:disconnect",
            Self::WalletSwitch => "wallet:switch",
            Self::TxSign => "tx:sign",
            Self::TxBroadcast => "tx:broadcast",
            Self::TxBlocked => "tx:blocked",
            Self::TxFailed => "tx:failed",
            Self::MessageSign => "message:sign",
            Self::SecurityViolation => "security:violation",
            Self::SecurityWarning => "security:warning",
            Self::RateLimited => "rate:limited",
            Self::SessionCreate => "session:create",
            Self::SessionRestore => "session:restore",
            Self::SessionExpire => "session:expire",
            Self::HardwareConnect => "hardware:connect",
            Self::HardwareDisconnect => "hardware:disconnect",
            Self::HardwareError => "hardware:error",
        }
    }

    /// Security-class events always hit the console sink.
    pub fn is_security_class(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation | Self::SecurityWarning | Self::TxBlocked | Self::RateLimited
        )
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp_ms: i64,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wallet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub risk: RiskLevel,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_agent: Option<String>,
}

/// Builder-style event input.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub wallet_id: Option<String>,
    pub account_id: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub risk: RiskLevel,
}

impl AuditEntry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn wallet(mut self, wallet_id: impl Into<String>) -> Self {
        self.wallet_id = Some(wallet_id.into());
        self
    }

    #[must_use]
    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    #[must_use]
    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    #[must_use]
    pub fn data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Query filter for [`AuditLog::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub types: Option<HashSet<AuditEventType>>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    pub wallet_id: Option<String>,
    pub account_id: Option<String>,
    pub risk: Option<HashSet<RiskLevel>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Ring capacity; on overflow the ring trims to half this.
    pub max_events: usize,
    /// Route every event (not just security-class) to the console sink.
    pub console: bool,
    pub remote_endpoint: Option<String>,
    /// Debounce between remote flushes.
    pub flush_interval: Duration,
    /// Mirror the most recent events into durable storage.
    pub persist: bool,
    pub persist_limit: usize,
    pub user_agent: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_events: 1000,
            console: false,
            remote_endpoint: None,
            flush_interval: Duration::from_secs(5),
            persist: false,
            persist_limit: 100,
            user_agent: None,
        }
    }
}

/// Process-wide append-only audit ring.
pub struct AuditLog {
    config: AuditConfig,
    session_id: String,
    ring: Mutex<VecDeque<AuditEvent>>,
    remote_buffer: Mutex<VecDeque<AuditEvent>>,
    storage: Option<Arc<dyn StorageBackend>>,
    keys: StorageKeys,
    http: reqwest::Client,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self::with_storage(config, None, StorageKeys::default())
    }

    pub fn with_storage(
        config: AuditConfig,
        storage: Option<Arc<dyn StorageBackend>>,
        keys: StorageKeys,
    ) -> Self {
        Self {
            config,
            session_id: Uuid::new_v4().to_string(),
            ring: Mutex::new(VecDeque::new()),
            remote_buffer: Mutex::new(VecDeque::new()),
            storage,
            keys,
            http: reqwest::Client::new(),
            shutdown: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append an event. Writers never block readers beyond the ring lock.
    pub fn record(&self, event_type: AuditEventType, entry: AuditEntry) -> AuditEvent {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp_ms: Utc::now().timestamp_millis(),
            event_type,
            wallet_id: entry.wallet_id,
            account_id: entry.account_id,
            data: entry.data,
            risk: entry.risk,
            session_id: self.session_id.clone(),
            user_agent: self.config.user_agent.clone(),
        };

        if event_type.is_security_class() {
            warn!(
                audit = event_type.as_str(),
                wallet_id = event.wallet_id.as_deref().unwrap_or(""),
                risk = event.risk.as_str(),
                data = %serde_json::Value::Object(event.data.clone()),
                "Security audit event"
            );
        } else if self.config.console {
            info!(
                audit = event_type.as_str(),
                wallet_id = event.wallet_id.as_deref().unwrap_or(""),
                "Audit event"
            );
        }

        {
            let mut ring = self.ring.lock().unwrap();
            ring.push_back(event.clone());
            if ring.len() > self.config.max_events {
                // Trim to half capacity, dropping oldest entries only.
                let keep = self.config.max_events / 2;
                let drop_count = ring.len() - keep;
                ring.drain(..drop_count);
            }
        }

        if self.config.remote_endpoint.is_some() {
            self.remote_buffer.lock().unwrap().push_back(event.clone());
        }

        event
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().unwrap().is_empty()
    }

    /// Filtered query over the ring, oldest first; `limit` keeps the most
    /// recent matches.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let ring = self.ring.lock().unwrap();
        let mut matches: Vec<AuditEvent> = ring
            .iter()
            .filter(|e| {
                query
                    .types
                    .as_ref()
                    .is_none_or(|types| types.contains(&e.event_type))
                    && query.from_ms.is_none_or(|from| e.timestamp_ms >= from)
                    && query.to_ms.is_none_or(|to| e.timestamp_ms <= to)
                    && query
                        .wallet_id
                        .as_ref()
                        .is_none_or(|w| e.wallet_id.as_ref() == Some(w))
                    && query
                        .account_id
                        .as_ref()
                        .is_none_or(|a| e.account_id.as_ref() == Some(a))
                    && query.risk.as_ref().is_none_or(|risk| risk.contains(&e.risk))
            })
            .cloned()
            .collect();

        if let Some(limit) = query.limit
            && matches.len() > limit
        {
            let drop_count = matches.len() - limit;
            matches.drain(..drop_count);
        }
        matches
    }

    pub fn export_json(&self) -> String {
        let ring = self.ring.lock().unwrap();
        serde_json::to_string_pretty(&ring.iter().collect::<Vec<_>>())
            .unwrap_or_else(|_| "[]".to_string())
    }

    pub fn export_csv(&self) -> String {
        fn escape(field: &str) -> String {
            if field.contains(',') || field.contains('"') || field.contains('\n') {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.to_string()
            }
        }

        let ring = self.ring.lock().unwrap();
        let mut out =
            String::from("id,timestampMs,type,walletId,accountId,risk,sessionId,data\n");
        for event in ring.iter() {
            let data = serde_json::Value::Object(event.data.clone()).to_string();
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                event.id,
                event.timestamp_ms,
                event.event_type.as_str(),
                escape(event.wallet_id.as_deref().unwrap_or("")),
                escape(event.account_id.as_deref().unwrap_or("")),
                event.risk.as_str(),
                event.session_id,
                escape(&data),
            ));
        }
        out
    }

    /// Start the debounced remote-flush / persistence timer.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let log = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(log.config.flush_interval) => {
                        log.flush_remote().await;
                        log.persist_mirror().await;
                    }
                    _ = rx.changed() => {
                        log.flush_remote().await;
                        log.persist_mirror().await;
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Flush the remote buffer as one batch. On failure the batch goes back
    /// to the head so ordering is preserved.
    pub async fn flush_remote(&self) {
        let Some(endpoint) = &self.config.remote_endpoint else {
            return;
        };
        let batch: Vec<AuditEvent> = {
            let mut buffer = self.remote_buffer.lock().unwrap();
            if buffer.is_empty() {
                return;
            }
            buffer.drain(..).collect()
        };

        let result = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({ "events": batch }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            warn!(error = %e, count = batch.len(), "Audit remote flush failed, re-queueing");
            let mut buffer = self.remote_buffer.lock().unwrap();
            for event in batch.into_iter().rev() {
                buffer.push_front(event);
            }
        }
    }

    /// Mirror the most recent events into durable storage.
    pub async fn persist_mirror(&self) {
        if !self.config.persist {
            return;
        }
        let Some(storage) = &self.storage else {
            return;
        };
        let recent: Vec<AuditEvent> = {
            let ring = self.ring.lock().unwrap();
            let skip = ring.len().saturating_sub(self.config.persist_limit);
            ring.iter().skip(skip).cloned().collect()
        };
        let Ok(json) = serde_json::to_string(&recent) else {
            return;
        };
        if let Err(e) = storage.set(&self.keys.audit_log(), json).await {
            warn!(error = %e, "Audit persistence failed");
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn remote_buffer_len(&self) -> usize {
        self.remote_buffer.lock().unwrap().len()
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_cap(cap: usize) -> AuditLog {
        AuditLog::new(AuditConfig {
            max_events: cap,
            ..Default::default()
        })
    }

    #[test]
    fn test_ring_trims_to_half_on_overflow() {
        let log = log_with_cap(10);
        for i in 0..11 {
            log.record(
                AuditEventType::TxSign,
                AuditEntry::new().data("seq", serde_json::json!(i)),
            );
        }
        assert_eq!(log.len(), 5);
        // Survivors are the newest, in original order.
        let events = log.query(&AuditQuery::default());
        let first = events.first().unwrap().data.get("seq").unwrap().as_i64().unwrap();
        let last = events.last().unwrap().data.get("seq").unwrap().as_i64().unwrap();
        assert_eq!(first, 6);
        assert_eq!(last, 10);
    }

    #[test]
    fn test_security_class_detection() {
        assert!(AuditEventType::SecurityViolation.is_security_class());
        assert!(AuditEventType::SecurityWarning.is_security_class());
        assert!(AuditEventType::TxBlocked.is_security_class());
        assert!(AuditEventType::RateLimited.is_security_class());
        assert!(!AuditEventType::WalletConnect.is_security_class());
        assert!(!AuditEventType::TxSign.is_security_class());
    }

    #[test]
    fn test_query_filters() {
        let log = log_with_cap(100);
        log.record(
            AuditEventType::WalletConnect,
            AuditEntry::new().wallet("a").account("alice.near"),
        );
        log.record(
            AuditEventType::TxSign,
            AuditEntry::new().wallet("a").risk(RiskLevel::High),
        );
        log.record(AuditEventType::TxSign, AuditEntry::new().wallet("b"));

        let by_type = log.query(&AuditQuery {
            types: Some([AuditEventType::TxSign].into()),
            ..Default::default()
        });
        assert_eq!(by_type.len(), 2);

        let by_wallet = log.query(&AuditQuery {
            wallet_id: Some("a".to_string()),
            ..Default::default()
        });
        assert_eq!(by_wallet.len(), 2);

        let by_risk = log.query(&AuditQuery {
            risk: Some([RiskLevel::High].into()),
            ..Default::default()
        });
        assert_eq!(by_risk.len(), 1);

        let limited = log.query(&AuditQuery {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].wallet_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_csv_export_escapes_fields() {
        let log = log_with_cap(10);
        log.record(
            AuditEventType::TxBlocked,
            AuditEntry::new()
                .wallet("a,b")
                .data("reason", serde_json::json!("has \"quotes\"")),
        );
        let csv = log.export_csv();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,timestampMs"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"a,b\""));
        assert!(row.contains("\"\""));
    }

    #[test]
    fn test_json_export_parses_back() {
        let log = log_with_cap(10);
        log.record(AuditEventType::SessionCreate, AuditEntry::new().wallet("w"));
        let parsed: Vec<AuditEvent> = serde_json::from_str(&log.export_json()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event_type, AuditEventType::SessionCreate);
        assert_eq!(parsed[0].session_id, log.session_id());
    }

    #[tokio::test]
    async fn test_persist_mirror_keeps_last_n() {
        use crate::storage::memory::MemoryStorage;

        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let keys = StorageKeys::default();
        let log = AuditLog::with_storage(
            AuditConfig {
                max_events: 100,
                persist: true,
                persist_limit: 3,
                ..Default::default()
            },
            Some(Arc::clone(&storage)),
            keys.clone(),
        );
        for _ in 0..5 {
            log.record(AuditEventType::TxSign, AuditEntry::new());
        }
        log.persist_mirror().await;

        let stored = storage.get(&keys.audit_log()).await.unwrap().unwrap();
        let events: Vec<AuditEvent> = serde_json::from_str(&stored).unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_remote_buffer_requeues_on_failure() {
        // Point at a closed port so the POST fails fast.
        let log = AuditLog::new(AuditConfig {
            remote_endpoint: Some("http://127.0.0.1:9/audit".to_string()),
            ..Default::default()
        });
        log.record(AuditEventType::TxSign, AuditEntry::new());
        log.record(AuditEventType::TxBroadcast, AuditEntry::new());
        assert_eq!(log.remote_buffer_len(), 2);
        log.flush_remote().await;
        assert_eq!(log.remote_buffer_len(), 2);
    }
}
