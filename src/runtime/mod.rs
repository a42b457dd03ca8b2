//! Connector runtime: the per-operation pipeline and the runtime-owned
//! mutable state.
//!
//! Every app-initiated operation runs the same gauntlet: rate limit ->
//! circuit breaker -> state-machine transition -> (risk analysis for
//! signing) -> driver dispatch under a timeout -> breaker bookkeeping,
//! state restore, and audit events. The runtime value owns all global
//! mutable state declared by the design: audit ring, rate buckets,
//! circuit entries, the connection state machine, and the per-tab secrets
//! inside the storage envelope.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::domain::{
    Account, ErrorKind, ExecutionOutcome, MultiAccountRecord, Nep413Payload, Network,
    SignInParams, SignedMessage, StorageBackend, TransactionParams, WalletDriver, WalletError,
    WalletSession,
};
use crate::events::{ConnectorEvent, EventBus};
use crate::reliability::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::reliability::retry::RetryConfig;
use crate::reliability::state_machine::{
    ConnectionState, ConnectionStateMachine, StateMachineConfig,
};
use crate::reliability::timeout::with_timeout;
use crate::security::audit::{AuditConfig, AuditEntry, AuditEventType, AuditLog};
use crate::security::rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
use crate::security::risk::{RiskAnalyzer, RiskConfig, RiskLevel};
use crate::storage::envelope::{SecureStorage, SetOptions};
use crate::storage::keys::StorageKeys;

/// Cancellation token observed by long-running operations.
#[derive(Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling; never fire.
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending().await,
        }
    }
}

/// Cancels the paired [`CancelToken`]. Pending continuations reject with a
/// user-cancelled error; device sessions are left open.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub namespace: String,
    pub network: Network,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    /// Relaxed deadline for signing paths (user interaction).
    pub sign_timeout: Duration,
    pub session_max_age_secs: i64,
    pub risk: RiskConfig,
    pub audit: AuditConfig,
    pub state_machine: StateMachineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: crate::storage::keys::DEFAULT_NAMESPACE.to_string(),
            network: Network::Mainnet,
            rate_limit: RateLimitConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            sign_timeout: Duration::from_secs(300),
            session_max_age_secs: crate::domain::DEFAULT_SESSION_MAX_AGE_SECS,
            risk: RiskConfig::default(),
            audit: AuditConfig::default(),
            state_machine: StateMachineConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        use std::env;

        let mut config = Self::default();
        if let Some(network) = env::var("CONNECT_NETWORK").ok().and_then(|v| v.parse().ok()) {
            config.network = network;
        }
        if let Ok(namespace) = env::var("CONNECT_STORAGE_NAMESPACE") {
            config.namespace = namespace;
        }
        config.rate_limit = RateLimitConfig::from_env();
        config.circuit = CircuitBreakerConfig::from_env();
        config.retry = RetryConfig::from_env();
        config
    }
}

/// The connector runtime.
pub struct ConnectorRuntime {
    config: RuntimeConfig,
    events: EventBus,
    state: ConnectionStateMachine,
    breaker: CircuitBreaker,
    rate: RateLimiter,
    risk: RiskAnalyzer,
    audit: Arc<AuditLog>,
    secure: Arc<SecureStorage>,
    drivers: RwLock<HashMap<String, Arc<dyn WalletDriver>>>,
    /// Keeps the audit bridge subscribed for the runtime's lifetime.
    _audit_bridge: crate::events::EventSubscription,
}

impl ConnectorRuntime {
    pub fn new(
        config: RuntimeConfig,
        durable: Arc<dyn StorageBackend>,
        session_store: Arc<dyn StorageBackend>,
    ) -> Arc<Self> {
        let keys = StorageKeys::new(config.namespace.clone());
        let events = EventBus::new();
        let secure = Arc::new(SecureStorage::new(durable, session_store, keys.clone()));
        let audit = Arc::new(AuditLog::with_storage(
            config.audit.clone(),
            Some(Arc::clone(secure.backend())),
            keys,
        ));
        let audit_bridge = Self::bridge_events_to_audit(&events, Arc::clone(&audit));

        Arc::new(Self {
            state: ConnectionStateMachine::new(config.state_machine.clone())
                .with_events(events.clone()),
            breaker: CircuitBreaker::new(config.circuit.clone()),
            rate: RateLimiter::new(config.rate_limit.clone()),
            risk: RiskAnalyzer::new(config.risk.clone()),
            audit,
            secure,
            drivers: RwLock::new(HashMap::new()),
            _audit_bridge: audit_bridge,
            events,
            config,
        })
    }

    /// Route hardware lifecycle and security-relevant bus events into the
    /// audit trail.
    fn bridge_events_to_audit(
        events: &EventBus,
        audit: Arc<AuditLog>,
    ) -> crate::events::EventSubscription {
        events.subscribe_all(move |event| match event {
            ConnectorEvent::Hardware(device_event) => {
                let audit_type = match device_event.kind {
                    crate::events::DeviceEventKind::Connected => AuditEventType::HardwareConnect,
                    crate::events::DeviceEventKind::Disconnected => {
                        AuditEventType::HardwareDisconnect
                    }
                    _ => return,
                };
                audit.record(
                    audit_type,
                    AuditEntry::new()
                        .wallet(device_event.wallet_id.clone())
                        .data("action", serde_json::json!(device_event.action.as_str())),
                );
            }
            ConnectorEvent::WalletError { wallet_id, kind, message } => {
                if kind.is_hardware() {
                    let mut entry = AuditEntry::new()
                        .risk(RiskLevel::Medium)
                        .data("kind", serde_json::json!(kind.code()))
                        .data("message", serde_json::json!(message));
                    if let Some(wallet_id) = wallet_id {
                        entry = entry.wallet(wallet_id.clone());
                    }
                    audit.record(AuditEventType::HardwareError, entry);
                } else if *kind == crate::domain::ErrorKind::SandboxBlocked {
                    let mut entry = AuditEntry::new()
                        .risk(RiskLevel::High)
                        .data("message", serde_json::json!(message));
                    if let Some(wallet_id) = wallet_id {
                        entry = entry.wallet(wallet_id.clone());
                    }
                    audit.record(AuditEventType::SecurityViolation, entry);
                }
            }
            _ => {}
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &ConnectionStateMachine {
        &self.state
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn risk(&self) -> &RiskAnalyzer {
        &self.risk
    }

    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.secure
    }

    pub fn register_driver(&self, driver: Arc<dyn WalletDriver>) {
        self.drivers
            .write()
            .unwrap()
            .insert(driver.wallet_id().to_string(), driver);
    }

    fn driver(&self, wallet_id: &str) -> Result<Arc<dyn WalletDriver>, WalletError> {
        self.drivers
            .read()
            .unwrap()
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| {
                WalletError::new(
                    ErrorKind::WalletNotFound,
                    format!("no driver registered for wallet {wallet_id}"),
                )
                .with_wallet(wallet_id)
            })
    }

    // ========================================================================
    // Pipeline gates
    // ========================================================================

    fn gate_rate(&self, action: &str) -> Result<(), WalletError> {
        match self.rate.check(action) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after } => {
                let retry_ms = retry_after.as_millis() as u64;
                self.audit.record(
                    AuditEventType::RateLimited,
                    AuditEntry::new()
                        .risk(RiskLevel::Medium)
                        .data("action", serde_json::json!(action))
                        .data("retryAfterMs", serde_json::json!(retry_ms)),
                );
                self.events.emit(&ConnectorEvent::RateLimited {
                    action: action.to_string(),
                    retry_after_ms: retry_ms,
                });
                Err(WalletError::new(
                    ErrorKind::ConnectionTimeout,
                    format!("rate limit exceeded for {action}, retry in {retry_ms}ms"),
                ))
            }
        }
    }

    fn gate_breaker(&self, wallet_id: &str) -> Result<(), WalletError> {
        if self.breaker.is_allowed(wallet_id) {
            Ok(())
        } else {
            Err(self.breaker.rejection(wallet_id))
        }
    }

    async fn dispatch<T>(
        &self,
        operation: impl Future<Output = Result<T, WalletError>>,
        timeout: Duration,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<T, WalletError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WalletError::new(
                ErrorKind::UserRejected,
                format!("{name} cancelled"),
            )),
            result = with_timeout(operation, timeout, name) => result,
        }
    }

    fn settle_breaker(&self, wallet_id: &str, error: &WalletError) {
        // User rejections are user action, not wallet failure.
        if error.kind == ErrorKind::UserRejected {
            self.breaker.release_probe(wallet_id);
        } else {
            self.breaker.record_failure(wallet_id);
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Connect a wallet: the driver signs in, the session is persisted, and
    /// the state machine lands in `Connected`.
    #[instrument(skip_all, fields(wallet_id))]
    pub async fn connect(
        &self,
        wallet_id: &str,
        params: SignInParams,
        cancel: &CancelToken,
    ) -> Result<Vec<Account>, WalletError> {
        self.gate_rate("connect")?;
        self.gate_breaker(wallet_id)?;
        let driver = self.driver(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;

        if let Err(e) = self
            .state
            .transition(ConnectionState::connecting(wallet_id), "connect requested")
        {
            self.breaker.release_probe(wallet_id);
            return Err(e);
        }

        let result = self
            .dispatch(
                driver.sign_in(params),
                self.config.connect_timeout,
                "connect",
                cancel,
            )
            .await;

        match result {
            Ok(accounts) => {
                self.breaker.record_success(wallet_id);
                self.state.transition(
                    ConnectionState::connected(wallet_id, accounts.clone()),
                    "sign-in complete",
                )?;
                self.persist_connection(wallet_id, &accounts).await;

                self.audit.record(
                    AuditEventType::WalletConnect,
                    AuditEntry::new()
                        .wallet(wallet_id)
                        .account(accounts.first().map(|a| a.account_id.clone()).unwrap_or_default()),
                );
                self.audit.record(
                    AuditEventType::SessionCreate,
                    AuditEntry::new().wallet(wallet_id),
                );
                self.events.emit(&ConnectorEvent::WalletConnected {
                    wallet_id: wallet_id.to_string(),
                    accounts: accounts.clone(),
                });
                info!(wallet_id, count = accounts.len(), "Wallet connected");
                Ok(accounts)
            }
            Err(error) => {
                self.settle_breaker(wallet_id, &error);
                let next = if error.kind == ErrorKind::UserRejected {
                    ConnectionState::Idle
                } else {
                    ConnectionState::error(Some(wallet_id.to_string()), error.message.clone())
                };
                let _ = self.state.transition(next, "connect failed");
                self.events.emit(&ConnectorEvent::WalletError {
                    wallet_id: Some(wallet_id.to_string()),
                    kind: error.kind,
                    message: error.message.clone(),
                });
                Err(error.with_wallet(wallet_id))
            }
        }
    }

    /// Disconnect the current wallet and clear persisted session state.
    #[instrument(skip_all, fields(wallet_id))]
    pub async fn disconnect(&self, wallet_id: &str) -> Result<(), WalletError> {
        let driver = self.driver(wallet_id)?;
        self.state
            .transition(ConnectionState::disconnecting(wallet_id), "sign-out requested")?;

        let result = driver.sign_out().await;
        if let Err(e) = &result {
            warn!(wallet_id, error = %e, "Driver sign-out failed, clearing session anyway");
        }

        let keys = self.secure.keys().clone();
        let _ = self.secure.remove(&keys.session()).await;
        let _ = self.secure.remove(&keys.state()).await;
        let _ = self.secure.remove(&keys.accounts()).await;

        self.state.transition(ConnectionState::Idle, "signed out")?;
        self.audit.record(
            AuditEventType::WalletDisconnect,
            AuditEntry::new().wallet(wallet_id),
        );
        self.events.emit(&ConnectorEvent::WalletDisconnected {
            wallet_id: wallet_id.to_string(),
        });
        Ok(())
    }

    /// Disconnect the current wallet and connect another in one operation.
    #[instrument(skip_all, fields(from = %from_wallet_id, to = %to_wallet_id))]
    pub async fn switch_wallet(
        &self,
        from_wallet_id: &str,
        to_wallet_id: &str,
        params: SignInParams,
        cancel: &CancelToken,
    ) -> Result<Vec<Account>, WalletError> {
        self.disconnect(from_wallet_id).await?;
        let accounts = self.connect(to_wallet_id, params, cancel).await?;
        self.audit.record(
            AuditEventType::WalletSwitch,
            AuditEntry::new()
                .wallet(to_wallet_id)
                .data("from", serde_json::json!(from_wallet_id)),
        );
        Ok(accounts)
    }

    /// Sign and send one transaction through the full pipeline.
    #[instrument(skip_all, fields(wallet_id, receiver = %params.receiver_id))]
    pub async fn sign_and_send_transaction(
        &self,
        wallet_id: &str,
        params: TransactionParams,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, WalletError> {
        self.gate_rate("sign")?;
        self.gate_breaker(wallet_id)?;
        let driver = self.driver(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;

        let connected = self.connected_accounts(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;
        if let Err(e) = self.state.transition(
            ConnectionState::signing(wallet_id, "signAndSendTransaction"),
            "sign requested",
        ) {
            self.breaker.release_probe(wallet_id);
            return Err(e);
        }

        // Risk gate: critical blocks before the driver ever sees it.
        let validation = self.risk.validate(&params.receiver_id, &params.actions);
        if !validation.valid {
            self.breaker.release_probe(wallet_id);
            self.audit.record(
                AuditEventType::TxBlocked,
                AuditEntry::new()
                    .wallet(wallet_id)
                    .risk(validation.risk.level)
                    .data("receiverId", serde_json::json!(params.receiver_id))
                    .data("reasons", serde_json::json!(validation.risk.reasons)),
            );
            self.events.emit(&ConnectorEvent::TransactionBlocked {
                wallet_id: wallet_id.to_string(),
                reasons: validation.risk.reasons.clone(),
            });
            self.state.transition(
                ConnectionState::connected(wallet_id, connected.clone()),
                "transaction blocked",
            )?;
            return Err(WalletError::new(
                ErrorKind::InvalidTransaction,
                validation.error.unwrap_or_else(|| "transaction blocked".to_string()),
            )
            .with_wallet(wallet_id));
        }

        let result = self
            .dispatch(
                driver.sign_and_send_transaction(params.clone()),
                self.config.sign_timeout,
                "signAndSendTransaction",
                cancel,
            )
            .await;

        match result {
            Ok(outcome) => {
                self.breaker.record_success(wallet_id);
                self.state.transition(
                    ConnectionState::connected(wallet_id, connected),
                    "transaction sent",
                )?;
                self.audit.record(
                    AuditEventType::TxSign,
                    AuditEntry::new()
                        .wallet(wallet_id)
                        .risk(validation.risk.level)
                        .data("receiverId", serde_json::json!(params.receiver_id)),
                );
                self.audit.record(
                    AuditEventType::TxBroadcast,
                    AuditEntry::new()
                        .wallet(wallet_id)
                        .data("transactionHash", serde_json::json!(outcome.transaction_hash)),
                );
                Ok(outcome)
            }
            Err(error) => {
                self.settle_breaker(wallet_id, &error);
                self.audit.record(
                    AuditEventType::TxFailed,
                    AuditEntry::new()
                        .wallet(wallet_id)
                        .data("kind", serde_json::json!(error.kind.code()))
                        .data("receiverId", serde_json::json!(params.receiver_id)),
                );
                let next = if error.kind == ErrorKind::UserRejected {
                    ConnectionState::connected(wallet_id, connected)
                } else {
                    ConnectionState::error(Some(wallet_id.to_string()), error.message.clone())
                };
                let _ = self.state.transition(next, "transaction failed");
                self.events.emit(&ConnectorEvent::WalletError {
                    wallet_id: Some(wallet_id.to_string()),
                    kind: error.kind,
                    message: error.message.clone(),
                });
                Err(error.with_wallet(wallet_id))
            }
        }
    }

    /// Sign and send a batch. Each transaction passes the risk gate before
    /// any is dispatched.
    pub async fn sign_and_send_transactions(
        &self,
        wallet_id: &str,
        batch: Vec<TransactionParams>,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionOutcome>, WalletError> {
        self.gate_rate("sign")?;
        self.gate_breaker(wallet_id)?;
        let driver = self.driver(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;

        for params in &batch {
            let validation = self.risk.validate(&params.receiver_id, &params.actions);
            if !validation.valid {
                self.breaker.release_probe(wallet_id);
                self.audit.record(
                    AuditEventType::TxBlocked,
                    AuditEntry::new()
                        .wallet(wallet_id)
                        .risk(validation.risk.level)
                        .data("receiverId", serde_json::json!(params.receiver_id)),
                );
                return Err(WalletError::new(
                    ErrorKind::InvalidTransaction,
                    validation.error.unwrap_or_default(),
                )
                .with_wallet(wallet_id));
            }
        }

        let connected = self.connected_accounts(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;
        self.state.transition(
            ConnectionState::signing(wallet_id, "signAndSendTransactions"),
            "batch sign requested",
        )?;

        let result = self
            .dispatch(
                driver.sign_and_send_transactions(batch),
                self.config.sign_timeout,
                "signAndSendTransactions",
                cancel,
            )
            .await;

        match result {
            Ok(outcomes) => {
                self.breaker.record_success(wallet_id);
                self.state.transition(
                    ConnectionState::connected(wallet_id, connected),
                    "batch sent",
                )?;
                for outcome in &outcomes {
                    self.audit.record(
                        AuditEventType::TxBroadcast,
                        AuditEntry::new()
                            .wallet(wallet_id)
                            .data("transactionHash", serde_json::json!(outcome.transaction_hash)),
                    );
                }
                Ok(outcomes)
            }
            Err(error) => {
                self.settle_breaker(wallet_id, &error);
                let next = if error.kind == ErrorKind::UserRejected {
                    ConnectionState::connected(wallet_id, connected)
                } else {
                    ConnectionState::error(Some(wallet_id.to_string()), error.message.clone())
                };
                let _ = self.state.transition(next, "batch failed");
                Err(error.with_wallet(wallet_id))
            }
        }
    }

    /// Sign a NEP-413 message.
    #[instrument(skip_all, fields(wallet_id))]
    pub async fn sign_message(
        &self,
        wallet_id: &str,
        payload: Nep413Payload,
        cancel: &CancelToken,
    ) -> Result<SignedMessage, WalletError> {
        self.gate_rate("sign")?;
        self.gate_breaker(wallet_id)?;
        let driver = self.driver(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;

        let connected = self.connected_accounts(wallet_id).inspect_err(|_| {
            self.breaker.release_probe(wallet_id);
        })?;
        self.state.transition(
            ConnectionState::signing(wallet_id, "signMessage"),
            "message sign requested",
        )?;

        let result = self
            .dispatch(
                driver.sign_message(payload),
                self.config.sign_timeout,
                "signMessage",
                cancel,
            )
            .await;

        match result {
            Ok(signed) => {
                self.breaker.record_success(wallet_id);
                self.state.transition(
                    ConnectionState::connected(wallet_id, connected),
                    "message signed",
                )?;
                self.audit.record(
                    AuditEventType::MessageSign,
                    AuditEntry::new().wallet(wallet_id).account(signed.account_id.clone()),
                );
                Ok(signed)
            }
            Err(error) => {
                self.settle_breaker(wallet_id, &error);
                let next = if error.kind == ErrorKind::UserRejected {
                    ConnectionState::connected(wallet_id, connected)
                } else {
                    ConnectionState::error(Some(wallet_id.to_string()), error.message.clone())
                };
                let _ = self.state.transition(next, "message sign failed");
                Err(error.with_wallet(wallet_id))
            }
        }
    }

    /// Restore a persisted session. The state machine only elevates to
    /// `Connected` after the driver confirms the accounts are still there.
    #[instrument(skip_all)]
    pub async fn restore_session(&self) -> Result<Option<Vec<Account>>, WalletError> {
        let session_key = self.secure.keys().session();
        let session: WalletSession = match self.secure.get(&session_key).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(_) => {
                // Corrupt record was already dropped by the envelope.
                return Ok(None);
            }
        };

        if let Err(e) = session.check(self.config.session_max_age_secs) {
            self.audit.record(
                AuditEventType::SessionExpire,
                AuditEntry::new().wallet(session.wallet_id.clone()),
            );
            let _ = self.secure.remove(&session_key).await;
            warn!(wallet_id = %session.wallet_id, error = %e, "Dropping stale session");
            return Ok(None);
        }

        let driver = self.driver(&session.wallet_id)?;
        self.state.transition(
            ConnectionState::connecting(&session.wallet_id),
            "session restore",
        )?;

        match driver.get_accounts().await {
            Ok(accounts) if !accounts.is_empty() => {
                self.state.transition(
                    ConnectionState::connected(&session.wallet_id, accounts.clone()),
                    "session restored",
                )?;
                self.audit.record(
                    AuditEventType::SessionRestore,
                    AuditEntry::new().wallet(session.wallet_id.clone()),
                );
                Ok(Some(accounts))
            }
            Ok(_) => {
                let _ = self.secure.remove(&session_key).await;
                self.state.transition(ConnectionState::Idle, "no accounts on restore")?;
                Ok(None)
            }
            Err(error) => {
                let _ = self.state.transition(
                    ConnectionState::error(Some(session.wallet_id.clone()), error.message.clone()),
                    "restore failed",
                );
                Err(error)
            }
        }
    }

    /// Another tab updated the shared session record. This invalidates our
    /// cached view only; it is never proof the wallet is live here.
    pub fn apply_remote_session_update(&self, wallet_id: &str) {
        self.events.emit(&ConnectorEvent::SessionUpdated {
            wallet_id: wallet_id.to_string(),
        });
    }

    fn connected_accounts(&self, wallet_id: &str) -> Result<Vec<Account>, WalletError> {
        match self.state.current() {
            ConnectionState::Connected {
                wallet_id: current,
                accounts,
                ..
            } if current == wallet_id => Ok(accounts),
            ConnectionState::Connected { wallet_id: other, .. } => Err(WalletError::new(
                ErrorKind::NoActiveSession,
                format!("connected to {other}, not {wallet_id}"),
            )),
            state => Err(WalletError::new(
                ErrorKind::NoActiveSession,
                format!("no active connection (state {})", state.name()),
            )),
        }
    }

    async fn persist_connection(&self, wallet_id: &str, accounts: &[Account]) {
        let keys = self.secure.keys().clone();
        let session = WalletSession::new(wallet_id, accounts.to_vec(), self.config.network);
        if let Err(e) = self
            .secure
            .set(&keys.session(), &session, SetOptions::encrypted())
            .await
        {
            warn!(error = %e, "Session persistence failed");
        }

        let record = MultiAccountRecord {
            accounts: accounts.to_vec(),
            active_account_id: accounts.first().map(|a| a.account_id.clone()),
        };
        if let Err(e) = self
            .secure
            .set(&keys.accounts(), &record, SetOptions::default())
            .await
        {
            warn!(error = %e, "Account record persistence failed");
        }

        if let Some(state_json) = self.state.to_persisted()
            && let Err(e) = self.secure.backend().set(&keys.state(), state_json).await
        {
            warn!(error = %e, "State persistence failed");
        }
    }
}
