//! External-wallet orchestrator.
//!
//! Routes requests to out-of-process wallets over three transports: deep
//! links, WalletConnect, and redirect flows. Callbacks are correlated by
//! request id from URL parameters or origin-guarded wallet messages; page
//! load resumes at most one redirect-persisted request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::domain::{
    Account, ErrorKind, ExecutionOutcome, Nep413Payload, Network, StorageBackend,
    TransactionParams, WalletError, WalletManifest,
};
use crate::events::{ConnectorEvent, EventBus};
use crate::external::deeplink::{
    CallbackParams, DeepLinkContext, build_connect_url, build_sign_message_url, build_sign_url,
    parse_callback_url,
};
use crate::external::pending::{
    DEFAULT_REQUEST_TTL, ExternalRequestKind, PendingRecord, PendingRequestRegistry,
};
use crate::external::walletconnect::WalletConnectConnector;
use crate::security::origin::OriginGuard;
use crate::storage::envelope::{SecureStorage, SetOptions};

/// Host platform class; gates which transports are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Desktop,
    MobileIos,
    MobileAndroid,
}

impl Platform {
    /// Detect from a user-agent string.
    pub fn detect(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod") {
            Platform::MobileIos
        } else if ua.contains("android") {
            Platform::MobileAndroid
        } else {
            Platform::Desktop
        }
    }

    pub fn is_mobile(&self) -> bool {
        !matches!(self, Platform::Desktop)
    }
}

/// Transports the orchestrator can route through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalTransport {
    DeepLink,
    Redirect,
    WalletConnect,
}

/// Cached external session: `{walletId, accounts, timestamp}`, 24 h TTL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSessionCache {
    pub wallet_id: String,
    pub accounts: Vec<Account>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ExternalWalletConfig {
    pub app_name: String,
    pub network: Network,
    /// Base URL wallet callbacks return to.
    pub callback_base: String,
    pub request_ttl: Duration,
    /// Focus retained this long after a deep-link dispatch suggests the
    /// scheme was not handled.
    pub hint_delay: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ExternalWalletConfig {
    fn default() -> Self {
        Self {
            app_name: "near-connect".to_string(),
            network: Network::Mainnet,
            callback_base: "https://localhost/callback".to_string(),
            request_ttl: DEFAULT_REQUEST_TTL,
            hint_delay: Duration::from_millis(1500),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// A dispatched external request: the URL to open plus the receiver its
/// resolution arrives on.
pub struct DispatchedRequest {
    pub request_id: String,
    pub url: Url,
    pub receiver: oneshot::Receiver<Result<serde_json::Value, WalletError>>,
}

/// A redirect request resumed on page load.
pub struct ResumedRequest {
    pub record: PendingRecord,
    pub outcome: Result<serde_json::Value, WalletError>,
}

pub struct ExternalWalletOrchestrator {
    config: ExternalWalletConfig,
    platform: Platform,
    registry: Arc<PendingRequestRegistry>,
    origin_guard: Arc<OriginGuard>,
    durable: Arc<SecureStorage>,
    session_store: Arc<dyn StorageBackend>,
    wallet_connect: Option<WalletConnectConnector>,
    events: EventBus,
    focused: AtomicBool,
    shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl ExternalWalletOrchestrator {
    pub fn new(
        config: ExternalWalletConfig,
        platform: Platform,
        origin_guard: Arc<OriginGuard>,
        durable: Arc<SecureStorage>,
        session_store: Arc<dyn StorageBackend>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            platform,
            registry: Arc::new(PendingRequestRegistry::new()),
            origin_guard,
            durable,
            session_store,
            wallet_connect: None,
            events,
            focused: AtomicBool::new(true),
            shutdown: std::sync::Mutex::new(None),
        })
    }

    /// Attach a WalletConnect connector (available on every platform).
    pub fn with_wallet_connect(self: Arc<Self>, connector: WalletConnectConnector) -> Arc<Self> {
        // Sole owner at construction time.
        let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| {
            panic!("with_wallet_connect must be called before sharing the orchestrator")
        });
        this.wallet_connect = Some(connector);
        Arc::new(this)
    }

    pub fn registry(&self) -> &Arc<PendingRequestRegistry> {
        &self.registry
    }

    /// The host reports focus transitions here.
    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    /// Which transports fit this wallet in this environment. Deep links
    /// and redirects are mobile-only; WalletConnect works everywhere.
    pub fn transports_for(&self, manifest: &WalletManifest) -> Vec<ExternalTransport> {
        let mut transports = Vec::new();
        if self.platform.is_mobile() && manifest.deep_link.is_some() {
            transports.push(ExternalTransport::DeepLink);
            transports.push(ExternalTransport::Redirect);
        }
        if manifest.wallet_connect.is_some() || manifest.permissions.wallet_connect {
            transports.push(ExternalTransport::WalletConnect);
        }
        transports
    }

    fn deep_link_config<'m>(
        &self,
        manifest: &'m WalletManifest,
    ) -> Result<&'m crate::domain::DeepLinkConfig, WalletError> {
        manifest.deep_link.as_ref().ok_or_else(|| {
            WalletError::new(
                ErrorKind::InvalidManifest,
                format!("wallet {} declares no deep-link config", manifest.id),
            )
        })
    }

    fn dispatch(
        self: &Arc<Self>,
        manifest: &WalletManifest,
        kind: ExternalRequestKind,
        payload: serde_json::Value,
        url: Url,
        request_id: String,
    ) -> DispatchedRequest {
        let receiver = self.registry.register(
            &request_id,
            kind,
            &manifest.id,
            payload,
            self.config.request_ttl,
        );

        // If focus never leaves the app, the scheme was likely unhandled.
        let orchestrator = Arc::clone(self);
        let hint_id = request_id.clone();
        let wallet_id = manifest.id.clone();
        let app_store_url = manifest
            .deep_link
            .as_ref()
            .and_then(|d| d.app_store_url.clone().or_else(|| d.play_store_url.clone()));
        tokio::spawn(async move {
            tokio::time::sleep(orchestrator.config.hint_delay).await;
            if orchestrator.focused.load(Ordering::SeqCst)
                && orchestrator.registry.contains(&hint_id)
            {
                debug!(wallet_id = %wallet_id, "Deep link appears unhandled, hinting app install");
                orchestrator.events.emit(&ConnectorEvent::AppNotInstalledHint {
                    wallet_id,
                    app_store_url,
                });
            }
        });

        DispatchedRequest {
            request_id,
            url,
            receiver,
        }
    }

    fn context<'a>(&'a self, request_id: &'a str, callback: &'a str) -> DeepLinkContext<'a> {
        DeepLinkContext {
            callback_url: callback,
            request_id,
            network: self.config.network,
            app_name: &self.config.app_name,
        }
    }

    /// Build and register a deep-link connect request.
    pub fn request_connect(
        self: &Arc<Self>,
        manifest: &WalletManifest,
    ) -> Result<DispatchedRequest, WalletError> {
        let request_id = Uuid::new_v4().to_string();
        let callback = self
            .origin_guard
            .generate_secure_callback(&self.config.callback_base, &request_id)?;
        let url = build_connect_url(
            self.deep_link_config(manifest)?,
            &self.context(&request_id, &callback),
        )?;
        Ok(self.dispatch(
            manifest,
            ExternalRequestKind::Connect,
            serde_json::json!({}),
            url,
            request_id,
        ))
    }

    /// Build and register a deep-link sign-transaction request.
    pub fn request_sign(
        self: &Arc<Self>,
        manifest: &WalletManifest,
        transaction: &TransactionParams,
    ) -> Result<DispatchedRequest, WalletError> {
        let request_id = Uuid::new_v4().to_string();
        let callback = self
            .origin_guard
            .generate_secure_callback(&self.config.callback_base, &request_id)?;
        let url = build_sign_url(
            self.deep_link_config(manifest)?,
            &self.context(&request_id, &callback),
            transaction,
        )?;
        let payload = serde_json::to_value(transaction).unwrap_or_default();
        Ok(self.dispatch(manifest, ExternalRequestKind::SignTransaction, payload, url, request_id))
    }

    /// Build and register a deep-link sign-message request.
    pub fn request_sign_message(
        self: &Arc<Self>,
        manifest: &WalletManifest,
        payload: &Nep413Payload,
    ) -> Result<DispatchedRequest, WalletError> {
        let request_id = Uuid::new_v4().to_string();
        let callback = self
            .origin_guard
            .generate_secure_callback(&self.config.callback_base, &request_id)?;
        let url = build_sign_message_url(
            self.deep_link_config(manifest)?,
            &self.context(&request_id, &callback),
            payload,
        )?;
        let value = serde_json::to_value(payload).unwrap_or_default();
        Ok(self.dispatch(manifest, ExternalRequestKind::SignMessage, value, url, request_id))
    }

    // ========================================================================
    // Redirect flows
    // ========================================================================

    /// Persist the pending request into session storage before the page
    /// navigates away. The request id is the correlation token on return.
    pub async fn begin_redirect(
        self: &Arc<Self>,
        request: &DispatchedRequest,
    ) -> Result<(), WalletError> {
        let record = self.registry.snapshot(&request.request_id).ok_or_else(|| {
            WalletError::new(ErrorKind::UnknownError, "request vanished before redirect")
        })?;
        let json = serde_json::to_string(&record).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("pending record encode: {e}"))
        })?;
        self.session_store
            .set(&self.durable.keys().pending_request(), json)
            .await
    }

    /// Page-load resume: merge the persisted pending record with the
    /// callback parameters on the current URL. At most one request resumes.
    pub async fn resume_pending(
        self: &Arc<Self>,
        current_url: &str,
    ) -> Result<Option<ResumedRequest>, WalletError> {
        let key = self.durable.keys().pending_request();
        let Some(json) = self.session_store.get(&key).await? else {
            return Ok(None);
        };
        self.session_store.remove(&key).await?;

        let record: PendingRecord = serde_json::from_str(&json).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("pending record parse: {e}"))
        })?;

        let Some(params) = parse_callback_url(current_url)? else {
            return Ok(Some(ResumedRequest {
                outcome: Err(WalletError::new(
                    ErrorKind::UserRejected,
                    "returned without a wallet callback",
                )),
                record,
            }));
        };
        if params.request_id != record.request_id {
            warn!(
                expected = %record.request_id,
                got = %params.request_id,
                "Redirect callback id mismatch"
            );
            return Ok(Some(ResumedRequest {
                outcome: Err(WalletError::new(
                    ErrorKind::InvalidData,
                    "callback does not match the pending request",
                )),
                record,
            }));
        }

        let outcome = self.outcome_from(&params, &record.wallet_id);
        info!(request_id = %record.request_id, "Resumed redirect request");
        Ok(Some(ResumedRequest { record, outcome }))
    }

    // ========================================================================
    // Callback ingestion
    // ========================================================================

    fn outcome_from(
        &self,
        params: &CallbackParams,
        wallet_id: &str,
    ) -> Result<serde_json::Value, WalletError> {
        if let Some(state) = &params.state {
            if !self.origin_guard.verify_state(state, &params.request_id) {
                return Err(WalletError::new(
                    ErrorKind::InvalidData,
                    "callback state token failed verification",
                )
                .with_wallet(wallet_id));
            }
        } else {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                "callback carries no state token",
            )
            .with_wallet(wallet_id));
        }

        if let Some(error) = &params.error {
            return Err(WalletError::wrap_message(error.clone()).with_wallet(wallet_id));
        }
        params.result.clone().ok_or_else(|| {
            WalletError::new(ErrorKind::InvalidData, "callback carries neither result nor error")
                .with_wallet(wallet_id)
        })
    }

    /// Ingest a callback URL (page load path). Returns whether a pending
    /// request was completed.
    pub fn handle_callback_url(&self, url: &str) -> Result<bool, WalletError> {
        let Some(params) = parse_callback_url(url)? else {
            return Ok(false);
        };
        let Some(record) = self.registry.snapshot(&params.request_id) else {
            return Ok(false);
        };
        match self.outcome_from(&params, &record.wallet_id) {
            Ok(result) => Ok(self.registry.resolve(&params.request_id, result)),
            Err(error) => Ok(self.registry.reject(&params.request_id, error)),
        }
    }

    /// Ingest a wallet-posted message (postMessage path). The origin must
    /// pass the origin guard for the wallet that owns the request.
    pub fn handle_wallet_message(
        &self,
        origin: &str,
        message: &serde_json::Value,
    ) -> Result<bool, WalletError> {
        let Some(request_id) = message.get("request_id").and_then(|v| v.as_str()) else {
            return Ok(false);
        };
        let Some(record) = self.registry.snapshot(request_id) else {
            return Ok(false);
        };

        if !self
            .origin_guard
            .verify_message_origin(origin, Some(&record.wallet_id))
        {
            self.events.emit(&ConnectorEvent::WalletError {
                wallet_id: Some(record.wallet_id.clone()),
                kind: ErrorKind::SandboxBlocked,
                message: format!("message from untrusted origin {origin}"),
            });
            return Err(WalletError::new(
                ErrorKind::SandboxBlocked,
                format!("untrusted origin {origin} for request {request_id}"),
            )
            .with_wallet(record.wallet_id));
        }

        if let Some(error) = message.get("error").and_then(|v| v.as_str()) {
            return Ok(self
                .registry
                .reject(request_id, WalletError::wrap_message(error).with_wallet(record.wallet_id)));
        }
        match message.get("result") {
            Some(result) => Ok(self.registry.resolve(request_id, result.clone())),
            None => Ok(false),
        }
    }

    // ========================================================================
    // WalletConnect passthrough
    // ========================================================================

    pub fn wallet_connect(&self) -> Option<&WalletConnectConnector> {
        self.wallet_connect.as_ref()
    }

    pub async fn connect_wallet_connect(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<Account>, WalletError> {
        let connector = self.wallet_connect.as_ref().ok_or_else(|| {
            WalletError::new(ErrorKind::WalletNotFound, "WalletConnect not configured")
        })?;
        let accounts = connector.connect().await?;
        self.persist_session(wallet_id, &accounts).await?;
        Ok(accounts)
    }

    pub async fn sign_wallet_connect(
        &self,
        params: &TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError> {
        let connector = self.wallet_connect.as_ref().ok_or_else(|| {
            WalletError::new(ErrorKind::WalletNotFound, "WalletConnect not configured")
        })?;
        connector.sign_and_send_transaction(params).await
    }

    // ========================================================================
    // Session cache
    // ========================================================================

    /// Persist `{walletId, accounts, timestamp}` with the session TTL.
    pub async fn persist_session(
        &self,
        wallet_id: &str,
        accounts: &[Account],
    ) -> Result<(), WalletError> {
        let cache = ExternalSessionCache {
            wallet_id: wallet_id.to_string(),
            accounts: accounts.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.durable
            .set(
                &self.durable.keys().external_session(),
                &cache,
                SetOptions::encrypted().with_ttl(self.config.session_ttl),
            )
            .await
    }

    /// Return the cached session if still fresh.
    pub async fn restore_session(&self) -> Result<Option<ExternalSessionCache>, WalletError> {
        self.durable
            .get::<ExternalSessionCache>(&self.durable.keys().external_session())
            .await
    }

    pub async fn clear_session(&self) -> Result<(), WalletError> {
        self.durable
            .remove(&self.durable.keys().external_session())
            .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the deadline sweep timer.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(orchestrator.config.sweep_interval) => {
                        let swept = orchestrator.registry.sweep_expired();
                        if swept > 0 {
                            debug!(swept, "Swept expired external requests");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
    }

    pub fn destroy(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        self.registry.clear();
    }
}
