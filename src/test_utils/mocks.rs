//! Mock implementations for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    Account, ErrorKind, ExecutionOutcome, FinalExecutionStatus, Nep413Payload, SignInParams,
    SignedMessage, TransactionParams, WalletDriver, WalletError,
};
use crate::external::walletconnect::{ProposalNamespace, RelayClient, WcSession};
use crate::hardware::framing::{PACKET_SIZE, Reassembler, frame};
use crate::hardware::transport::{HidBackend, HidDeviceHandle};

/// Configuration for mock failure behavior.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub fail_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            fail_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

// ============================================================================
// WALLET DRIVER
// ============================================================================

/// Scriptable wallet driver.
pub struct MockWalletDriver {
    wallet_id: String,
    accounts: Vec<Account>,
    config: MockConfig,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockWalletDriver {
    #[must_use]
    pub fn new(wallet_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            accounts: vec![Account::new("mock.near")],
            config: MockConfig::success(),
            latency: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = accounts;
        self
    }

    #[must_use]
    pub fn failing_with(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.config = MockConfig::failure(kind, message);
        self
    }

    /// Delay every operation, for timeout and cancellation tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Operation names in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    async fn run(&self, name: &str) -> Result<(), WalletError> {
        self.calls.lock().unwrap().push(name.to_string());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(kind) = self.config.fail_kind {
            let message = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "mock failure".to_string());
            return Err(WalletError::new(kind, message).with_wallet(self.wallet_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletDriver for MockWalletDriver {
    fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    async fn sign_in(&self, _params: SignInParams) -> Result<Vec<Account>, WalletError> {
        self.run("sign_in").await?;
        Ok(self.accounts.clone())
    }

    async fn sign_out(&self) -> Result<(), WalletError> {
        self.run("sign_out").await
    }

    async fn get_accounts(&self) -> Result<Vec<Account>, WalletError> {
        self.run("get_accounts").await?;
        Ok(self.accounts.clone())
    }

    async fn sign_and_send_transaction(
        &self,
        params: TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError> {
        self.run("sign_and_send_transaction").await?;
        Ok(ExecutionOutcome {
            transaction_hash: format!("mock:{}", params.receiver_id),
            status: FinalExecutionStatus::SuccessValue(String::new()),
        })
    }

    async fn sign_message(&self, _params: Nep413Payload) -> Result<SignedMessage, WalletError> {
        self.run("sign_message").await?;
        let account = self
            .accounts
            .first()
            .cloned()
            .unwrap_or_else(|| Account::new("mock.near"));
        Ok(SignedMessage {
            account_id: account.account_id,
            public_key: account
                .public_key
                .map(|k| k.to_string())
                .unwrap_or_else(|| "ed25519:mock".to_string()),
            signature: "bW9jay1zaWduYXR1cmU=".to_string(),
        })
    }
}

// ============================================================================
// HID DEVICE
// ============================================================================

type ApduHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Scripted device behavior shared between a backend and its handles: the
/// handler maps a complete APDU to a response payload (data + status word).
#[derive(Clone)]
pub struct MockHidScript {
    handler: ApduHandler,
    response_delay: Option<Duration>,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockHidScript {
    pub fn new(handler: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            response_delay: None,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay before the device starts answering.
    #[must_use]
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    /// Every complete APDU the device received.
    pub fn seen_commands(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.seen)
    }
}

/// Backend handing out scripted devices.
pub struct MockHidBackend {
    script: MockHidScript,
    fail_open: Option<MockConfig>,
    opens: AtomicUsize,
}

impl MockHidBackend {
    pub fn new(script: MockHidScript) -> Self {
        Self {
            script,
            fail_open: None,
            opens: AtomicUsize::new(0),
        }
    }

    /// Backend whose permission prompt fails, e.g. user cancel.
    pub fn failing_open(script: MockHidScript, kind: ErrorKind, message: &str) -> Self {
        Self {
            script,
            fail_open: Some(MockConfig::failure(kind, message)),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HidBackend for MockHidBackend {
    async fn open(&self) -> Result<Box<dyn HidDeviceHandle>, WalletError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(config) = &self.fail_open {
            return Err(WalletError::new(
                config.fail_kind.unwrap_or(ErrorKind::DeviceNotFound),
                config.error_message.clone().unwrap_or_default(),
            ));
        }
        Ok(Box::new(MockHidDevice {
            script: self.script.clone(),
            inbound: Reassembler::new(),
            outbound: Vec::new(),
            pending_delay: None,
            closed: false,
        }))
    }
}

struct MockHidDevice {
    script: MockHidScript,
    inbound: Reassembler,
    outbound: Vec<[u8; PACKET_SIZE]>,
    pending_delay: Option<Duration>,
    closed: bool,
}

#[async_trait]
impl HidDeviceHandle for MockHidDevice {
    async fn write_packet(&mut self, packet: &[u8; PACKET_SIZE]) -> Result<(), WalletError> {
        if self.closed {
            return Err(WalletError::new(ErrorKind::Disconnected, "device closed"));
        }
        if let Some(apdu) = self.inbound.push(packet)? {
            self.script.seen.lock().unwrap().push(apdu.clone());
            let response = (self.script.handler)(&apdu);
            self.outbound = frame(&response);
            self.pending_delay = self.script.response_delay;
        }
        Ok(())
    }

    async fn read_packet(&mut self, timeout: Duration) -> Result<[u8; PACKET_SIZE], WalletError> {
        if self.closed {
            return Err(WalletError::new(ErrorKind::Disconnected, "device closed"));
        }
        if let Some(delay) = self.pending_delay.take() {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                self.pending_delay = Some(delay - timeout);
                return Err(WalletError::new(ErrorKind::Timeout, "device read timed out"));
            }
            tokio::time::sleep(delay).await;
        }
        if self.outbound.is_empty() {
            return Err(WalletError::new(
                ErrorKind::TransportError,
                "no response pending",
            ));
        }
        Ok(self.outbound.remove(0))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// ============================================================================
// WALLETCONNECT RELAY
// ============================================================================

/// Scripted relay client.
pub struct MockRelayClient {
    session_accounts: Vec<String>,
    connect_failure: Option<MockConfig>,
    request_response: Mutex<serde_json::Value>,
    requests: Mutex<Vec<(String, String, serde_json::Value)>>,
    disconnects: AtomicUsize,
}

impl MockRelayClient {
    /// A relay whose wallet approves these namespace account strings.
    pub fn approving(accounts: Vec<String>) -> Self {
        Self {
            session_accounts: accounts,
            connect_failure: None,
            request_response: Mutex::new(serde_json::Value::Null),
            requests: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(kind: ErrorKind, message: &str) -> Self {
        Self {
            connect_failure: Some(MockConfig::failure(kind, message)),
            ..Self::approving(vec![])
        }
    }

    #[must_use]
    pub fn with_request_response(self, response: serde_json::Value) -> Self {
        *self.request_response.lock().unwrap() = response;
        self
    }

    /// Recorded requests as `(chain_id, method, params)`.
    pub fn requests(&self) -> Vec<(String, String, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for MockRelayClient {
    async fn connect(&self, _namespace: ProposalNamespace) -> Result<WcSession, WalletError> {
        if let Some(config) = &self.connect_failure {
            return Err(WalletError::new(
                config.fail_kind.unwrap_or(ErrorKind::UnknownError),
                config.error_message.clone().unwrap_or_default(),
            ));
        }
        Ok(WcSession {
            topic: "mock-topic".to_string(),
            accounts: self.session_accounts.clone(),
        })
    }

    async fn request(
        &self,
        _topic: &str,
        chain_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WalletError> {
        self.requests
            .lock()
            .unwrap()
            .push((chain_id.to_string(), method.to_string(), params));
        Ok(self.request_response.lock().unwrap().clone())
    }

    async fn disconnect(&self, _topic: &str) -> Result<(), WalletError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
