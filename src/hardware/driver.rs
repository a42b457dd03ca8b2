//! Hardware wallet driver.
//!
//! Implements the uniform driver contract over the NEAR device app: fetch
//! the access-key nonce and a recent block hash from RPC, serialize the
//! transaction, sign on-device, and broadcast the signed envelope.

use std::future::Future;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::domain::{
    Account, ErrorKind, ExecutionOutcome, Nep413Payload, SignInParams, SignedMessage,
    Transaction, TransactionParams, WalletDriver, WalletError, serialize_signed,
    serialize_transaction,
};
use crate::events::{ConnectorEvent, DeviceAction, DeviceEvent, DeviceEventKind, EventBus};
use crate::hardware::app::NearApp;
use crate::hardware::path::DerivationPath;
use crate::rpc::NearRpcClient;

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Configuration for the hardware driver.
#[derive(Debug, Clone)]
pub struct HardwareWalletConfig {
    pub wallet_id: String,
    pub derivation_path: DerivationPath,
}

impl Default for HardwareWalletConfig {
    fn default() -> Self {
        Self {
            wallet_id: "ledger".to_string(),
            derivation_path: DerivationPath::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct ConnectedKey {
    public_key: crate::domain::PublicKey,
    account_id: String,
}

/// Driver for a USB-HID signing device.
pub struct HardwareWalletDriver {
    config: HardwareWalletConfig,
    app: NearApp,
    rpc: NearRpcClient,
    events: EventBus,
    connected: Mutex<Option<ConnectedKey>>,
}

impl HardwareWalletDriver {
    pub fn new(
        config: HardwareWalletConfig,
        app: NearApp,
        rpc: NearRpcClient,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            app,
            rpc,
            events,
            connected: Mutex::new(None),
        }
    }

    fn emit(&self, action: DeviceAction, kind: DeviceEventKind, message: Option<String>) {
        self.events.emit(&ConnectorEvent::Hardware(DeviceEvent {
            wallet_id: self.config.wallet_id.clone(),
            action,
            kind,
            message,
        }));
    }

    /// Emit `waiting`, run the interactive call, then emit `confirm` or
    /// `rejected` depending on how the user answered.
    async fn interactive<T>(
        &self,
        action: DeviceAction,
        message: &str,
        fut: impl Future<Output = Result<T, WalletError>>,
    ) -> Result<T, WalletError> {
        self.emit(action, DeviceEventKind::Waiting, Some(message.to_string()));
        match fut.await {
            Ok(value) => {
                self.emit(action, DeviceEventKind::Confirm, None);
                Ok(value)
            }
            Err(e) => {
                if e.kind == ErrorKind::UserRejected {
                    self.emit(action, DeviceEventKind::Rejected, None);
                }
                Err(e)
            }
        }
    }

    fn connected_key(&self) -> Result<ConnectedKey, WalletError> {
        self.connected.lock().unwrap().clone().ok_or_else(|| {
            WalletError::new(ErrorKind::NoActiveSession, "hardware wallet not connected")
                .with_wallet(self.config.wallet_id.clone())
        })
    }

    /// Resolve signer, fetch chain context, serialize, sign, broadcast.
    async fn sign_and_broadcast(
        &self,
        params: &TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError> {
        let key = self.connected_key()?;
        let signer_id = params
            .signer_id
            .clone()
            .unwrap_or_else(|| key.account_id.clone());

        let access_key = self
            .rpc
            .view_access_key(&signer_id, &key.public_key)
            .await?;
        let block_hash = self.rpc.latest_block_hash().await?;

        let tx = Transaction {
            signer_id,
            public_key: key.public_key,
            nonce: access_key.nonce + 1,
            receiver_id: params.receiver_id.clone(),
            block_hash: block_hash.to_vec(),
            actions: params.actions.clone(),
        };
        let tx_bytes = serialize_transaction(&tx)?;

        let signature = self
            .interactive(
                DeviceAction::Sign,
                "Review the transaction on your device",
                self.app
                    .sign_transaction(&self.config.derivation_path, &tx_bytes),
            )
            .await?;

        let signed = serialize_signed(&tx_bytes, &signature);
        self.rpc.broadcast_tx_commit(&signed).await
    }
}

#[async_trait]
impl WalletDriver for HardwareWalletDriver {
    fn wallet_id(&self) -> &str {
        &self.config.wallet_id
    }

    #[instrument(skip_all, fields(wallet_id = %self.config.wallet_id))]
    async fn sign_in(&self, _params: SignInParams) -> Result<Vec<Account>, WalletError> {
        self.emit(
            DeviceAction::Connect,
            DeviceEventKind::Waiting,
            Some("Connect and unlock your device".to_string()),
        );

        self.app.connect().await.map_err(|e| {
            self.emit(DeviceAction::Connect, DeviceEventKind::Disconnected, None);
            e.with_wallet(self.config.wallet_id.clone())
        })?;

        // Confirms the NEAR app is open before asking for a key.
        let version = self.app.get_version().await?;
        info!(version = %version, "NEAR device app detected");

        let public_key = self
            .app
            .get_public_key(&self.config.derivation_path, false)
            .await?;
        let account_id = public_key.implicit_account_id();

        *self.connected.lock().unwrap() = Some(ConnectedKey {
            public_key,
            account_id: account_id.clone(),
        });
        self.emit(DeviceAction::Connect, DeviceEventKind::Connected, None);

        Ok(vec![Account::new(account_id).with_public_key(public_key)])
    }

    async fn sign_out(&self) -> Result<(), WalletError> {
        self.app.disconnect().await;
        *self.connected.lock().unwrap() = None;
        self.emit(DeviceAction::Connect, DeviceEventKind::Disconnected, None);
        Ok(())
    }

    async fn get_accounts(&self) -> Result<Vec<Account>, WalletError> {
        let key = self.connected_key()?;
        Ok(vec![
            Account::new(key.account_id).with_public_key(key.public_key),
        ])
    }

    #[instrument(skip_all, fields(receiver = %params.receiver_id))]
    async fn sign_and_send_transaction(
        &self,
        params: TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError> {
        self.sign_and_broadcast(&params)
            .await
            .map_err(|e| e.with_wallet(self.config.wallet_id.clone()))
    }

    #[instrument(skip_all)]
    async fn sign_message(&self, params: Nep413Payload) -> Result<SignedMessage, WalletError> {
        let key = self.connected_key()?;
        let signature = self
            .interactive(
                DeviceAction::SignMessage,
                "Review the message on your device",
                self.app.sign_message(&self.config.derivation_path, &params),
            )
            .await?;

        Ok(SignedMessage {
            account_id: key.account_id,
            public_key: key.public_key.to_string(),
            signature: BASE64_STANDARD.encode(signature),
        })
    }
}
