//! Domain traits defining contracts for drivers and host facilities.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Account, Action, Network, Nep413Payload, WalletError};

/// Parameters for [`WalletDriver::sign_in`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInParams {
    #[serde(default)]
    pub network: Network,
    /// Contract the app intends to call, if it wants a scoped key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub contract_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app_name: Option<String>,
}

/// Parameters for a single sign-and-send operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    /// Signer account; defaults to the connected account when absent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signer_id: Option<String>,
    pub receiver_id: String,
    pub actions: Vec<Action>,
}

impl TransactionParams {
    pub fn new(receiver_id: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            signer_id: None,
            receiver_id: receiver_id.into(),
            actions,
        }
    }
}

/// Terminal status of an executed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinalExecutionStatus {
    NotStarted,
    Started,
    Failure(serde_json::Value),
    SuccessValue(String),
}

impl FinalExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::SuccessValue(_))
    }
}

/// Outcome returned by the chain for a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub transaction_hash: String,
    pub status: FinalExecutionStatus,
}

/// Result of a NEP-413 message signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    pub account_id: String,
    pub public_key: String,
    /// Base64-encoded 64-byte ed25519 signature.
    pub signature: String,
}

/// The uniform six-operation driver contract. The core calls concrete
/// wallets only through this surface; dispatch picks the implementation
/// from the manifest's declared tier.
#[async_trait]
pub trait WalletDriver: Send + Sync {
    /// Stable wallet identifier this driver serves.
    fn wallet_id(&self) -> &str;

    async fn sign_in(&self, params: SignInParams) -> Result<Vec<Account>, WalletError>;

    async fn sign_out(&self) -> Result<(), WalletError>;

    async fn get_accounts(&self) -> Result<Vec<Account>, WalletError>;

    async fn sign_and_send_transaction(
        &self,
        params: TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError>;

    async fn sign_and_send_transactions(
        &self,
        params: Vec<TransactionParams>,
    ) -> Result<Vec<ExecutionOutcome>, WalletError> {
        let mut outcomes = Vec::with_capacity(params.len());
        for tx in params {
            outcomes.push(self.sign_and_send_transaction(tx).await?);
        }
        Ok(outcomes)
    }

    async fn sign_message(&self, params: Nep413Payload) -> Result<SignedMessage, WalletError>;
}

/// Key-value storage provided by the host. Durable backends survive
/// restarts; session-scoped backends live for one tab/process.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, WalletError>;

    async fn set(&self, key: &str, value: String) -> Result<(), WalletError>;

    async fn remove(&self, key: &str) -> Result<(), WalletError>;

    async fn keys(&self) -> Result<Vec<String>, WalletError>;
}
