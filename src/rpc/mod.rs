//! NEAR JSON-RPC 2.0 client.
//!
//! All I/O goes through the [`RpcProvider`] trait so tests inject scripted
//! providers; the HTTP implementation is a thin reqwest wrapper. Only three
//! methods are used: `query` (view_access_key), `block`, and
//! `broadcast_tx_commit`.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::{
    ErrorKind, ExecutionOutcome, FinalExecutionStatus, PublicKey, WalletError,
};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Abstract provider for JSON-RPC interactions to enable testing.
#[async_trait]
pub trait RpcProvider: Send + Sync {
    /// Send a JSON-RPC request and return the `result` payload.
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WalletError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// HTTP-based JSON-RPC provider.
pub struct HttpRpcProvider {
    http_client: Client,
    rpc_url: String,
}

impl HttpRpcProvider {
    pub fn new(rpc_url: &str, config: &RpcConfig) -> Result<Self, WalletError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                WalletError::new(ErrorKind::NetworkError, format!("http client init: {e}"))
            })?;
        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl RpcProvider for HttpRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WalletError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WalletError::new(ErrorKind::ConnectionTimeout, format!("rpc timeout: {e}"))
                } else {
                    WalletError::new(ErrorKind::NetworkError, format!("rpc request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::new(
                ErrorKind::RpcError,
                format!("rpc http status {status}"),
            ));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|e| {
            WalletError::new(ErrorKind::RpcError, format!("rpc response parse: {e}"))
        })?;

        if let Some(error) = body.error {
            return Err(WalletError::new(
                ErrorKind::RpcError,
                format!(
                    "rpc error {}: {} {}",
                    error.code,
                    error.message,
                    error.data.map(|d| d.to_string()).unwrap_or_default()
                ),
            ));
        }

        body.result.ok_or_else(|| {
            WalletError::new(ErrorKind::RpcError, "rpc response missing result")
        })
    }
}

/// Access-key view returned by `view_access_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessKeyView {
    pub nonce: u64,
    #[serde(default)]
    pub permission: serde_json::Value,
}

/// The chain client used by drivers.
pub struct NearRpcClient {
    provider: Box<dyn RpcProvider>,
}

impl NearRpcClient {
    pub fn new(rpc_url: &str, config: RpcConfig) -> Result<Self, WalletError> {
        Ok(Self {
            provider: Box::new(HttpRpcProvider::new(rpc_url, &config)?),
        })
    }

    pub fn with_provider(provider: Box<dyn RpcProvider>) -> Self {
        Self { provider }
    }

    /// Fetch the current nonce for an (account, key) pair.
    #[instrument(skip(self, public_key), fields(account_id = %account_id))]
    pub async fn view_access_key(
        &self,
        account_id: &str,
        public_key: &PublicKey,
    ) -> Result<AccessKeyView, WalletError> {
        let result = self
            .provider
            .send_request(
                "query",
                serde_json::json!({
                    "request_type": "view_access_key",
                    "finality": "final",
                    "account_id": account_id,
                    "public_key": public_key.to_string(),
                }),
            )
            .await?;

        serde_json::from_value(result).map_err(|e| {
            WalletError::new(ErrorKind::RpcError, format!("access key view parse: {e}"))
        })
    }

    /// Fetch the latest final block hash (32 bytes, base58 on the wire).
    pub async fn latest_block_hash(&self) -> Result<[u8; 32], WalletError> {
        let result = self
            .provider
            .send_request("block", serde_json::json!({ "finality": "final" }))
            .await?;

        let hash_b58 = result
            .get("header")
            .and_then(|h| h.get("hash"))
            .and_then(|h| h.as_str())
            .ok_or_else(|| {
                WalletError::new(ErrorKind::RpcError, "block response missing header.hash")
            })?;

        let bytes = bs58::decode(hash_b58).into_vec().map_err(|e| {
            WalletError::new(ErrorKind::RpcError, format!("block hash decode: {e}"))
        })?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            WalletError::new(
                ErrorKind::RpcError,
                format!("block hash must be 32 bytes, got {}", v.len()),
            )
        })
    }

    /// Broadcast a signed transaction and wait for the final outcome.
    #[instrument(skip(self, signed_tx))]
    pub async fn broadcast_tx_commit(
        &self,
        signed_tx: &[u8],
    ) -> Result<ExecutionOutcome, WalletError> {
        let encoded = BASE64_STANDARD.encode(signed_tx);
        debug!(bytes = signed_tx.len(), "Broadcasting signed transaction");

        let result = self
            .provider
            .send_request("broadcast_tx_commit", serde_json::json!([encoded]))
            .await?;

        let transaction_hash = result
            .get("transaction")
            .and_then(|t| t.get("hash"))
            .and_then(|h| h.as_str())
            .unwrap_or_default()
            .to_string();

        let status = result
            .get("status")
            .cloned()
            .map(serde_json::from_value::<FinalExecutionStatus>)
            .transpose()
            .map_err(|e| {
                WalletError::new(ErrorKind::RpcError, format!("outcome status parse: {e}"))
            })?
            .unwrap_or(FinalExecutionStatus::NotStarted);

        if let FinalExecutionStatus::Failure(failure) = &status {
            return Err(WalletError::new(
                ErrorKind::TransactionFailed,
                format!("transaction failed on chain: {failure}"),
            ));
        }

        Ok(ExecutionOutcome {
            transaction_hash,
            status,
        })
    }
}
