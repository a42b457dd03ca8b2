//! WalletConnect session orchestration.
//!
//! The relay transport is abstracted behind [`RelayClient`]; the connector
//! owns namespace construction (`near:<network>` chains, the NEAR method
//! set), account parsing, and session state.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{
    Account, ErrorKind, ExecutionOutcome, Nep413Payload, Network, SignedMessage,
    TransactionParams, WalletError,
};

/// Namespace key requested for NEAR sessions.
pub const NEAR_NAMESPACE: &str = "near";

/// Methods requested from the wallet.
pub const WC_METHODS: &[&str] = &["near_signAndSendTransaction", "near_signMessage"];

/// Events subscribed on the session.
pub const WC_EVENTS: &[&str] = &["accountsChanged"];

/// Requested session namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalNamespace {
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

impl ProposalNamespace {
    /// The NEAR proposal for a network.
    pub fn near(network: Network) -> Self {
        Self {
            chains: vec![network.chain_id()],
            methods: WC_METHODS.iter().map(|m| m.to_string()).collect(),
            events: WC_EVENTS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// An approved relay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WcSession {
    pub topic: String,
    /// Namespace account strings of form `near:<network>:<accountId>`.
    pub accounts: Vec<String>,
}

/// Relay transport contract. Initialized once with project credentials by
/// the embedding application.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Open a session proposing the given namespace; resolves when the
    /// wallet approves.
    async fn connect(&self, namespace: ProposalNamespace) -> Result<WcSession, WalletError>;

    /// Dispatch a session request.
    async fn request(
        &self,
        topic: &str,
        chain_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, WalletError>;

    async fn disconnect(&self, topic: &str) -> Result<(), WalletError>;
}

/// Parse a namespace account string `near:<network>:<accountId>`.
pub fn parse_wc_account(raw: &str) -> Option<(Network, String)> {
    let mut parts = raw.splitn(3, ':');
    let ns = parts.next()?;
    let network = parts.next()?;
    let account_id = parts.next()?;
    if ns != NEAR_NAMESPACE || account_id.is_empty() {
        return None;
    }
    network
        .parse::<Network>()
        .ok()
        .map(|n| (n, account_id.to_string()))
}

/// NEAR session connector over a relay client.
pub struct WalletConnectConnector {
    client: std::sync::Arc<dyn RelayClient>,
    network: Network,
    session: Mutex<Option<WcSession>>,
}

impl WalletConnectConnector {
    pub fn new(client: std::sync::Arc<dyn RelayClient>, network: Network) -> Self {
        Self {
            client,
            network,
            session: Mutex::new(None),
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    fn topic(&self) -> Result<String, WalletError> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.topic.clone())
            .ok_or_else(|| {
                WalletError::new(ErrorKind::NoActiveSession, "no WalletConnect session")
            })
    }

    /// Open a session and return the accounts approved for our network.
    pub async fn connect(&self) -> Result<Vec<Account>, WalletError> {
        let session = self
            .client
            .connect(ProposalNamespace::near(self.network))
            .await?;

        let accounts: Vec<Account> = session
            .accounts
            .iter()
            .filter_map(|raw| parse_wc_account(raw))
            .filter(|(network, _)| *network == self.network)
            .map(|(_, account_id)| Account::new(account_id))
            .collect();

        if accounts.is_empty() {
            return Err(WalletError::new(
                ErrorKind::NetworkMismatch,
                format!(
                    "session approved no {} accounts: {:?}",
                    self.network, session.accounts
                ),
            ));
        }

        info!(topic = %session.topic, count = accounts.len(), "WalletConnect session established");
        *self.session.lock().unwrap() = Some(session);
        Ok(accounts)
    }

    /// Restore a previously approved session without a new pairing round.
    pub fn adopt_session(&self, session: WcSession) {
        *self.session.lock().unwrap() = Some(session);
    }

    pub async fn sign_and_send_transaction(
        &self,
        params: &TransactionParams,
    ) -> Result<ExecutionOutcome, WalletError> {
        let topic = self.topic()?;
        debug!(topic = %topic, receiver = %params.receiver_id, "WalletConnect sign request");
        let result = self
            .client
            .request(
                &topic,
                &self.network.chain_id(),
                "near_signAndSendTransaction",
                serde_json::to_value(params).map_err(|e| {
                    WalletError::new(ErrorKind::InvalidTransaction, format!("encode: {e}"))
                })?,
            )
            .await?;

        serde_json::from_value(result).map_err(|e| {
            WalletError::new(ErrorKind::RpcError, format!("outcome parse: {e}"))
        })
    }

    pub async fn sign_message(
        &self,
        payload: &Nep413Payload,
    ) -> Result<SignedMessage, WalletError> {
        let topic = self.topic()?;
        let result = self
            .client
            .request(
                &topic,
                &self.network.chain_id(),
                "near_signMessage",
                serde_json::to_value(payload).map_err(|e| {
                    WalletError::new(ErrorKind::InvalidData, format!("encode: {e}"))
                })?,
            )
            .await?;

        serde_json::from_value(result).map_err(|e| {
            WalletError::new(ErrorKind::SignMessageFailed, format!("signature parse: {e}"))
        })
    }

    /// Close the session and clear local state.
    pub async fn disconnect(&self) -> Result<(), WalletError> {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            self.client.disconnect(&session.topic).await?;
        }
        Ok(())
    }

    pub fn session(&self) -> Option<WcSession> {
        self.session.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mocks::MockRelayClient;
    use std::sync::Arc;

    #[test]
    fn test_namespace_proposal_shape() {
        let ns = ProposalNamespace::near(Network::Testnet);
        assert_eq!(ns.chains, vec!["near:testnet"]);
        assert_eq!(
            ns.methods,
            vec!["near_signAndSendTransaction", "near_signMessage"]
        );
        assert_eq!(ns.events, vec!["accountsChanged"]);
    }

    #[test]
    fn test_account_string_parsing() {
        assert_eq!(
            parse_wc_account("near:mainnet:alice.near"),
            Some((Network::Mainnet, "alice.near".to_string()))
        );
        assert_eq!(parse_wc_account("near:testnet:a:b"), None);
        assert_eq!(parse_wc_account("eip155:1:0xabc"), None);
        assert_eq!(parse_wc_account("near:devnet:alice.near"), None);
        assert_eq!(parse_wc_account("near:mainnet:"), None);
    }

    #[tokio::test]
    async fn test_connect_filters_network_accounts() {
        let relay = Arc::new(MockRelayClient::approving(vec![
            "near:testnet:alice.testnet".to_string(),
            "near:mainnet:alice.near".to_string(),
        ]));
        let connector = WalletConnectConnector::new(relay, Network::Testnet);

        let accounts = connector.connect().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "alice.testnet");
        assert!(connector.has_session());
    }

    #[tokio::test]
    async fn test_connect_wrong_network_is_mismatch() {
        let relay = Arc::new(MockRelayClient::approving(vec![
            "near:mainnet:alice.near".to_string(),
        ]));
        let connector = WalletConnectConnector::new(relay, Network::Testnet);
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkMismatch);
        assert!(!connector.has_session());
    }

    #[tokio::test]
    async fn test_request_requires_session() {
        let relay = Arc::new(MockRelayClient::approving(vec![]));
        let connector = WalletConnectConnector::new(relay, Network::Testnet);
        let err = connector
            .sign_and_send_transaction(&TransactionParams::new("r.near", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoActiveSession);
    }

    #[tokio::test]
    async fn test_sign_dispatches_request_and_disconnect_clears() {
        let relay = Arc::new(
            MockRelayClient::approving(vec!["near:testnet:alice.testnet".to_string()])
                .with_request_response(serde_json::json!({
                    "transactionHash": "abc",
                    "status": {"SuccessValue": ""}
                })),
        );
        let client: Arc<dyn RelayClient> = relay.clone() as Arc<dyn RelayClient>;
        let connector = WalletConnectConnector::new(client, Network::Testnet);
        connector.connect().await.unwrap();

        let outcome = connector
            .sign_and_send_transaction(&TransactionParams::new("r.near", vec![]))
            .await
            .unwrap();
        assert_eq!(outcome.transaction_hash, "abc");

        let requests = relay.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "near:testnet");
        assert_eq!(requests[0].1, "near_signAndSendTransaction");

        connector.disconnect().await.unwrap();
        assert!(!connector.has_session());
        assert_eq!(relay.disconnect_count(), 1);
    }
}
