//! External-wallet orchestration scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use near_connect::domain::{
    Account, Network, StorageBackend, TransactionParams, WalletManifest,
};
use near_connect::events::EventBus;
use near_connect::external::{
    ExternalTransport, ExternalWalletConfig, ExternalWalletOrchestrator, Platform,
    WalletConnectConnector, parse_wc_account,
};
use near_connect::security::{OriginGuard, OriginGuardConfig};
use near_connect::storage::{MemoryStorage, SecureStorage, StorageKeys};
use near_connect::test_utils::MockRelayClient;

fn manifest() -> WalletManifest {
    serde_json::from_value(serde_json::json!({
        "id": "pocket-wallet",
        "name": "Pocket Wallet",
        "icon": "https://pocket.example/icon.png",
        "description": "Mobile wallet",
        "website": "https://pocket.example",
        "version": "2.0.0",
        "type": "external",
        "permissions": {"walletConnect": true},
        "features": {"signAndSend": true, "signMessage": true, "mainnet": true, "testnet": true},
        "deepLink": {
            "scheme": "pocketwallet",
            "appStoreUrl": "https://apps.example/pocket"
        }
    }))
    .unwrap()
}

async fn orchestrator(platform: Platform) -> Arc<ExternalWalletOrchestrator> {
    let keys = StorageKeys::default();
    let session_store: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let origin_guard = Arc::new(
        OriginGuard::new(OriginGuardConfig::default(), Arc::clone(&session_store), &keys)
            .await
            .unwrap(),
    );
    origin_guard.add_app_origin("https://dapp.example");
    origin_guard.register_wallet_origins("pocket-wallet", &["https://pocket.example".to_string()]);

    let durable = Arc::new(SecureStorage::new(
        Arc::new(MemoryStorage::new()),
        Arc::clone(&session_store),
        keys,
    ));
    ExternalWalletOrchestrator::new(
        ExternalWalletConfig {
            app_name: "Demo dApp".to_string(),
            network: Network::Testnet,
            callback_base: "https://dapp.example/wallet-callback".to_string(),
            ..Default::default()
        },
        platform,
        origin_guard,
        durable,
        session_store,
        EventBus::new(),
    )
}

#[tokio::test]
async fn deep_link_url_carries_the_documented_contract() {
    let orchestrator = orchestrator(Platform::MobileIos).await;
    let dispatched = orchestrator
        .request_sign(
            &manifest(),
            &TransactionParams::new("shop.near", vec![]),
        )
        .unwrap();

    assert_eq!(dispatched.url.scheme(), "pocketwallet");
    let query: HashMap<_, _> = dispatched.url.query_pairs().collect();
    assert_eq!(query["request_id"], dispatched.request_id.as_str());
    assert_eq!(query["network"], "testnet");
    assert_eq!(query["app_name"], "Demo dApp");
    assert!(query["callback_url"].starts_with("https://dapp.example/wallet-callback"));
    assert!(query.contains_key("transaction"));

    // The callback itself is state-bound.
    assert!(query["callback_url"].contains("state="));
}

#[tokio::test]
async fn callback_correlation_resolves_the_right_request() {
    let orchestrator = orchestrator(Platform::MobileAndroid).await;
    let first = orchestrator.request_connect(&manifest()).unwrap();
    let second = orchestrator.request_connect(&manifest()).unwrap();

    let query: HashMap<_, _> = second.url.query_pairs().collect();
    let result = BASE64_STANDARD.encode(serde_json::json!({"winner": 2}).to_string());
    let mut url = url::Url::parse(&query["callback_url"]).unwrap();
    url.query_pairs_mut()
        .append_pair("request_id", &second.request_id)
        .append_pair("result", &result);

    assert!(orchestrator.handle_callback_url(url.as_str()).unwrap());
    assert_eq!(
        second.receiver.await.unwrap().unwrap(),
        serde_json::json!({"winner": 2})
    );
    // The first request is still pending.
    assert!(orchestrator.registry().contains(&first.request_id));
}

#[tokio::test(start_paused = true)]
async fn pending_requests_time_out_after_five_minutes() {
    let orchestrator = orchestrator(Platform::MobileAndroid).await;
    let dispatched = orchestrator.request_connect(&manifest()).unwrap();

    tokio::time::advance(std::time::Duration::from_secs(301)).await;
    assert_eq!(orchestrator.registry().sweep_expired(), 1);

    let err = dispatched.receiver.await.unwrap().unwrap_err();
    assert_eq!(err.kind, near_connect::domain::ErrorKind::ConnectionTimeout);
}

#[tokio::test]
async fn desktop_offers_only_walletconnect() {
    let orchestrator = orchestrator(Platform::Desktop).await;
    assert_eq!(
        orchestrator.transports_for(&manifest()),
        vec![ExternalTransport::WalletConnect]
    );
    assert!(!Platform::Desktop.is_mobile());
    assert_eq!(Platform::detect("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)"), Platform::MobileIos);
    assert_eq!(Platform::detect("Mozilla/5.0 (Linux; Android 14)"), Platform::MobileAndroid);
    assert_eq!(Platform::detect("Mozilla/5.0 (X11; Linux x86_64)"), Platform::Desktop);
}

#[tokio::test]
async fn walletconnect_session_lifecycle() {
    let relay = Arc::new(
        MockRelayClient::approving(vec![
            "near:testnet:alice.testnet".to_string(),
            "eip155:1:0xabc".to_string(),
        ])
        .with_request_response(serde_json::json!({
            "transactionHash": "wc-hash",
            "status": {"SuccessValue": ""}
        })),
    );
    let client: Arc<dyn near_connect::external::RelayClient> = relay.clone() as Arc<dyn near_connect::external::RelayClient>;
    let connector = WalletConnectConnector::new(client, Network::Testnet);

    let accounts = connector.connect().await.unwrap();
    assert_eq!(accounts, vec![Account::new("alice.testnet")]);

    let outcome = connector
        .sign_and_send_transaction(&TransactionParams::new("shop.near", vec![]))
        .await
        .unwrap();
    assert_eq!(outcome.transaction_hash, "wc-hash");

    let requests = relay.requests();
    assert_eq!(requests[0].0, "near:testnet");
    assert_eq!(requests[0].1, "near_signAndSendTransaction");

    connector.disconnect().await.unwrap();
    assert_eq!(relay.disconnect_count(), 1);
    assert!(!connector.has_session());
}

#[test]
fn namespace_account_parsing() {
    assert_eq!(
        parse_wc_account("near:testnet:alice.testnet"),
        Some((Network::Testnet, "alice.testnet".to_string()))
    );
    assert_eq!(parse_wc_account("near:unknown:x"), None);
    assert_eq!(parse_wc_account("cosmos:hub:addr"), None);
}

#[tokio::test]
async fn redirect_round_trip_resumes_exactly_once() {
    let orchestrator = orchestrator(Platform::MobileAndroid).await;
    let dispatched = orchestrator
        .request_sign(&manifest(), &TransactionParams::new("shop.near", vec![]))
        .unwrap();
    orchestrator.begin_redirect(&dispatched).await.unwrap();

    let query: HashMap<_, _> = dispatched.url.query_pairs().collect();
    let result = BASE64_STANDARD.encode(
        serde_json::json!({"transactionHash": "redir-hash"}).to_string(),
    );
    let mut return_url = url::Url::parse(&query["callback_url"]).unwrap();
    return_url
        .query_pairs_mut()
        .append_pair("request_id", &dispatched.request_id)
        .append_pair("result", &result);
    let return_url = return_url.to_string();

    let resumed = orchestrator
        .resume_pending(&return_url)
        .await
        .unwrap()
        .expect("one pending request resumes");
    assert_eq!(resumed.record.wallet_id, "pocket-wallet");
    assert_eq!(
        resumed.outcome.unwrap()["transactionHash"],
        serde_json::json!("redir-hash")
    );

    assert!(orchestrator.resume_pending(&return_url).await.unwrap().is_none());
}

#[tokio::test]
async fn external_session_cache_round_trip() {
    let orchestrator = orchestrator(Platform::MobileAndroid).await;
    orchestrator
        .persist_session("pocket-wallet", &[Account::new("alice.testnet")])
        .await
        .unwrap();

    let restored = orchestrator.restore_session().await.unwrap().unwrap();
    assert_eq!(restored.wallet_id, "pocket-wallet");
    assert_eq!(restored.accounts.len(), 1);
}
