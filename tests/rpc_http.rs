//! HTTP-level tests for the JSON-RPC client, using wiremock.

use near_connect::domain::{ErrorKind, PublicKey};
use near_connect::rpc::{NearRpcClient, RpcConfig};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> NearRpcClient {
    NearRpcClient::new(&server.uri(), RpcConfig::default()).unwrap()
}

#[tokio::test]
async fn view_access_key_sends_documented_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "query",
            "params": {
                "request_type": "view_access_key",
                "finality": "final",
                "account_id": "alice.near"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"nonce": 99, "permission": "FullAccess"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let view = client(&server)
        .view_access_key("alice.near", &PublicKey::from_ed25519_bytes([1u8; 32]))
        .await
        .unwrap();
    assert_eq!(view.nonce, 99);
}

#[tokio::test]
async fn block_returns_final_header_hash() {
    let server = MockServer::start().await;
    let hash = [3u8; 32];
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "method": "block",
            "params": {"finality": "final"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"header": {"hash": bs58::encode(hash).into_string()}}
        })))
        .mount(&server)
        .await;

    assert_eq!(client(&server).latest_block_hash().await.unwrap(), hash);
}

#[tokio::test]
async fn broadcast_sends_base64_and_parses_outcome() {
    let server = MockServer::start().await;
    let signed_tx = vec![1u8, 2, 3, 4];
    let encoded = {
        use base64::Engine as _;
        base64::prelude::BASE64_STANDARD.encode(&signed_tx)
    };

    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "method": "broadcast_tx_commit",
            "params": [encoded]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "transaction": {"hash": "AbCdEf"},
                "status": {"SuccessValue": "cmVzdWx0"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server).broadcast_tx_commit(&signed_tx).await.unwrap();
    assert_eq!(outcome.transaction_hash, "AbCdEf");
    assert!(outcome.status.is_success());
}

#[tokio::test]
async fn rpc_error_object_maps_to_rpc_error_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "Server error", "data": "unknown block"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).latest_block_hash().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RpcError);
    assert!(err.message.contains("-32000"));
    assert!(err.message.contains("Server error"));
}

#[tokio::test]
async fn http_500_maps_to_rpc_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&server)
        .await;

    let err = client(&server).latest_block_hash().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RpcError);
}

#[tokio::test]
async fn connection_refused_maps_to_network_error() {
    // Nothing is listening on this port.
    let client = NearRpcClient::new("http://127.0.0.1:9", RpcConfig::default()).unwrap();
    let err = client.latest_block_hash().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NetworkError);
}

#[tokio::test]
async fn chain_failure_status_is_transaction_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "transaction": {"hash": "h"},
                "status": {"Failure": {"ActionError": {"kind": "LackBalanceForState"}}}
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server).broadcast_tx_commit(&[1]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransactionFailed);
}
