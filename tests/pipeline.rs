//! Full-pipeline integration: connect, sign, audit, events.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use near_connect::domain::{Account, Action, ONE_NEAR, SignInParams, TransactionParams};
use near_connect::runtime::{CancelToken, ConnectorRuntime, RuntimeConfig};
use near_connect::security::audit::{AuditEventType, AuditQuery};
use near_connect::storage::MemoryStorage;
use near_connect::test_utils::MockWalletDriver;
use near_connect::{ConnectorEvent, ErrorKind};

fn runtime() -> Arc<ConnectorRuntime> {
    ConnectorRuntime::new(
        RuntimeConfig::default(),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
    )
}

#[tokio::test]
async fn connect_sign_disconnect_leaves_a_complete_audit_trail() {
    let rt = runtime();
    rt.register_driver(Arc::new(MockWalletDriver::new("demo").with_accounts(vec![
        Account::new("alice.near"),
    ])));

    let connected_events = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected_events);
    let _sub = rt.events().subscribe("wallet:connected", move |event| {
        if let ConnectorEvent::WalletConnected { accounts, .. } = event {
            assert_eq!(accounts[0].account_id, "alice.near");
        }
        c.fetch_add(1, Ordering::SeqCst);
    });

    rt.connect("demo", SignInParams::default(), &CancelToken::never())
        .await
        .unwrap();
    rt.sign_and_send_transaction(
        "demo",
        TransactionParams::new("bob.near", vec![Action::Transfer { deposit: ONE_NEAR }]),
        &CancelToken::never(),
    )
    .await
    .unwrap();
    rt.disconnect("demo").await.unwrap();

    assert_eq!(connected_events.load(Ordering::SeqCst), 1);

    let trail: Vec<AuditEventType> = rt
        .audit()
        .query(&AuditQuery::default())
        .iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        AuditEventType::WalletConnect,
        AuditEventType::SessionCreate,
        AuditEventType::TxSign,
        AuditEventType::TxBroadcast,
        AuditEventType::WalletDisconnect,
    ] {
        assert!(trail.contains(&expected), "missing {expected:?} in {trail:?}");
    }

    // Exports stay consistent with the ring.
    let json = rt.audit().export_json();
    assert!(json.contains("tx:broadcast"));
    let csv = rt.audit().export_csv();
    assert!(csv.lines().count() > trail.len());
}

#[tokio::test]
async fn blocked_transaction_never_reaches_the_driver() {
    let rt = runtime();
    let driver = Arc::new(MockWalletDriver::new("demo").with_accounts(vec![
        Account::new("alice.near"),
    ]));
    let calls = driver.call_log();
    rt.register_driver(driver);

    rt.connect("demo", SignInParams::default(), &CancelToken::never())
        .await
        .unwrap();

    let err = rt
        .sign_and_send_transaction(
            "demo",
            TransactionParams::new(
                "anywhere.near",
                vec![Action::DeleteAccount {
                    beneficiary_id: "thief.near".to_string(),
                }],
            ),
            &CancelToken::never(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidTransaction);

    let log = calls.lock().unwrap();
    assert!(!log.iter().any(|c| c == "sign_and_send_transaction"));
}

#[tokio::test]
async fn batch_risk_gate_checks_every_transaction() {
    let rt = runtime();
    rt.register_driver(Arc::new(MockWalletDriver::new("demo").with_accounts(vec![
        Account::new("alice.near"),
    ])));
    rt.connect("demo", SignInParams::default(), &CancelToken::never())
        .await
        .unwrap();

    let err = rt
        .sign_and_send_transactions(
            "demo",
            vec![
                TransactionParams::new("ok.near", vec![Action::Transfer { deposit: 1 }]),
                TransactionParams::new("bad.near", vec![Action::DeployContract { code: vec![0] }]),
            ],
            &CancelToken::never(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidTransaction);

    let ok = rt
        .sign_and_send_transactions(
            "demo",
            vec![
                TransactionParams::new("one.near", vec![Action::Transfer { deposit: 1 }]),
                TransactionParams::new("two.near", vec![Action::Transfer { deposit: 2 }]),
            ],
            &CancelToken::never(),
        )
        .await
        .unwrap();
    assert_eq!(ok.len(), 2);
}
