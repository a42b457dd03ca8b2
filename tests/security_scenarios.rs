//! End-to-end scenarios for the security layer.

use std::time::Duration;

use near_connect::domain::{AccessKey, Action, ONE_NEAR, PublicKey, StorageBackend};
use near_connect::security::{
    OriginGuard, OriginGuardConfig, RateLimitConfig, RateLimiter, RiskAnalyzer, RiskLevel,
};
use near_connect::storage::{MemoryStorage, SecureStorage, SetOptions, StorageKeys};
use std::sync::Arc;

#[test]
fn safe_transfer_validates_as_low_risk() {
    let analyzer = RiskAnalyzer::default();
    let actions = [Action::Transfer {
        deposit: "1000000000000000000000000".parse().unwrap(),
    }];

    let risk = analyzer.analyze("bob.near", &actions);
    assert_eq!(risk.level, RiskLevel::Low);
    assert!(!risk.requires_explicit_approval);
    assert!(analyzer.validate("bob.near", &actions).valid);
}

#[test]
fn dangerous_add_key_critical_blocks() {
    let analyzer = RiskAnalyzer::default();
    let actions = [Action::AddKey {
        public_key: PublicKey::from_ed25519_bytes([1u8; 32]),
        access_key: AccessKey::full_access(),
    }];

    let validation = analyzer.validate("x.near", &actions);
    assert!(!validation.valid);
    assert_eq!(validation.risk.level, RiskLevel::Critical);
    assert!(
        validation
            .risk
            .reasons
            .iter()
            .any(|r| r == "Adding full access key - grants complete account control"),
        "reasons: {:?}",
        validation.risk.reasons
    );
}

#[test]
fn risk_never_decreases_when_actions_are_added() {
    let analyzer = RiskAnalyzer::default();
    let pools: Vec<Action> = vec![
        Action::CreateAccount,
        Action::Transfer { deposit: ONE_NEAR },
        Action::Transfer { deposit: 150 * ONE_NEAR },
        Action::Stake {
            stake: ONE_NEAR,
            public_key: PublicKey::from_ed25519_bytes([2u8; 32]),
        },
        Action::DeleteKey {
            public_key: PublicKey::from_ed25519_bytes([2u8; 32]),
        },
        Action::DeployContract { code: vec![0; 8] },
    ];

    let mut actions: Vec<Action> = Vec::new();
    let mut previous = RiskLevel::Low;
    for action in pools {
        actions.push(action);
        let level = analyzer.analyze("someone.near", &actions).level;
        assert!(level >= previous, "level dropped after adding an action");
        previous = level;
    }
    assert_eq!(previous, RiskLevel::Critical);
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_burst_of_five() {
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 3,
        window: Duration::from_millis(5000),
        block_duration: Duration::from_millis(10_000),
        sliding_window: true,
    });

    let outcomes: Vec<_> = (0..5).map(|_| limiter.check("x")).collect();

    for (i, expected_remaining) in [(0usize, 2u32), (1, 1), (2, 0)] {
        match outcomes[i] {
            near_connect::security::RateDecision::Allowed { remaining } => {
                assert_eq!(remaining, expected_remaining, "call {i}")
            }
            _ => panic!("call {i} should be allowed"),
        }
    }
    let retry4 = outcomes[3].retry_after().expect("call 4 denied");
    assert_eq!(retry4, Duration::from_millis(10_000));
    let retry5 = outcomes[4].retry_after().expect("call 5 denied");
    assert!(retry5 <= Duration::from_millis(10_000));
    assert!(retry5 >= Duration::from_millis(9_000));
}

#[tokio::test]
async fn hmac_state_binds_request_ids() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let guard = OriginGuard::new(OriginGuardConfig::default(), store, &StorageKeys::default())
        .await
        .unwrap();

    let state = guard.generate_state("rid");
    assert!(guard.verify_state(&state, "rid"));
    assert!(!guard.verify_state(&state, "rid2"));

    // Distinct ids yield distinct tokens.
    assert_ne!(guard.generate_state("a"), guard.generate_state("b"));
}

#[tokio::test]
async fn envelope_roundtrip_and_tamper_detection() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    let storage = SecureStorage::new(
        Arc::clone(&backend),
        Arc::new(MemoryStorage::new()),
        StorageKeys::default(),
    );

    storage
        .set("secret", &serde_json::json!({"token": "abc"}), SetOptions::encrypted())
        .await
        .unwrap();
    let read: serde_json::Value = storage.get("secret").await.unwrap().unwrap();
    assert_eq!(read["token"], "abc");

    // Flip one ciphertext bit: decrypt errors and the entry is removed.
    let raw = backend.get("secret").await.unwrap().unwrap();
    let mut tampered = raw.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    backend
        .set("secret", String::from_utf8(tampered).unwrap())
        .await
        .unwrap();

    assert!(storage.get::<serde_json::Value>("secret").await.is_err());
    assert!(backend.get("secret").await.unwrap().is_none());
}
