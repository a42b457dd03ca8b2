//! Origin guard: message-origin verification, callback URL vetting, and
//! HMAC-bound CSRF state tokens.
//!
//! Host `postMessage`-style channels are open-broadcast within an origin;
//! this guard is the only authentication. The state-token secret is
//! session-scoped: generated once per tab and kept in the session store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{ErrorKind, StorageBackend, WalletError};
use crate::storage::keys::StorageKeys;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct OriginGuardConfig {
    /// Permit plain HTTP callback URLs for these hosts (dev contexts).
    pub allow_http_hosts: Vec<String>,
}

impl Default for OriginGuardConfig {
    fn default() -> Self {
        Self {
            allow_http_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

/// Trusted-origin registry plus the CSRF state-token machinery.
pub struct OriginGuard {
    config: OriginGuardConfig,
    wallet_origins: RwLock<HashMap<String, HashSet<String>>>,
    app_origins: RwLock<HashSet<String>>,
    secret: SecretBox<Vec<u8>>,
}

impl OriginGuard {
    /// Create a guard, loading or generating the per-tab state secret from
    /// session-scoped storage.
    pub async fn new(
        config: OriginGuardConfig,
        session_store: Arc<dyn StorageBackend>,
        keys: &StorageKeys,
    ) -> Result<Self, WalletError> {
        let secret_key = keys.origin_secret();
        let secret = match session_store.get(&secret_key).await? {
            Some(encoded) => BASE64_STANDARD.decode(&encoded).map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("corrupt origin secret: {e}"))
            })?,
            None => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                session_store
                    .set(&secret_key, BASE64_STANDARD.encode(&bytes))
                    .await?;
                debug!("Generated per-tab origin secret");
                bytes
            }
        };

        Ok(Self {
            config,
            wallet_origins: RwLock::new(HashMap::new()),
            app_origins: RwLock::new(HashSet::new()),
            secret: SecretBox::new(Box::new(secret)),
        })
    }

    /// Register the trusted origins a wallet may post messages from.
    pub fn register_wallet_origins(&self, wallet_id: &str, origins: &[String]) {
        let normalized: HashSet<String> = origins
            .iter()
            .filter_map(|o| normalize_origin(o))
            .collect();
        self.wallet_origins
            .write()
            .unwrap()
            .insert(wallet_id.to_string(), normalized);
    }

    pub fn add_app_origin(&self, origin: &str) {
        if let Some(normalized) = normalize_origin(origin) {
            self.app_origins.write().unwrap().insert(normalized);
        }
    }

    /// Verify the origin of an inbound wallet message. With an expectation,
    /// only that wallet's origins pass; without one, any registered wallet
    /// origin or app origin passes.
    pub fn verify_message_origin(&self, origin: &str, expected_wallet_id: Option<&str>) -> bool {
        let Some(origin) = normalize_origin(origin) else {
            return false;
        };

        let wallets = self.wallet_origins.read().unwrap();
        let allowed = match expected_wallet_id {
            Some(wallet_id) => wallets
                .get(wallet_id)
                .is_some_and(|origins| origins.contains(&origin)),
            None => {
                wallets.values().any(|origins| origins.contains(&origin))
                    || self.app_origins.read().unwrap().contains(&origin)
            }
        };

        if !allowed {
            warn!(origin = %origin, expected = ?expected_wallet_id, "Rejected message from untrusted origin");
        }
        allowed
    }

    /// Vet a callback URL: HTTPS (except declared dev hosts) and a trusted
    /// app origin.
    pub fn verify_callback_url(&self, url: &str) -> Result<(), WalletError> {
        let parsed = Url::parse(url).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("bad callback url: {e}"))
        })?;

        match parsed.scheme() {
            "https" => {}
            "http" => {
                let host = parsed.host_str().unwrap_or("");
                if !self.config.allow_http_hosts.iter().any(|h| h == host) {
                    return Err(WalletError::new(
                        ErrorKind::InvalidData,
                        format!("callback url must be https: {url}"),
                    ));
                }
            }
            other => {
                return Err(WalletError::new(
                    ErrorKind::InvalidData,
                    format!("callback url has unsupported scheme: {other}"),
                ));
            }
        }

        let origin = parsed.origin().ascii_serialization();
        if !self.app_origins.read().unwrap().contains(&origin) {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                format!("callback origin {origin} is not trusted"),
            ));
        }
        Ok(())
    }

    /// CSRF state token: base64(HMAC-SHA256(request_id, session secret)).
    pub fn generate_state(&self, request_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret())
            .expect("HMAC accepts any key length");
        mac.update(request_id.as_bytes());
        BASE64_STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Timing-safe verification of a state token against a request id.
    pub fn verify_state(&self, state: &str, request_id: &str) -> bool {
        let Ok(provided) = BASE64_STANDARD.decode(state) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret())
            .expect("HMAC accepts any key length");
        mac.update(request_id.as_bytes());
        let expected = mac.finalize().into_bytes();
        if provided.len() != expected.len() {
            return false;
        }
        provided.ct_eq(expected.as_slice()).into()
    }

    /// Emit a callback URL bound to `request_id` via the `state` parameter.
    pub fn generate_secure_callback(
        &self,
        base: &str,
        request_id: &str,
    ) -> Result<String, WalletError> {
        let mut url = Url::parse(base).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("bad callback base: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("state", &self.generate_state(request_id));
        Ok(url.into())
    }
}

/// Reduce a URL or origin string to its `scheme://host[:port]` form.
fn normalize_origin(origin: &str) -> Option<String> {
    let parsed = Url::parse(origin).ok()?;
    let serialized = parsed.origin().ascii_serialization();
    (serialized != "null").then_some(serialized)
}
