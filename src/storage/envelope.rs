//! Secure storage envelope.
//!
//! Values are wrapped as `{data, timestamp, ttl?, encrypted}` and optionally
//! sealed with AES-256-GCM. The key derives lazily from a per-tab session
//! secret plus stable environment fingerprints via PBKDF2 (100k iterations,
//! SHA-256, fixed per-namespace salt) and never leaves this module.
//! Ciphertext is stored as `enc:<base64(IV ‖ ct)>` with a fresh 12-byte IV
//! per write.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, prelude::BASE64_STANDARD};
use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::domain::{ErrorKind, StorageBackend, WalletError};
use crate::storage::keys::StorageKeys;

/// Marker prefixing encrypted values.
const ENC_TAG: &str = "enc:";

/// PBKDF2 iteration count for the envelope key.
const PBKDF2_ITERATIONS: u32 = 100_000;

const IV_LEN: usize = 12;

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub encrypt: bool,
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn encrypted() -> Self {
        Self {
            encrypt: true,
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    data: serde_json::Value,
    /// Milliseconds since the epoch at write time.
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    ttl: Option<u64>,
    #[serde(default)]
    encrypted: bool,
}

impl Envelope {
    fn expired(&self, now_ms: i64) -> bool {
        self.ttl
            .is_some_and(|ttl| self.timestamp.saturating_add(ttl as i64) < now_ms)
    }
}

/// Envelope layer over a durable backend. The cipher key is derived on
/// first use and cached; the raw key bytes are wiped after derivation.
pub struct SecureStorage {
    backend: Arc<dyn StorageBackend>,
    session_store: Arc<dyn StorageBackend>,
    keys: StorageKeys,
    cipher: OnceCell<Aes256Gcm>,
}

impl SecureStorage {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        session_store: Arc<dyn StorageBackend>,
        keys: StorageKeys,
    ) -> Self {
        Self {
            backend,
            session_store,
            keys,
            cipher: OnceCell::new(),
        }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Load or create the per-tab entropy secret.
    async fn entropy(&self) -> Result<Vec<u8>, WalletError> {
        let key = self.keys.entropy();
        if let Some(encoded) = self.session_store.get(&key).await? {
            return BASE64_STANDARD.decode(&encoded).map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("corrupt entropy record: {e}"))
            });
        }
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.session_store
            .set(&key, BASE64_STANDARD.encode(&bytes))
            .await?;
        debug!("Generated per-tab storage entropy");
        Ok(bytes)
    }

    /// Stable environment fingerprint folded into the key material. Keys
    /// intentionally do not verify across hosts.
    fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            self.keys.namespace(),
        )
    }

    async fn cipher(&self) -> Result<&Aes256Gcm, WalletError> {
        self.cipher
            .get_or_try_init(|| async {
                let mut password = self.entropy().await?;
                password.extend_from_slice(self.fingerprint().as_bytes());
                let salt = format!("near-connect-envelope:{}", self.keys.namespace());

                let mut key_bytes = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(
                    &password,
                    salt.as_bytes(),
                    PBKDF2_ITERATIONS,
                    &mut key_bytes,
                );
                password.zeroize();

                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
                key_bytes.zeroize();
                Ok(cipher)
            })
            .await
    }

    /// Store a value, optionally sealed and with a TTL.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), WalletError> {
        let envelope = Envelope {
            data: serde_json::to_value(value).map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("unserializable value: {e}"))
            })?,
            timestamp: Utc::now().timestamp_millis(),
            ttl: options.ttl.map(|t| t.as_millis() as u64),
            encrypted: options.encrypt,
        };

        let serialized = serde_json::to_string(&envelope).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("envelope encoding failed: {e}"))
        })?;

        let stored = if options.encrypt {
            let cipher = self.cipher().await?;
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&iv), serialized.as_bytes())
                .map_err(|_| {
                    WalletError::new(ErrorKind::InvalidData, "envelope encryption failed")
                })?;
            let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
            payload.extend_from_slice(&iv);
            payload.extend_from_slice(&ciphertext);
            format!("{ENC_TAG}{}", BASE64_STANDARD.encode(payload))
        } else {
            serialized
        };

        match self.backend.set(key, stored.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.message.contains("quota") => {
                warn!(key, "Storage quota hit, running cleanup and retrying once");
                self.purge_expired().await;
                self.backend.set(key, stored).await
            }
            Err(e) => Err(e),
        }
    }

    /// Read a value, unsealing and TTL-checking. Expired entries are
    /// removed and read as absent; corrupted ciphertext is removed and
    /// surfaced as an error.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, WalletError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };

        let serialized = if let Some(encoded) = raw.strip_prefix(ENC_TAG) {
            let payload = BASE64_STANDARD.decode(encoded).map_err(|_| {
                WalletError::new(ErrorKind::InvalidData, format!("corrupt envelope at {key}"))
            });
            let payload = match payload {
                Ok(p) if p.len() > IV_LEN => p,
                _ => {
                    self.backend.remove(key).await?;
                    return Err(WalletError::new(
                        ErrorKind::InvalidData,
                        format!("corrupt envelope at {key}"),
                    ));
                }
            };
            let (iv, ciphertext) = payload.split_at(IV_LEN);
            let cipher = self.cipher().await?;
            match cipher.decrypt(Nonce::from_slice(iv), ciphertext) {
                Ok(plaintext) => String::from_utf8(plaintext).map_err(|_| {
                    WalletError::new(ErrorKind::InvalidData, format!("corrupt envelope at {key}"))
                })?,
                Err(_) => {
                    // Tampered or keyed by another tab; drop the entry.
                    self.backend.remove(key).await?;
                    return Err(WalletError::new(
                        ErrorKind::InvalidData,
                        format!("envelope decryption failed at {key}"),
                    ));
                }
            }
        } else {
            raw
        };

        // Plain records are left in place on parse failure; only sealed
        // payloads that fail to open are dropped.
        let envelope: Envelope = serde_json::from_str(&serialized).map_err(|e| {
            WalletError::new(ErrorKind::InvalidData, format!("malformed envelope at {key}: {e}"))
        })?;

        if envelope.expired(Utc::now().timestamp_millis()) {
            self.backend.remove(key).await?;
            return Ok(None);
        }

        serde_json::from_value(envelope.data)
            .map(Some)
            .map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("envelope payload at {key}: {e}"))
            })
    }

    pub async fn remove(&self, key: &str) -> Result<(), WalletError> {
        self.backend.remove(key).await
    }

    /// Drop expired envelopes and unreadable ciphertext. Records that are
    /// not envelopes at all (raw mirrors, persisted state) are left alone.
    pub async fn purge_expired(&self) {
        let Ok(keys) = self.backend.keys().await else {
            return;
        };
        let now_ms = Utc::now().timestamp_millis();
        for key in keys {
            let Ok(Some(raw)) = self.backend.get(&key).await else {
                continue;
            };
            if raw.starts_with(ENC_TAG) {
                // Opens, TTL-checks, and drops corrupt ciphertext.
                let _ = self.get::<serde_json::Value>(&key).await;
            } else if let Ok(envelope) = serde_json::from_str::<Envelope>(&raw)
                && envelope.expired(now_ms)
            {
                let _ = self.backend.remove(&key).await;
            }
        }
    }
}
