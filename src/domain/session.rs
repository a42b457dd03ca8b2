//! Persisted session records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Account, ErrorKind, Network, WalletError};

/// Default maximum session age accepted on restore: 24 hours.
pub const DEFAULT_SESSION_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// A wallet session as persisted in durable storage.
///
/// A session is authoritative only while the connection state machine is in
/// `Connected`; a restored session elevates back to `Connected` only after a
/// successful account re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSession {
    pub wallet_id: String,
    pub accounts: Vec<Account>,
    pub network: Network,
    pub connected_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Value>,
}

impl WalletSession {
    pub fn new(wallet_id: impl Into<String>, accounts: Vec<Account>, network: Network) -> Self {
        let now = Utc::now();
        Self {
            wallet_id: wallet_id.into(),
            accounts,
            network,
            connected_at: now,
            last_active_at: now,
            metadata: None,
        }
    }

    /// Mark the session as active now.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.connected_at
    }

    /// Validate shape and freshness on restore.
    pub fn check(&self, max_age_secs: i64) -> Result<(), WalletError> {
        if self.wallet_id.trim().is_empty() {
            return Err(WalletError::new(
                ErrorKind::SessionInvalid,
                "session has no wallet id",
            ));
        }
        if self.accounts.is_empty() {
            return Err(WalletError::new(
                ErrorKind::SessionInvalid,
                "session has no accounts",
            ));
        }
        if self.age() > Duration::seconds(max_age_secs) {
            return Err(WalletError::new(
                ErrorKind::SessionExpired,
                format!("session older than {max_age_secs}s"),
            )
            .with_wallet(self.wallet_id.clone()));
        }
        Ok(())
    }
}

/// Multi-account record persisted under `<ns>:accounts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAccountRecord {
    pub accounts: Vec<Account>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active_account_id: Option<String>,
}

impl MultiAccountRecord {
    pub fn active(&self) -> Option<&Account> {
        match &self.active_account_id {
            Some(id) => self.accounts.iter().find(|a| &a.account_id == id),
            None => self.accounts.first(),
        }
    }
}
