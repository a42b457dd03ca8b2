//! Account and public-key types.

use serde::{Deserialize, Serialize};

use crate::domain::{ErrorKind, WalletError};

/// Supported signature schemes. NEAR wallets in this runtime sign with
/// ed25519 only; the tag is kept explicit for the wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
        }
    }
}

/// A tagged public key: algorithm + 32-byte body.
///
/// The canonical display form is `ed25519:<base58 body>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub key_type: KeyType,
    data: [u8; 32],
}

impl PublicKey {
    pub fn from_ed25519_bytes(data: [u8; 32]) -> Self {
        Self {
            key_type: KeyType::Ed25519,
            data,
        }
    }

    /// Parse the `ed25519:<base58>` display form.
    pub fn parse(s: &str) -> Result<Self, WalletError> {
        let (tag, body) = s.split_once(':').unwrap_or(("ed25519", s));
        if tag != "ed25519" {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                format!("unsupported key type: {tag}"),
            ));
        }
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| WalletError::new(ErrorKind::InvalidData, format!("bad public key encoding: {e}")))?;
        let data: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            WalletError::new(
                ErrorKind::InvalidData,
                format!("public key must be 32 bytes, got {}", v.len()),
            )
        })?;
        Ok(Self::from_ed25519_bytes(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.data
    }

    /// Derive the implicit account ID: lowercase hex of the raw key bytes.
    pub fn implicit_account_id(&self) -> String {
        hex::encode(self.data)
    }

    /// Validate that the bytes form a point on the curve.
    pub fn verifying_key(&self) -> Result<ed25519_dalek::VerifyingKey, WalletError> {
        ed25519_dalek::VerifyingKey::from_bytes(&self.data)
            .map_err(|e| WalletError::new(ErrorKind::InvalidData, format!("invalid ed25519 key: {e}")))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.key_type.as_str(),
            bs58::encode(&self.data).into_string()
        )
    }
}

impl std::str::FromStr for PublicKey {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An account as surfaced by drivers: identifier plus optional public key.
/// Never carries private material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<PublicKey>,
}

impl Account {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            public_key: None,
        }
    }

    #[must_use]
    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }
}

/// Target chain network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    /// CAIP-2-style chain identifier used by relay namespaces.
    pub fn chain_id(&self) -> String {
        format!("near:{}", self.as_str())
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://rpc.mainnet.near.org",
            Self::Testnet => "https://rpc.testnet.near.org",
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            _ => Err(format!("Invalid network: {}", s)),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_public_key_display_roundtrip() {
        let key = PublicKey::from_ed25519_bytes([7u8; 32]);
        let text = key.to_string();
        assert!(text.starts_with("ed25519:"));
        assert_eq!(PublicKey::parse(&text).unwrap(), key);
    }

    #[test]
    fn test_public_key_accepts_untagged_base58() {
        let key = PublicKey::from_ed25519_bytes([1u8; 32]);
        let body = bs58::encode(key.as_bytes()).into_string();
        assert_eq!(PublicKey::parse(&body).unwrap(), key);
    }

    #[test]
    fn test_public_key_rejects_wrong_length() {
        let short = bs58::encode(&[1u8; 16]).into_string();
        let err = PublicKey::parse(&short).unwrap_err();
        assert_eq!(err.kind, crate::domain::ErrorKind::InvalidData);
    }

    #[test]
    fn test_implicit_account_id_is_lowercase_hex() {
        let key = PublicKey::from_ed25519_bytes([0xAB; 32]);
        let account = key.implicit_account_id();
        assert_eq!(account.len(), 64);
        assert_eq!(account, "ab".repeat(32));
    }

    #[test]
    fn test_network_parsing_and_chain_id() {
        assert_eq!(Network::from_str("testnet").unwrap(), Network::Testnet);
        assert_eq!(Network::Mainnet.chain_id(), "near:mainnet");
        assert!(Network::from_str("localnet").is_err());
    }

    #[test]
    fn test_account_serde() {
        let account = Account::new("alice.near")
            .with_public_key(PublicKey::from_ed25519_bytes([2u8; 32]));
        let json = serde_json::to_string(&account).unwrap();
        let back: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(back, account);
    }
}
