//! Transaction model and canonical wire encoding.
//!
//! The wire format is the chain's deterministic length-prefixed binary
//! encoding (little-endian unless noted). Hardware devices sign exactly
//! these bytes, so the encoder is hand-written against the byte layout
//! rather than derived.

use serde::{Deserialize, Serialize};

use crate::domain::{ErrorKind, PublicKey, WalletError};

/// One NEAR in yocto units.
pub const ONE_NEAR: u128 = 1_000_000_000_000_000_000_000_000;

/// Serde helper: byte payloads as base64 strings in JSON.
mod base64_bytes {
    use base64::{Engine as _, prelude::BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper: u128 balances as decimal strings in JSON.
mod u128_dec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod u128_dec_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|v| v.parse().map_err(serde::de::Error::custom)).transpose()
    }
}

/// Access-key permission attached to an [`Action::AddKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "permission", rename_all = "camelCase")]
pub enum AccessKeyPermission {
    FullAccess,
    #[serde(rename_all = "camelCase")]
    FunctionCall {
        #[serde(with = "u128_dec_opt", default, skip_serializing_if = "Option::is_none")]
        allowance: Option<u128>,
        receiver_id: String,
        #[serde(default)]
        method_names: Vec<String>,
    },
}

impl AccessKeyPermission {
    pub fn is_full_access(&self) -> bool {
        matches!(self, Self::FullAccess)
    }
}

/// An access key as carried by [`Action::AddKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    #[serde(default)]
    pub nonce: u64,
    #[serde(flatten)]
    pub permission: AccessKeyPermission,
}

impl AccessKey {
    pub fn full_access() -> Self {
        Self {
            nonce: 0,
            permission: AccessKeyPermission::FullAccess,
        }
    }

    pub fn function_call(receiver_id: impl Into<String>, method_names: Vec<String>) -> Self {
        Self {
            nonce: 0,
            permission: AccessKeyPermission::FunctionCall {
                allowance: None,
                receiver_id: receiver_id.into(),
                method_names,
            },
        }
    }
}

/// A transaction action. Wire discriminants are fixed by declaration order:
/// CreateAccount=0, DeployContract=1, FunctionCall=2, Transfer=3, Stake=4,
/// AddKey=5, DeleteKey=6, DeleteAccount=7.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    CreateAccount,
    DeployContract {
        #[serde(with = "base64_bytes")]
        code: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    FunctionCall {
        method_name: String,
        #[serde(with = "base64_bytes")]
        args: Vec<u8>,
        gas: u64,
        #[serde(with = "u128_dec")]
        deposit: u128,
    },
    Transfer {
        #[serde(with = "u128_dec")]
        deposit: u128,
    },
    #[serde(rename_all = "camelCase")]
    Stake {
        #[serde(with = "u128_dec")]
        stake: u128,
        public_key: PublicKey,
    },
    #[serde(rename_all = "camelCase")]
    AddKey {
        public_key: PublicKey,
        access_key: AccessKey,
    },
    #[serde(rename_all = "camelCase")]
    DeleteKey { public_key: PublicKey },
    #[serde(rename_all = "camelCase")]
    DeleteAccount { beneficiary_id: String },
}

impl Action {
    pub fn discriminant(&self) -> u8 {
        match self {
            Self::CreateAccount => 0,
            Self::DeployContract { .. } => 1,
            Self::FunctionCall { .. } => 2,
            Self::Transfer { .. } => 3,
            Self::Stake { .. } => 4,
            Self::AddKey { .. } => 5,
            Self::DeleteKey { .. } => 6,
            Self::DeleteAccount { .. } => 7,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateAccount => "create_account",
            Self::DeployContract { .. } => "deploy_contract",
            Self::FunctionCall { .. } => "function_call",
            Self::Transfer { .. } => "transfer",
            Self::Stake { .. } => "stake",
            Self::AddKey { .. } => "add_key",
            Self::DeleteKey { .. } => "delete_key",
            Self::DeleteAccount { .. } => "delete_account",
        }
    }
}

/// A full transaction ready for wire encoding and device signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub signer_id: String,
    pub public_key: PublicKey,
    pub nonce: u64,
    pub receiver_id: String,
    #[serde(with = "base64_bytes")]
    pub block_hash: Vec<u8>,
    pub actions: Vec<Action>,
}

/// NEP-413 structured message-signing payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nep413Payload {
    pub message: String,
    pub recipient: String,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub callback_url: Option<String>,
}

impl Nep413Payload {
    pub fn new(message: impl Into<String>, recipient: impl Into<String>, nonce: [u8; 32]) -> Self {
        Self {
            message: message.into(),
            recipient: recipient.into(),
            nonce: nonce.to_vec(),
            callback_url: None,
        }
    }

    pub fn check(&self) -> Result<(), WalletError> {
        if self.nonce.len() != 32 {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                format!("NEP-413 nonce must be 32 bytes, got {}", self.nonce.len()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// WIRE ENCODING
// ============================================================================

/// Little-endian, length-prefixed wire writer.
struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn fixed(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn public_key(&mut self, key: &PublicKey) {
        // Key-type enum tag (ed25519 = 0) followed by the 32 raw bytes.
        self.u8(0);
        self.fixed(key.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn write_access_key(w: &mut WireWriter, key: &AccessKey) {
    w.u64(key.nonce);
    match &key.permission {
        AccessKeyPermission::FunctionCall {
            allowance,
            receiver_id,
            method_names,
        } => {
            w.u8(0);
            match allowance {
                Some(v) => {
                    w.u8(1);
                    w.u128(*v);
                }
                None => w.u8(0),
            }
            w.string(receiver_id);
            w.u32(method_names.len() as u32);
            for name in method_names {
                w.string(name);
            }
        }
        AccessKeyPermission::FullAccess => w.u8(1),
    }
}

fn write_action(w: &mut WireWriter, action: &Action) {
    w.u8(action.discriminant());
    match action {
        Action::CreateAccount => {}
        Action::DeployContract { code } => w.bytes(code),
        Action::FunctionCall {
            method_name,
            args,
            gas,
            deposit,
        } => {
            w.string(method_name);
            w.bytes(args);
            w.u64(*gas);
            w.u128(*deposit);
        }
        Action::Transfer { deposit } => w.u128(*deposit),
        Action::Stake { stake, public_key } => {
            w.u128(*stake);
            w.public_key(public_key);
        }
        Action::AddKey {
            public_key,
            access_key,
        } => {
            w.public_key(public_key);
            write_access_key(w, access_key);
        }
        Action::DeleteKey { public_key } => w.public_key(public_key),
        Action::DeleteAccount { beneficiary_id } => w.string(beneficiary_id),
    }
}

/// Encode a transaction into its canonical wire form.
pub fn serialize_transaction(tx: &Transaction) -> Result<Vec<u8>, WalletError> {
    if tx.block_hash.len() != 32 {
        return Err(WalletError::new(
            ErrorKind::InvalidTransaction,
            format!("block hash must be 32 bytes, got {}", tx.block_hash.len()),
        ));
    }

    let mut w = WireWriter::new();
    w.string(&tx.signer_id);
    w.public_key(&tx.public_key);
    w.u64(tx.nonce);
    w.string(&tx.receiver_id);
    w.fixed(&tx.block_hash);
    w.u32(tx.actions.len() as u32);
    for action in &tx.actions {
        write_action(&mut w, action);
    }
    Ok(w.finish())
}

/// Bind a 64-byte ed25519 signature to already-encoded transaction bytes,
/// producing the signed envelope: `tx ‖ [0u8] ‖ signature`.
pub fn serialize_signed(tx_bytes: &[u8], signature: &[u8; 64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx_bytes.len() + 1 + 64);
    out.extend_from_slice(tx_bytes);
    out.push(0); // signature-type enum: ed25519
    out.extend_from_slice(signature);
    out
}
