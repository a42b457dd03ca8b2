//! Wallet manifest data model.
//!
//! Manifests are declarative: the runtime uses them to pick a driver tier
//! and to gate features. Unknown JSON fields are ignored so newer manifests
//! keep loading on older runtimes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::domain::{ErrorKind, WalletError};

/// Driver tier a wallet is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletType {
    /// Runs inside a sandboxed iframe executor.
    Sandbox,
    /// Injected provider (browser extension content script).
    Injected,
    /// Privileged host integration (hardware devices, native bridges).
    Privileged,
    /// Reached out-of-process: deep link, redirect, or relay.
    External,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Injected => "injected",
            Self::Privileged => "privileged",
            Self::External => "external",
        }
    }
}

/// Capability set declared by a wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletFeatures {
    pub sign_message: bool,
    pub sign_transaction: bool,
    pub sign_and_send: bool,
    pub sign_and_send_batch: bool,
    pub mainnet: bool,
    pub testnet: bool,
}

/// Host permissions a wallet requests. Unrecognized permission names are
/// preserved in `extra` rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletPermissions {
    pub storage: bool,
    pub wallet_connect: bool,
    pub hid: bool,
    pub clipboard: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Deep-link paths for the operations an external wallet supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepLinkPaths {
    #[serde(default = "default_connect_path")]
    pub connect: String,
    #[serde(default = "default_sign_path")]
    pub sign_transaction: String,
    #[serde(default = "default_sign_message_path")]
    pub sign_message: String,
}

fn default_connect_path() -> String {
    "connect".to_string()
}

fn default_sign_path() -> String {
    "sign".to_string()
}

fn default_sign_message_path() -> String {
    "sign-message".to_string()
}

impl Default for DeepLinkPaths {
    fn default() -> Self {
        Self {
            connect: default_connect_path(),
            sign_transaction: default_sign_path(),
            sign_message: default_sign_message_path(),
        }
    }
}

/// Deep-link dispatch configuration for an external wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepLinkConfig {
    /// URL scheme the wallet app registers, e.g. `mywallet`.
    pub scheme: String,
    #[serde(default)]
    pub paths: DeepLinkPaths,
    /// App-store page offered when the scheme appears unhandled.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app_store_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub play_store_url: Option<String>,
}

/// WalletConnect pairing configuration for an external wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConnectConfig {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relay_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata_url: Option<String>,
}

/// A single wallet manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletManifest {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub website: String,
    pub version: String,
    #[serde(rename = "type")]
    pub wallet_type: WalletType,
    #[serde(default)]
    pub permissions: WalletPermissions,
    #[serde(default)]
    pub features: WalletFeatures,
    /// Executor URL; required when `wallet_type` is [`WalletType::Sandbox`].
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub executor: Option<String>,
    /// Trusted message origins for this wallet.
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deep_link: Option<DeepLinkConfig>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wallet_connect: Option<WalletConnectConfig>,
}

impl Validate for WalletManifest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("icon", &self.icon),
            ("description", &self.description),
            ("website", &self.website),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                errors.add(field, ValidationError::new("required field is empty"));
            }
        }

        if self.wallet_type == WalletType::Sandbox
            && self.executor.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            errors.add(
                "executor",
                ValidationError::new("sandbox wallets require an executor URL"),
            );
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl WalletManifest {
    /// Validate shape and convert failures into the typed taxonomy.
    pub fn check(&self) -> Result<(), WalletError> {
        self.validate().map_err(|e| {
            WalletError::new(ErrorKind::InvalidManifest, format!("manifest {}: {e}", self.id))
        })
    }

    /// Whether the wallet supports the given network.
    pub fn supports_network(&self, network: crate::domain::Network) -> bool {
        match network {
            crate::domain::Network::Mainnet => self.features.mainnet,
            crate::domain::Network::Testnet => self.features.testnet,
        }
    }
}

/// Aggregate of manifests published by a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRepository {
    pub version: String,
    pub wallets: Vec<WalletManifest>,
}

impl WalletRepository {
    /// Parse a repository document, dropping invalid entries with a warning
    /// instead of failing the whole load.
    pub fn parse(json: &str) -> Result<Self, WalletError> {
        let mut repo: WalletRepository = serde_json::from_str(json).map_err(|e| {
            WalletError::new(ErrorKind::ManifestLoadFailed, format!("repository parse failed: {e}"))
        })?;

        repo.wallets.retain(|manifest| match manifest.check() {
            Ok(()) => true,
            Err(e) => {
                warn!(wallet_id = %manifest.id, error = %e, "Dropping invalid manifest entry");
                false
            }
        });

        Ok(repo)
    }

    pub fn find(&self, wallet_id: &str) -> Option<&WalletManifest> {
        self.wallets.iter().find(|w| w.id == wallet_id)
    }
}
