//! Error taxonomy for the connector runtime.
//!
//! Every failure surfaced to a consumer is a [`WalletError`] carrying a
//! closed [`ErrorKind`], a developer message, a user-facing message from a
//! fixed table, recovery hints, and an optional source. Untyped errors from
//! drivers, RPC, or host APIs are funneled through [`WalletError::wrap`],
//! which classifies them by prioritized message patterns.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Suggested recovery actions attached to an error, drawn from a closed menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Install,
    Unlock,
    Retry,
    SwitchNetwork,
    Reconnect,
    ClearSession,
    SelectDifferentWallet,
    CheckBalance,
    ContactSupport,
    OpenApp,
    Refresh,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Unlock => "unlock",
            Self::Retry => "retry",
            Self::SwitchNetwork => "switch_network",
            Self::Reconnect => "reconnect",
            Self::ClearSession => "clear_session",
            Self::SelectDifferentWallet => "select_different_wallet",
            Self::CheckBalance => "check_balance",
            Self::ContactSupport => "contact_support",
            Self::OpenApp => "open_app",
            Self::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed set of error kinds the runtime can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    WalletNotFound,
    ExtensionNotInstalled,
    ExtensionLocked,
    UserRejected,
    ConnectionTimeout,
    NetworkMismatch,
    NetworkError,
    RpcError,
    SessionExpired,
    SessionInvalid,
    NoActiveSession,
    TransactionFailed,
    InsufficientFunds,
    InvalidTransaction,
    GasExceeded,
    SandboxBlocked,
    SandboxTimeout,
    ExecutorLoadFailed,
    SignMessageFailed,
    SignTransactionFailed,
    NoAccounts,
    AccountNotFound,
    ManifestLoadFailed,
    InvalidManifest,
    UnknownError,
    // Hardware-scoped kinds
    DeviceNotFound,
    DeviceLocked,
    DeviceBusy,
    AppNotOpen,
    WrongApp,
    AppVersionUnsupported,
    Timeout,
    InvalidData,
    DerivationPathError,
    TransactionTooLarge,
    TransportError,
    WebhidNotSupported,
    Disconnected,
}

impl ErrorKind {
    /// Stable wire/code form, e.g. `WALLET_NOT_FOUND`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WalletNotFound => "WALLET_NOT_FOUND",
            Self::ExtensionNotInstalled => "EXTENSION_NOT_INSTALLED",
            Self::ExtensionLocked => "EXTENSION_LOCKED",
            Self::UserRejected => "USER_REJECTED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::NetworkMismatch => "NETWORK_MISMATCH",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RpcError => "RPC_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionInvalid => "SESSION_INVALID",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::InvalidTransaction => "INVALID_TRANSACTION",
            Self::GasExceeded => "GAS_EXCEEDED",
            Self::SandboxBlocked => "SANDBOX_BLOCKED",
            Self::SandboxTimeout => "SANDBOX_TIMEOUT",
            Self::ExecutorLoadFailed => "EXECUTOR_LOAD_FAILED",
            Self::SignMessageFailed => "SIGN_MESSAGE_FAILED",
            Self::SignTransactionFailed => "SIGN_TRANSACTION_FAILED",
            Self::NoAccounts => "NO_ACCOUNTS",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Self::ManifestLoadFailed => "MANIFEST_LOAD_FAILED",
            Self::InvalidManifest => "INVALID_MANIFEST",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::DeviceLocked => "DEVICE_LOCKED",
            Self::DeviceBusy => "DEVICE_BUSY",
            Self::AppNotOpen => "APP_NOT_OPEN",
            Self::WrongApp => "WRONG_APP",
            Self::AppVersionUnsupported => "APP_VERSION_UNSUPPORTED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidData => "INVALID_DATA",
            Self::DerivationPathError => "DERIVATION_PATH_ERROR",
            Self::TransactionTooLarge => "TRANSACTION_TOO_LARGE",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::WebhidNotSupported => "WEBHID_NOT_SUPPORTED",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// Fixed user-facing message table keyed by kind.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::WalletNotFound => "The selected wallet could not be found.",
            Self::ExtensionNotInstalled => "The wallet extension is not installed.",
            Self::ExtensionLocked => "The wallet extension is locked. Please unlock it.",
            Self::UserRejected => "The request was rejected.",
            Self::ConnectionTimeout => "The connection timed out. Please try again.",
            Self::NetworkMismatch => "The wallet is connected to a different network.",
            Self::NetworkError => "A network error occurred. Check your connection.",
            Self::RpcError => "The blockchain node could not be reached.",
            Self::SessionExpired => "Your session has expired. Please reconnect.",
            Self::SessionInvalid => "Your session is no longer valid. Please reconnect.",
            Self::NoActiveSession => "No wallet is connected.",
            Self::TransactionFailed => "The transaction failed.",
            Self::InsufficientFunds => "Insufficient funds for this transaction.",
            Self::InvalidTransaction => "The transaction is invalid and was not sent.",
            Self::GasExceeded => "The transaction exceeded its gas allowance.",
            Self::SandboxBlocked => "The wallet sandbox blocked this request.",
            Self::SandboxTimeout => "The wallet sandbox did not respond in time.",
            Self::ExecutorLoadFailed => "The wallet failed to load.",
            Self::SignMessageFailed => "Message signing failed.",
            Self::SignTransactionFailed => "Transaction signing failed.",
            Self::NoAccounts => "No accounts are available in this wallet.",
            Self::AccountNotFound => "The requested account was not found.",
            Self::ManifestLoadFailed => "The wallet description could not be loaded.",
            Self::InvalidManifest => "The wallet description is invalid.",
            Self::UnknownError => "Something went wrong. Please try again.",
            Self::DeviceNotFound => "No hardware device was found. Connect and unlock it.",
            Self::DeviceLocked => "The device is locked. Enter your PIN.",
            Self::DeviceBusy => "The device is busy with another request.",
            Self::AppNotOpen => "Open the NEAR app on your device.",
            Self::WrongApp => "A different app is open on the device. Open the NEAR app.",
            Self::AppVersionUnsupported => "The device app version is not supported. Please update.",
            Self::Timeout => "The device did not respond in time.",
            Self::InvalidData => "The device rejected the request data.",
            Self::DerivationPathError => "The derivation path is invalid.",
            Self::TransactionTooLarge => "The transaction is too large for the device.",
            Self::TransportError => "Communication with the device failed.",
            Self::WebhidNotSupported => "This environment does not support HID devices.",
            Self::Disconnected => "The device was disconnected.",
        }
    }

    /// Recovery hints drawn from the closed [`RecoveryAction`] menu.
    pub fn recovery_actions(&self) -> &'static [RecoveryAction] {
        use RecoveryAction::*;
        match self {
            Self::WalletNotFound => &[SelectDifferentWallet],
            Self::ExtensionNotInstalled => &[Install, SelectDifferentWallet],
            Self::ExtensionLocked => &[Unlock, Retry],
            Self::UserRejected => &[Retry],
            Self::ConnectionTimeout => &[Retry, Reconnect],
            Self::NetworkMismatch => &[SwitchNetwork],
            Self::NetworkError => &[Retry, Refresh],
            Self::RpcError => &[Retry],
            Self::SessionExpired => &[Reconnect, ClearSession],
            Self::SessionInvalid => &[ClearSession, Reconnect],
            Self::NoActiveSession => &[Reconnect],
            Self::TransactionFailed => &[Retry, ContactSupport],
            Self::InsufficientFunds => &[CheckBalance],
            Self::InvalidTransaction => &[ContactSupport],
            Self::GasExceeded => &[Retry, CheckBalance],
            Self::SandboxBlocked => &[Refresh, SelectDifferentWallet],
            Self::SandboxTimeout => &[Retry, Refresh],
            Self::ExecutorLoadFailed => &[Refresh, Retry],
            Self::SignMessageFailed => &[Retry],
            Self::SignTransactionFailed => &[Retry],
            Self::NoAccounts => &[SelectDifferentWallet],
            Self::AccountNotFound => &[ClearSession, Reconnect],
            Self::ManifestLoadFailed => &[Retry, Refresh],
            Self::InvalidManifest => &[SelectDifferentWallet, ContactSupport],
            Self::UnknownError => &[Retry, ContactSupport],
            Self::DeviceNotFound => &[Reconnect, Retry],
            Self::DeviceLocked => &[Unlock, Retry],
            Self::DeviceBusy => &[Retry],
            Self::AppNotOpen => &[OpenApp, Retry],
            Self::WrongApp => &[OpenApp, Retry],
            Self::AppVersionUnsupported => &[Install, ContactSupport],
            Self::Timeout => &[Retry],
            Self::InvalidData => &[ContactSupport],
            Self::DerivationPathError => &[ContactSupport],
            Self::TransactionTooLarge => &[ContactSupport],
            Self::TransportError => &[Reconnect, Retry],
            Self::WebhidNotSupported => &[SelectDifferentWallet],
            Self::Disconnected => &[Reconnect],
        }
    }

    /// Whether the condition can in principle be recovered from by the user.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidManifest | Self::InvalidTransaction)
    }

    /// Default retry predicate: transient network-class failures only.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RpcError | Self::ConnectionTimeout | Self::Timeout
        )
    }

    /// Hardware-scoped kinds, used to route device failures to the
    /// `hardware:error` audit type.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound
                | Self::DeviceLocked
                | Self::DeviceBusy
                | Self::AppNotOpen
                | Self::WrongApp
                | Self::AppVersionUnsupported
                | Self::Timeout
                | Self::DerivationPathError
                | Self::TransactionTooLarge
                | Self::TransportError
                | Self::WebhidNotSupported
                | Self::Disconnected
        )
    }

    /// Classify an untyped error message into a kind.
    ///
    /// Rules are applied in priority order; the first match wins.
    pub fn classify(message: &str) -> Self {
        let text = message.to_lowercase();
        let has = |needle: &str| text.contains(needle);

        if has("rejected") || has("denied") || has("cancelled") || has("canceled")
            || has("popup closed")
        {
            return Self::UserRejected;
        }
        if has("timeout") || has("timed out") {
            return Self::ConnectionTimeout;
        }
        if has("network") && (has("mismatch") || has("wrong") || has("invalid")) {
            return Self::NetworkMismatch;
        }
        if has("insufficient funds") || has("insufficient balance") {
            return Self::InsufficientFunds;
        }
        if has("gas") && (has("exceed") || has("limit") || has("not enough")) {
            return Self::GasExceeded;
        }
        if has("sign") && (has("failed") || has("error")) {
            return if has("message") {
                Self::SignMessageFailed
            } else {
                Self::SignTransactionFailed
            };
        }
        if has("sandbox") || has("iframe") || has("blocked") {
            return Self::SandboxBlocked;
        }
        if has("executor") || has("failed to load") {
            return Self::ExecutorLoadFailed;
        }
        if has("rpc") || has("jsonrpc") || has("fetch failed") || has("network request") {
            return Self::RpcError;
        }
        if has("session") {
            if has("expired") {
                return Self::SessionExpired;
            }
            if has("invalid") {
                return Self::SessionInvalid;
            }
        }
        if has("account not found") {
            return Self::AccountNotFound;
        }
        if has("no account") {
            return Self::NoAccounts;
        }
        if has("extension") {
            if has("not installed") {
                return Self::ExtensionNotInstalled;
            }
            if has("locked") {
                return Self::ExtensionLocked;
            }
        }
        Self::UnknownError
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A typed connector error.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct WalletError {
    /// Which closed taxonomy entry this is.
    pub kind: ErrorKind,
    /// Developer-facing message.
    pub message: String,
    /// Wallet the error is attributed to, if any.
    pub wallet_id: Option<String>,
    /// When the error was created.
    pub timestamp: DateTime<Utc>,
    /// Underlying cause, if wrapped.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WalletError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            wallet_id: None,
            timestamp: Utc::now(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_wallet(mut self, wallet_id: impl Into<String>) -> Self {
        self.wallet_id = Some(wallet_id.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Classify an untyped error by its message text and wrap it.
    pub fn wrap(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let message = source.to_string();
        let kind = ErrorKind::classify(&message);
        Self::new(kind, message).with_source(source)
    }

    /// Like [`WalletError::wrap`] for plain message strings.
    pub fn wrap_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::classify(&message), message)
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    pub fn recovery_actions(&self) -> &'static [RecoveryAction] {
        self.kind.recovery_actions()
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

impl Clone for WalletError {
    fn clone(&self) -> Self {
        // Sources are not Clone; the chain is flattened into the message.
        Self {
            kind: self.kind,
            message: self.message.clone(),
            wallet_id: self.wallet_id.clone(),
            timestamp: self.timestamp,
            source: None,
        }
    }
}
