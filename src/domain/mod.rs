//! Domain layer containing core types, traits, and error definitions.

pub mod account;
pub mod error;
pub mod manifest;
pub mod session;
pub mod traits;
pub mod transaction;

pub use account::{Account, KeyType, Network, PublicKey};
pub use error::{ErrorKind, RecoveryAction, WalletError};
pub use manifest::{
    DeepLinkConfig, DeepLinkPaths, WalletConnectConfig, WalletFeatures, WalletManifest,
    WalletPermissions, WalletRepository, WalletType,
};
pub use session::{DEFAULT_SESSION_MAX_AGE_SECS, MultiAccountRecord, WalletSession};
pub use traits::{
    ExecutionOutcome, FinalExecutionStatus, SignInParams, SignedMessage, StorageBackend,
    TransactionParams, WalletDriver,
};
pub use transaction::{
    AccessKey, AccessKeyPermission, Action, Nep413Payload, ONE_NEAR, Transaction,
    serialize_signed, serialize_transaction,
};
