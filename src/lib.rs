//! # near-connect
//!
//! A wallet connector runtime for NEAR. It mediates between an embedding
//! application and a heterogeneous fleet of wallets: USB-HID hardware
//! devices (full framing, APDU, and signing protocol), out-of-process
//! wallets reached by deep link, redirect, or a WalletConnect relay, and
//! anything else exposing the uniform six-operation driver contract.
//!
//! The runtime owns connection lifecycle, session persistence, transaction
//! risk analysis, request throttling, auditability, and origin
//! verification. Every operation runs the same pipeline: rate limit,
//! circuit breaker, connection state machine, risk gate, timed driver
//! dispatch, audit trail.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use near_connect::domain::SignInParams;
//! use near_connect::runtime::{CancelToken, ConnectorRuntime, RuntimeConfig};
//! use near_connect::storage::MemoryStorage;
//!
//! # async fn example(driver: Arc<dyn near_connect::domain::WalletDriver>) {
//! let runtime = ConnectorRuntime::new(
//!     RuntimeConfig::from_env(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryStorage::new()),
//! );
//! runtime.register_driver(driver);
//! let accounts = runtime
//!     .connect("my-wallet", SignInParams::default(), &CancelToken::never())
//!     .await;
//! # let _ = accounts;
//! # }
//! ```

pub mod csp;
pub mod domain;
pub mod events;
pub mod external;
pub mod hardware;
pub mod reliability;
pub mod rpc;
pub mod runtime;
pub mod security;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use domain::{
    Account, ErrorKind, Network, PublicKey, WalletDriver, WalletError, WalletManifest,
    WalletSession,
};
pub use events::{ConnectorEvent, EventBus};
pub use runtime::{CancelToken, ConnectorRuntime, RuntimeConfig};
