//! Test support: mock drivers, devices, and relay clients.

pub mod mocks;

pub use mocks::{MockConfig, MockHidBackend, MockHidScript, MockRelayClient, MockWalletDriver};
