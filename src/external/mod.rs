//! External-wallet orchestrator: deep links, WalletConnect, and redirect
//! flows with callback correlation.

pub mod deeplink;
pub mod orchestrator;
pub mod pending;
pub mod walletconnect;

pub use deeplink::{CallbackParams, DeepLinkContext, parse_callback_url};
pub use orchestrator::{
    DispatchedRequest, ExternalSessionCache, ExternalTransport, ExternalWalletConfig,
    ExternalWalletOrchestrator, Platform, ResumedRequest,
};
pub use pending::{
    DEFAULT_REQUEST_TTL, ExternalRequestKind, PendingRecord, PendingRequestRegistry,
};
pub use walletconnect::{
    NEAR_NAMESPACE, ProposalNamespace, RelayClient, WC_EVENTS, WC_METHODS, WalletConnectConnector,
    WcSession, parse_wc_account,
};
