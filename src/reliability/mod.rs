//! Connection reliability substrate: retry, timeout, circuit breaker,
//! state machine, health monitoring, and reconnection.

pub mod circuit;
pub mod health;
pub mod reconnect;
pub mod retry;
pub mod state_machine;
pub mod timeout;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{ConnectionHealth, HealthConfig, HealthMonitor};
pub use reconnect::{
    OperationKind, OperationQueue, ReconnectConfig, ReconnectTrigger, ReconnectionManager,
};
pub use retry::{RetryConfig, RetryHooks, with_retry, with_retry_if};
pub use state_machine::{
    ConnectionState, ConnectionStateMachine, StateMachineConfig, TransitionRecord,
};
pub use timeout::{DEFAULT_WARN_FRACTION, with_timeout, with_timeout_warn};
