//! Cross-cutting security layer: risk analysis, origin trust, request
//! throttling, and auditability.

pub mod audit;
pub mod origin;
pub mod rate_limit;
pub mod risk;

pub use audit::{AuditConfig, AuditEntry, AuditEvent, AuditEventType, AuditLog, AuditQuery};
pub use origin::{OriginGuard, OriginGuardConfig};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use risk::{RiskAnalyzer, RiskAssessment, RiskConfig, RiskLevel, RiskValidation};
