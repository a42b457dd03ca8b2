//! Transaction risk analyzer.
//!
//! A pure rule table over `{receiver_id, actions}`. Rules apply in order and
//! the per-action level escalates monotonically; adding an action can never
//! lower the overall level. Only a `critical` result blocks the transaction.

use std::collections::HashSet;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::domain::{Action, ONE_NEAR};

/// Risk level, ordered from benign to blocking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of [`RiskAnalyzer::analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub requires_explicit_approval: bool,
}

/// Outcome of [`RiskAnalyzer::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub risk: RiskAssessment,
}

/// Method names that grant account control and always block.
const DANGEROUS_METHODS: &[&str] = &[
    "add_full_access_key",
    "delete_account",
    "deploy",
    "add_key",
    "delete_key",
];

/// Argument substrings that suggest credential exfiltration.
const SUSPICIOUS_ARG_PATTERNS: &[&str] = &["private_key", "seed_phrase", "secret_key", "mnemonic"];

/// Seed set of receivers known to run drainer campaigns.
const KNOWN_SCAM_RECEIVERS: &[&str] = &[
    "free-near-claim.near",
    "near-giveaway.near",
    "wallet-verify.near",
    "airdrop-bonus.near",
];

/// Escalates at and above 100 NEAR; see also `high_transfer_threshold`.
const MEDIUM_TRANSFER_THRESHOLD: u128 = 100 * ONE_NEAR;
const HIGH_TRANSFER_THRESHOLD: u128 = 1000 * ONE_NEAR;

#[derive(Debug, Clone, Default)]
pub struct RiskConfig {
    /// Absolute per-action transfer ceiling; above it the action is high.
    pub max_transfer_amount: Option<u128>,
    pub blocked_receivers: HashSet<String>,
    /// When set, any receiver outside the list is at least medium.
    pub allowed_receivers: Option<HashSet<String>>,
    pub blocked_methods: HashSet<String>,
    /// When set, any method outside the list is at least medium.
    pub allowed_methods: Option<HashSet<String>>,
    pub max_gas_per_action: Option<u64>,
    /// Force explicit approval regardless of level.
    pub always_require_approval: bool,
}

/// Pure risk analyzer; mutability is confined to the custom scam set.
pub struct RiskAnalyzer {
    config: RiskConfig,
    custom_scam_receivers: DashSet<String>,
}

impl RiskAnalyzer {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            custom_scam_receivers: DashSet::new(),
        }
    }

    /// Add a receiver to the custom scam set.
    pub fn add_scam_receiver(&self, receiver_id: impl Into<String>) {
        self.custom_scam_receivers.insert(receiver_id.into());
    }

    pub fn remove_scam_receiver(&self, receiver_id: &str) -> bool {
        self.custom_scam_receivers.remove(receiver_id).is_some()
    }

    pub fn list_scam_receivers(&self) -> Vec<String> {
        self.custom_scam_receivers
            .iter()
            .map(|r| r.key().clone())
            .collect()
    }

    fn is_known_scam(&self, receiver_id: &str) -> bool {
        KNOWN_SCAM_RECEIVERS.contains(&receiver_id)
            || self.custom_scam_receivers.contains(receiver_id)
    }

    /// Analyze a transaction shape. Never mutates; pure modulo the
    /// configured blocklists.
    pub fn analyze(&self, receiver_id: &str, actions: &[Action]) -> RiskAssessment {
        let mut level = RiskLevel::Low;
        let mut reasons = Vec::new();
        let mut escalate = |level: &mut RiskLevel, to: RiskLevel, reason: String| {
            if to > *level {
                *level = to;
            }
            reasons.push(reason);
        };

        // Receiver checks first.
        if self.is_known_scam(receiver_id) {
            escalate(
                &mut level,
                RiskLevel::Critical,
                format!("Receiver {receiver_id} is a known scam address"),
            );
        }
        if self.config.blocked_receivers.contains(receiver_id) {
            escalate(
                &mut level,
                RiskLevel::Critical,
                format!("Receiver {receiver_id} is blocked"),
            );
        }
        if let Some(allowed) = &self.config.allowed_receivers
            && !allowed.contains(receiver_id)
        {
            escalate(
                &mut level,
                RiskLevel::Medium,
                format!("Receiver {receiver_id} is not in the allowed list"),
            );
        }

        for action in actions {
            self.analyze_action(action, &mut level, &mut reasons);
        }

        let requires_explicit_approval = self.config.always_require_approval
            || level >= RiskLevel::High;

        RiskAssessment {
            level,
            reasons,
            requires_explicit_approval,
        }
    }

    fn analyze_action(&self, action: &Action, level: &mut RiskLevel, reasons: &mut Vec<String>) {
        let mut escalate = |level: &mut RiskLevel, to: RiskLevel, reason: String| {
            if to > *level {
                *level = to;
            }
            reasons.push(reason);
        };

        match action {
            Action::Transfer { deposit } => {
                if let Some(max) = self.config.max_transfer_amount
                    && *deposit > max
                {
                    escalate(
                        level,
                        RiskLevel::High,
                        format!("Transfer of {deposit} exceeds the configured maximum"),
                    );
                }
                if *deposit >= HIGH_TRANSFER_THRESHOLD {
                    escalate(
                        level,
                        RiskLevel::High,
                        "Very large transfer (1000+ NEAR)".to_string(),
                    );
                } else if *deposit >= MEDIUM_TRANSFER_THRESHOLD {
                    escalate(
                        level,
                        RiskLevel::Medium,
                        "Large transfer (100+ NEAR)".to_string(),
                    );
                }
            }
            Action::FunctionCall {
                method_name,
                args,
                gas,
                ..
            } => {
                if DANGEROUS_METHODS.contains(&method_name.as_str()) {
                    escalate(
                        level,
                        RiskLevel::Critical,
                        format!("Method {method_name} can take over the account"),
                    );
                }
                if self.config.blocked_methods.contains(method_name) {
                    escalate(
                        level,
                        RiskLevel::Critical,
                        format!("Method {method_name} is blocked"),
                    );
                }
                if let Some(allowed) = &self.config.allowed_methods
                    && !allowed.contains(method_name)
                {
                    escalate(
                        level,
                        RiskLevel::Medium,
                        format!("Method {method_name} is not in the allowed list"),
                    );
                }
                if let Some(max_gas) = self.config.max_gas_per_action
                    && *gas > max_gas
                {
                    escalate(
                        level,
                        RiskLevel::Medium,
                        format!("Gas {gas} exceeds the per-action maximum"),
                    );
                }
                let args_text = String::from_utf8_lossy(args).to_lowercase();
                if SUSPICIOUS_ARG_PATTERNS.iter().any(|p| args_text.contains(p)) {
                    escalate(
                        level,
                        RiskLevel::High,
                        "Arguments match a suspicious pattern".to_string(),
                    );
                }
            }
            Action::AddKey { access_key, .. } => {
                if access_key.permission.is_full_access() {
                    escalate(
                        level,
                        RiskLevel::Critical,
                        "Adding full access key - grants complete account control".to_string(),
                    );
                } else {
                    escalate(
                        level,
                        RiskLevel::Medium,
                        "Adding a function-call access key".to_string(),
                    );
                }
            }
            Action::DeleteKey { .. } => {
                escalate(
                    level,
                    RiskLevel::High,
                    "Deleting an access key".to_string(),
                );
            }
            Action::DeleteAccount { beneficiary_id } => {
                escalate(
                    level,
                    RiskLevel::Critical,
                    format!("Deleting the account, funds go to {beneficiary_id}"),
                );
            }
            Action::DeployContract { .. } => {
                escalate(
                    level,
                    RiskLevel::Critical,
                    "Deploying contract code".to_string(),
                );
            }
            Action::Stake { .. } => {
                escalate(level, RiskLevel::Medium, "Staking action".to_string());
            }
            Action::CreateAccount => {}
        }
    }

    /// Validate a transaction: invalid iff the final level is critical.
    pub fn validate(&self, receiver_id: &str, actions: &[Action]) -> RiskValidation {
        let risk = self.analyze(receiver_id, actions);
        let valid = risk.level != RiskLevel::Critical;
        let error = (!valid).then(|| format!("Transaction blocked: {}", risk.reasons.join("; ")));
        RiskValidation { valid, error, risk }
    }
}

impl Default for RiskAnalyzer {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}
