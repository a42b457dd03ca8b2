//! Namespaced storage key layout.

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "near-connect";

/// Produces the fixed key names under a namespace prefix.
#[derive(Debug, Clone)]
pub struct StorageKeys {
    prefix: String,
}

impl StorageKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            prefix: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.prefix
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// Serialized connection state; only `connected` is ever restored.
    pub fn state(&self) -> String {
        self.key("state")
    }

    pub fn session(&self) -> String {
        self.key("session")
    }

    pub fn accounts(&self) -> String {
        self.key("accounts")
    }

    pub fn audit_log(&self) -> String {
        self.key("audit-log")
    }

    pub fn external_session(&self) -> String {
        self.key("external-session")
    }

    /// Session-scoped per-tab secret keying the storage envelope.
    pub fn entropy(&self) -> String {
        self.key("entropy")
    }

    /// Session-scoped HMAC secret for callback state tokens.
    pub fn origin_secret(&self) -> String {
        self.key("origin-secret")
    }

    /// Pending external request persisted across a redirect.
    pub fn pending_request(&self) -> String {
        self.key("pending-request")
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
