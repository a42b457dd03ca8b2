//! Content-Security-Policy helper.
//!
//! Generates directive strings for embedding applications; the recommended
//! configuration enumerates the wallet origins whose frames and endpoints
//! are legitimately loaded.

use std::collections::BTreeMap;

/// Supported directive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CspDirective {
    DefaultSrc,
    ScriptSrc,
    StyleSrc,
    ImgSrc,
    ConnectSrc,
    FrameSrc,
}

impl CspDirective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultSrc => "default-src",
            Self::ScriptSrc => "script-src",
            Self::StyleSrc => "style-src",
            Self::ImgSrc => "img-src",
            Self::ConnectSrc => "connect-src",
            Self::FrameSrc => "frame-src",
        }
    }
}

/// Builder for a policy string.
#[derive(Debug, Clone, Default)]
pub struct CspBuilder {
    directives: BTreeMap<CspDirective, Vec<String>>,
}

impl CspBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add(mut self, directive: CspDirective, source: &str) -> Self {
        let sources = self.directives.entry(directive).or_default();
        if !sources.iter().any(|s| s == source) {
            sources.push(source.to_string());
        }
        self
    }

    /// Render the policy, directives in stable order.
    pub fn build(&self) -> String {
        self.directives
            .iter()
            .map(|(directive, sources)| {
                format!("{} {}", directive.as_str(), sources.join(" "))
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Recommended policy for a connector host: self everywhere, wallet origins
/// allowed for frames and connections.
pub fn recommended(wallet_origins: &[&str]) -> CspBuilder {
    let mut builder = CspBuilder::new()
        .add(CspDirective::DefaultSrc, "'self'")
        .add(CspDirective::ScriptSrc, "'self'")
        .add(CspDirective::ImgSrc, "'self'")
        .add(CspDirective::ImgSrc, "data:")
        .add(CspDirective::ConnectSrc, "'self'")
        .add(CspDirective::FrameSrc, "'self'");
    for origin in wallet_origins {
        builder = builder
            .add(CspDirective::FrameSrc, origin)
            .add(CspDirective::ConnectSrc, origin);
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_joins_directives() {
        let policy = CspBuilder::new()
            .add(CspDirective::DefaultSrc, "'self'")
            .add(CspDirective::FrameSrc, "https://wallet.example")
            .build();
        assert_eq!(policy, "default-src 'self'; frame-src https://wallet.example");
    }

    #[test]
    fn test_duplicate_sources_collapse() {
        let policy = CspBuilder::new()
            .add(CspDirective::FrameSrc, "https://a.example")
            .add(CspDirective::FrameSrc, "https://a.example")
            .build();
        assert_eq!(policy, "frame-src https://a.example");
    }

    #[test]
    fn test_recommended_includes_wallet_origins() {
        let policy = recommended(&["https://wallet.example"]).build();
        assert!(policy.contains("frame-src 'self' https://wallet.example"));
        assert!(policy.contains("connect-src 'self' https://wallet.example"));
        assert!(policy.starts_with("default-src 'self'"));
    }
}
