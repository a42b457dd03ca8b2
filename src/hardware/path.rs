//! BIP44 derivation paths.

use crate::domain::{ErrorKind, WalletError};

/// Hardened-component offset.
const HARDENED: u32 = 0x8000_0000;

/// Default NEAR derivation path (coin type 397).
pub const DEFAULT_PATH: &str = "44'/397'/0'/0'/1'";

/// A parsed derivation path; components carry the hardened bit already.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    /// Parse `44'/397'/0'/0'/1'`-style paths. A leading `m/` is accepted.
    pub fn parse(path: &str) -> Result<Self, WalletError> {
        let trimmed = path.trim().trim_start_matches("m/");
        if trimmed.is_empty() {
            return Err(path_error(path, "empty path"));
        }

        let mut components = Vec::new();
        for element in trimmed.split('/') {
            let (digits, hardened) = match element.strip_suffix('\'') {
                Some(d) => (d, true),
                None => (element, false),
            };
            let value: u32 = digits
                .parse()
                .map_err(|_| path_error(path, &format!("bad component {element:?}")))?;
            if value >= HARDENED {
                return Err(path_error(path, &format!("component {value} out of range")));
            }
            components.push(if hardened { value + HARDENED } else { value });
        }
        Ok(Self(components))
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// Wire form: `[n(1B)] [element(4B BE)]…`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.0.len() * 4);
        out.push(self.0.len() as u8);
        for component in &self.0 {
            out.extend_from_slice(&component.to_be_bytes());
        }
        out
    }
}

impl Default for DerivationPath {
    fn default() -> Self {
        Self::parse(DEFAULT_PATH).expect("default path is valid")
    }
}

impl std::fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|c| {
                if c & HARDENED != 0 {
                    format!("{}'", c - HARDENED)
                } else {
                    c.to_string()
                }
            })
            .collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl std::str::FromStr for DerivationPath {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn path_error(path: &str, detail: &str) -> WalletError {
    WalletError::new(
        ErrorKind::DerivationPathError,
        format!("invalid derivation path {path:?}: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_serialization() {
        let path = DerivationPath::default();
        let bytes = path.serialize();
        assert_eq!(bytes[0], 5);
        assert_eq!(bytes.len(), 1 + 5 * 4);
        // 44' = 0x8000002C big-endian
        assert_eq!(&bytes[1..5], &[0x80, 0x00, 0x00, 0x2C]);
        // 397' = 0x8000018D
        assert_eq!(&bytes[5..9], &[0x80, 0x00, 0x01, 0x8D]);
        // trailing 1'
        assert_eq!(&bytes[17..21], &[0x80, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_mixed_hardened_and_soft() {
        let path = DerivationPath::parse("44'/397'/0/2").unwrap();
        assert_eq!(
            path.components(),
            &[44 + HARDENED, 397 + HARDENED, 0, 2]
        );
        let bytes = path.serialize();
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[9..13], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["44'/397'/0'/0'/1'", "44'/397'/0/2", "0"] {
            let path = DerivationPath::parse(text).unwrap();
            assert_eq!(path.to_string(), text);
            assert_eq!(DerivationPath::parse(&path.to_string()).unwrap(), path);
        }
    }

    #[test]
    fn test_leading_m_accepted() {
        assert_eq!(
            DerivationPath::parse("m/44'/397'/0'/0'/1'").unwrap(),
            DerivationPath::default()
        );
    }

    #[test]
    fn test_invalid_paths_rejected() {
        for bad in ["", "abc", "44'/x'", "44''", "2147483648"] {
            let err = DerivationPath::parse(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::DerivationPathError, "{bad}");
        }
    }
}
