//! NEAR device app commands.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::domain::{ErrorKind, Nep413Payload, PublicKey, WalletError};
use crate::hardware::apdu::{ApduCommand, Instruction, P1_CONFIRM, P1_FIRST};
use crate::hardware::path::DerivationPath;
use crate::hardware::transport::DeviceTransport;

/// Device app version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AppVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for AppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Largest path-plus-transaction payload the device app accepts.
const MAX_SIGN_PAYLOAD: usize = 4096;

/// Typed wrapper over the transport for the NEAR app's instruction set.
pub struct NearApp {
    transport: DeviceTransport,
}

impl NearApp {
    pub fn new(transport: DeviceTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &DeviceTransport {
        &self.transport
    }

    pub async fn connect(&self) -> Result<(), WalletError> {
        self.transport.connect().await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// `GET_VERSION`: three bytes, major/minor/patch.
    #[instrument(skip(self))]
    pub async fn get_version(&self) -> Result<AppVersion, WalletError> {
        let command = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![]);
        let data = self
            .transport
            .exchange(&command, self.transport.config().exchange_timeout)
            .await?
            .into_result()?;
        if data.len() != 3 {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                format!("GET_VERSION returned {} bytes", data.len()),
            ));
        }
        let version = AppVersion {
            major: data[0],
            minor: data[1],
            patch: data[2],
        };
        debug!(version = %version, "Device app version");
        Ok(version)
    }

    /// `GET_PUBLIC_KEY`: 32 ed25519 bytes for a derivation path. With
    /// `confirm` the device shows the key and waits for approval, so the
    /// relaxed deadline applies.
    #[instrument(skip(self, path))]
    pub async fn get_public_key(
        &self,
        path: &DerivationPath,
        confirm: bool,
    ) -> Result<PublicKey, WalletError> {
        let p1 = if confirm { P1_CONFIRM } else { P1_FIRST };
        let timeout = if confirm {
            self.transport.config().confirm_timeout
        } else {
            self.transport.config().exchange_timeout
        };
        let command = ApduCommand::new(Instruction::GetPublicKey, p1, 0, path.serialize());
        let data = self.transport.exchange(&command, timeout).await?.into_result()?;

        let bytes: [u8; 32] = data.try_into().map_err(|v: Vec<u8>| {
            WalletError::new(
                ErrorKind::InvalidData,
                format!("GET_PUBLIC_KEY returned {} bytes", v.len()),
            )
        })?;
        Ok(PublicKey::from_ed25519_bytes(bytes))
    }

    /// `SIGN_TRANSACTION`: path ‖ serialized transaction, chunked. Returns
    /// the 64-byte signature once the user approves on the device.
    #[instrument(skip_all, fields(tx_len = tx_bytes.len()))]
    pub async fn sign_transaction(
        &self,
        path: &DerivationPath,
        tx_bytes: &[u8],
    ) -> Result<[u8; 64], WalletError> {
        let mut payload = path.serialize();
        payload.extend_from_slice(tx_bytes);
        if payload.len() > MAX_SIGN_PAYLOAD {
            return Err(WalletError::new(
                ErrorKind::TransactionTooLarge,
                format!("sign payload is {} bytes, device limit is {MAX_SIGN_PAYLOAD}", payload.len()),
            ));
        }
        let data = self
            .transport
            .exchange_chunked(Instruction::SignTransaction, 0, &payload)
            .await?
            .into_result()?;
        signature_from(data)
    }

    /// `SIGN_NEP413_MESSAGE`: path ‖ nonce ‖ len-prefixed recipient,
    /// message, and callback (u32 LE lengths), chunked.
    #[instrument(skip_all)]
    pub async fn sign_message(
        &self,
        path: &DerivationPath,
        message: &Nep413Payload,
    ) -> Result<[u8; 64], WalletError> {
        message.check()?;

        let callback = message.callback_url.as_deref().unwrap_or("");
        let mut payload = path.serialize();
        payload.extend_from_slice(&message.nonce);
        payload.extend_from_slice(&(message.recipient.len() as u32).to_le_bytes());
        payload.extend_from_slice(message.recipient.as_bytes());
        payload.extend_from_slice(&(message.message.len() as u32).to_le_bytes());
        payload.extend_from_slice(message.message.as_bytes());
        payload.extend_from_slice(&(callback.len() as u32).to_le_bytes());
        payload.extend_from_slice(callback.as_bytes());

        let data = self
            .transport
            .exchange_chunked(Instruction::SignNep413Message, 0, &payload)
            .await?
            .into_result()?;
        signature_from(data)
    }

    /// Relaxed wait for an interactive confirmation.
    pub fn confirm_timeout(&self) -> Duration {
        self.transport.config().confirm_timeout
    }
}

fn signature_from(data: Vec<u8>) -> Result<[u8; 64], WalletError> {
    data.try_into().map_err(|v: Vec<u8>| {
        WalletError::new(
            ErrorKind::InvalidData,
            format!("device signature must be 64 bytes, got {}", v.len()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::TransportConfig;
    use crate::test_utils::mocks::{MockHidBackend, MockHidScript};

    fn app_with(script: MockHidScript) -> NearApp {
        NearApp::new(DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_get_version() {
        let app = app_with(MockHidScript::new(|apdu| {
            assert_eq!(apdu[1], 0x00);
            vec![1, 4, 2, 0x90, 0x00]
        }));
        app.connect().await.unwrap();
        let version = app.get_version().await.unwrap();
        assert_eq!(version.to_string(), "1.4.2");
    }

    #[tokio::test]
    async fn test_get_public_key_sends_path() {
        let app = app_with(MockHidScript::new(|apdu| {
            // INS 0x04, Lc = 21 (1 + 5*4), then the serialized path.
            assert_eq!(apdu[1], 0x04);
            assert_eq!(apdu[4], 21);
            assert_eq!(apdu[5], 5);
            let mut out = vec![7u8; 32];
            out.extend_from_slice(&[0x90, 0x00]);
            out
        }));
        app.connect().await.unwrap();
        let key = app
            .get_public_key(&DerivationPath::default(), false)
            .await
            .unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 32]);
        assert_eq!(key.implicit_account_id(), "07".repeat(32));
    }

    #[tokio::test]
    async fn test_get_public_key_confirm_sets_p1() {
        let app = app_with(MockHidScript::new(|apdu| {
            assert_eq!(apdu[2], 0x01);
            let mut out = vec![7u8; 32];
            out.extend_from_slice(&[0x90, 0x00]);
            out
        }));
        app.connect().await.unwrap();
        app.get_public_key(&DerivationPath::default(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sign_transaction_returns_signature() {
        let app = app_with(MockHidScript::new(|apdu| {
            if apdu[2] == 0x02 || (apdu[2] == 0x00 && apdu[1] == 0x02) {
                // Final (or only) chunk answers with the signature.
                let mut out = vec![0xCD; 64];
                out.extend_from_slice(&[0x90, 0x00]);
                out
            } else {
                vec![0x90, 0x00]
            }
        }));
        app.connect().await.unwrap();
        let sig = app
            .sign_transaction(&DerivationPath::default(), &[0xEE; 300])
            .await
            .unwrap();
        assert_eq!(sig, [0xCD; 64]);
    }

    #[tokio::test]
    async fn test_sign_message_payload_layout() {
        let app = app_with(MockHidScript::new(|apdu| {
            if apdu[1] != 0x07 {
                return vec![0x6d, 0x00];
            }
            let mut out = vec![0xAB; 64];
            out.extend_from_slice(&[0x90, 0x00]);
            out
        }));
        app.connect().await.unwrap();
        let payload = Nep413Payload::new("hello", "app.near", [9u8; 32]);
        let sig = app
            .sign_message(&DerivationPath::default(), &payload)
            .await
            .unwrap();
        assert_eq!(sig, [0xAB; 64]);
    }

    #[tokio::test]
    async fn test_user_rejection_surfaces() {
        let app = app_with(MockHidScript::new(|_| vec![0x69, 0x85]));
        app.connect().await.unwrap();
        let err = app
            .sign_transaction(&DerivationPath::default(), &[1, 2, 3])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UserRejected);
    }

    #[tokio::test]
    async fn test_oversized_transaction_rejected_before_device() {
        let script = MockHidScript::new(|_| vec![0x90, 0x00]);
        let seen = script.seen_commands();
        let app = app_with(script);
        app.connect().await.unwrap();

        let err = app
            .sign_transaction(&DerivationPath::default(), &vec![0u8; 5000])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransactionTooLarge);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_length_is_invalid_data() {
        let app = app_with(MockHidScript::new(|_| {
            let mut out = vec![0xCD; 63];
            out.extend_from_slice(&[0x90, 0x00]);
            out
        }));
        app.connect().await.unwrap();
        let err = app
            .sign_transaction(&DerivationPath::default(), &[1])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidData);
    }
}
