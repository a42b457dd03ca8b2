//! APDU command/response encoding and the device status-word table.

use crate::domain::{ErrorKind, WalletError};

/// Instruction class used by the NEAR device app.
pub const CLA: u8 = 0x80;

/// Instructions implemented by the NEAR device app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    GetVersion = 0x00,
    SignTransaction = 0x02,
    GetPublicKey = 0x04,
    SignNep413Message = 0x07,
}

/// Chunking markers carried in P1 for multi-chunk payloads.
pub const P1_FIRST: u8 = 0x00;
pub const P1_MORE: u8 = 0x01;
pub const P1_LAST: u8 = 0x02;

/// Request on-device confirmation (GET_PUBLIC_KEY).
pub const P1_CONFIRM: u8 = 0x01;

/// Maximum application-payload chunk carried in one APDU.
pub const MAX_CHUNK: usize = 250;

pub const SW_OK: u16 = 0x9000;

/// One APDU: `[CLA][INS][P1][P2][Lc][data]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(ins: Instruction, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla: CLA,
            ins: ins as u8,
            p1,
            p2,
            data,
        }
    }

    /// Serialize; Lc is a single byte so data must fit in 255 bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, WalletError> {
        if self.data.len() > u8::MAX as usize {
            return Err(WalletError::new(
                ErrorKind::InvalidData,
                format!("APDU data too long: {} bytes", self.data.len()),
            ));
        }
        let mut out = Vec::with_capacity(5 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// Response: `[data…][SW1][SW2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ApduResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, WalletError> {
        if raw.len() < 2 {
            return Err(WalletError::new(
                ErrorKind::TransportError,
                format!("APDU response too short: {} bytes", raw.len()),
            ));
        }
        let (data, sw_bytes) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw: u16::from(sw_bytes[0]) << 8 | u16::from(sw_bytes[1]),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.sw == SW_OK
    }

    /// Map a non-success status word to the typed taxonomy.
    pub fn into_result(self) -> Result<Vec<u8>, WalletError> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(status_to_error(self.sw))
        }
    }
}

/// Known status-word table. Unlisted words map to a transport error
/// carrying the raw word.
pub fn status_to_error(sw: u16) -> WalletError {
    let (kind, message) = match sw {
        0x6985 => (ErrorKind::UserRejected, "request rejected on device"),
        0x6982 => (ErrorKind::DeviceLocked, "device is locked"),
        0x6e01 => (ErrorKind::AppNotOpen, "NEAR app is not open"),
        0x6e00 => (ErrorKind::WrongApp, "another app is open on the device"),
        0x6d00 => (
            ErrorKind::AppVersionUnsupported,
            "instruction not supported by the device app",
        ),
        0x6700 | 0x6a80 => (ErrorKind::InvalidData, "device rejected the request data"),
        0x6986 => (ErrorKind::DeviceBusy, "device is busy"),
        _ => {
            return WalletError::new(
                ErrorKind::TransportError,
                format!("device returned status {sw:#06x}"),
            );
        }
    };
    WalletError::new(kind, format!("{message} ({sw:#06x})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let cmd = ApduCommand::new(Instruction::GetPublicKey, P1_CONFIRM, 0x00, vec![1, 2, 3]);
        let bytes = cmd.serialize().unwrap();
        assert_eq!(bytes, vec![0x80, 0x04, 0x01, 0x00, 0x03, 1, 2, 3]);
    }

    #[test]
    fn test_command_rejects_oversized_data() {
        let cmd = ApduCommand::new(Instruction::SignTransaction, 0, 0, vec![0u8; 256]);
        assert_eq!(cmd.serialize().unwrap_err().kind, ErrorKind::InvalidData);
    }

    #[test]
    fn test_response_parse_and_status() {
        let resp = ApduResponse::parse(&[0xAA, 0xBB, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data, vec![0xAA, 0xBB]);
        assert_eq!(resp.sw, 0x9000);
        assert!(resp.is_ok());
        assert_eq!(resp.into_result().unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_response_too_short() {
        assert!(ApduResponse::parse(&[0x90]).is_err());
        assert!(ApduResponse::parse(&[]).is_err());
    }

    #[test]
    fn test_status_word_table() {
        assert_eq!(status_to_error(0x6985).kind, ErrorKind::UserRejected);
        assert_eq!(status_to_error(0x6982).kind, ErrorKind::DeviceLocked);
        assert_eq!(status_to_error(0x6e01).kind, ErrorKind::AppNotOpen);
        assert_eq!(status_to_error(0x6e00).kind, ErrorKind::WrongApp);
        assert_eq!(status_to_error(0x6d00).kind, ErrorKind::AppVersionUnsupported);
        assert_eq!(status_to_error(0x6700).kind, ErrorKind::InvalidData);
        assert_eq!(status_to_error(0x6a80).kind, ErrorKind::InvalidData);
        assert_eq!(status_to_error(0x6986).kind, ErrorKind::DeviceBusy);
        assert_eq!(status_to_error(0x1234).kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_empty_data_response() {
        let resp = ApduResponse::parse(&[0x69, 0x85]).unwrap();
        assert_eq!(resp.sw, 0x6985);
        assert!(resp.data.is_empty());
        assert_eq!(resp.into_result().unwrap_err().kind, ErrorKind::UserRejected);
    }
}
