//! Exclusive HID device transport.
//!
//! The transport owns one device session: `Disconnected -> Opening -> Idle
//! <-> Busy -> Closing -> Disconnected`. HID is half-duplex, so exactly one
//! exchange may be outstanding; concurrent sends fail fast with a
//! device-busy error. Any HID error, detach, or framing violation tears the
//! session down and rejects the pending exchange.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{ErrorKind, WalletError};
use crate::hardware::apdu::{
    ApduCommand, ApduResponse, Instruction, MAX_CHUNK, P1_FIRST, P1_LAST, P1_MORE, SW_OK,
    status_to_error,
};
use crate::hardware::framing::{PACKET_SIZE, Reassembler, frame};

/// OS seam: opens HID devices. The `hardware-hidapi` feature provides a
/// real backend; tests script one.
#[async_trait]
pub trait HidBackend: Send + Sync {
    /// Prompt for / open a device. A user cancelling the permission prompt
    /// maps to a user-rejected error; no device present maps to
    /// device-not-found.
    async fn open(&self) -> Result<Box<dyn HidDeviceHandle>, WalletError>;
}

/// An open HID device. Driven from one task at a time, so `Sync` is not
/// required of implementations.
#[async_trait]
pub trait HidDeviceHandle: Send {
    async fn write_packet(&mut self, packet: &[u8; PACKET_SIZE]) -> Result<(), WalletError>;

    /// Read one inbound report, waiting at most `timeout`.
    async fn read_packet(&mut self, timeout: Duration) -> Result<[u8; PACKET_SIZE], WalletError>;

    fn close(&mut self);
}

/// Device session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSessionState {
    Disconnected,
    Opening,
    Idle,
    Busy,
    Closing,
}

impl DeviceSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Opening => "opening",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for a non-interactive exchange.
    pub exchange_timeout: Duration,
    /// Relaxed deadline for exchanges that wait on user confirmation.
    pub confirm_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(60),
        }
    }
}

/// Exclusive owner of one connected device.
pub struct DeviceTransport {
    config: TransportConfig,
    backend: Box<dyn HidBackend>,
    handle: Mutex<Option<Box<dyn HidDeviceHandle>>>,
    state: StdMutex<DeviceSessionState>,
    busy: AtomicBool,
}

impl DeviceTransport {
    pub fn new(backend: Box<dyn HidBackend>, config: TransportConfig) -> Self {
        Self {
            config,
            backend,
            handle: Mutex::new(None),
            state: StdMutex::new(DeviceSessionState::Disconnected),
            busy: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DeviceSessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            DeviceSessionState::Idle | DeviceSessionState::Busy
        )
    }

    fn set_state(&self, next: DeviceSessionState) {
        let mut state = self.state.lock().unwrap();
        debug!(from = state.as_str(), to = next.as_str(), "Device session state");
        *state = next;
    }

    /// Open the device via the host backend.
    pub async fn connect(&self) -> Result<(), WalletError> {
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(DeviceSessionState::Opening);
        match self.backend.open().await {
            Ok(handle) => {
                *self.handle.lock().await = Some(handle);
                self.set_state(DeviceSessionState::Idle);
                info!("Hardware device connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(DeviceSessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Release the device. Safe to call from any state.
    pub async fn disconnect(&self) {
        self.set_state(DeviceSessionState::Closing);
        if let Some(mut handle) = self.handle.lock().await.take() {
            handle.close();
        }
        self.busy.store(false, Ordering::SeqCst);
        self.set_state(DeviceSessionState::Disconnected);
    }

    /// Send one APDU and await the complete reassembled response.
    pub async fn exchange(
        &self,
        command: &ApduCommand,
        timeout: Duration,
    ) -> Result<ApduResponse, WalletError> {
        if !self.is_connected() {
            return Err(WalletError::new(
                ErrorKind::Disconnected,
                "no device session open",
            ));
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(WalletError::new(
                ErrorKind::DeviceBusy,
                "another exchange is in flight",
            ));
        }
        self.set_state(DeviceSessionState::Busy);

        let result = self.exchange_inner(command, timeout).await;

        match &result {
            Ok(_) => {
                self.busy.store(false, Ordering::SeqCst);
                self.set_state(DeviceSessionState::Idle);
            }
            Err(e) => {
                // Timeouts and transport faults poison the session; status
                // words from the app do not.
                if matches!(
                    e.kind,
                    ErrorKind::Timeout | ErrorKind::TransportError | ErrorKind::Disconnected
                ) {
                    warn!(error = %e, "Device exchange failed, releasing device");
                    self.disconnect().await;
                } else {
                    self.busy.store(false, Ordering::SeqCst);
                    self.set_state(DeviceSessionState::Idle);
                }
            }
        }

        result
    }

    async fn exchange_inner(
        &self,
        command: &ApduCommand,
        timeout: Duration,
    ) -> Result<ApduResponse, WalletError> {
        let apdu = command.serialize()?;
        let packets = frame(&apdu);
        let deadline = Instant::now() + timeout;

        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut().ok_or_else(|| {
            WalletError::new(ErrorKind::Disconnected, "device handle missing")
        })?;

        for packet in &packets {
            handle.write_packet(packet).await?;
        }

        let mut reassembler = Reassembler::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WalletError::new(
                    ErrorKind::Timeout,
                    format!("device did not respond within {}ms", timeout.as_millis()),
                ));
            }
            let packet = handle.read_packet(remaining).await?;
            if let Some(payload) = reassembler.push(&packet)? {
                return ApduResponse::parse(&payload);
            }
        }
    }

    /// Send a large application payload in `MAX_CHUNK`-byte APDUs.
    ///
    /// The first chunk carries `P1=0x00`, intermediate chunks `P1=0x01`, the
    /// final chunk `P1=0x02`; a single-chunk payload stays at `P1=0x00`.
    /// Non-final chunks must answer `0x9000`; the final chunk's response is
    /// returned. Only the final chunk gets the relaxed confirmation
    /// deadline, since that is where the user approves.
    pub async fn exchange_chunked(
        &self,
        ins: Instruction,
        p2: u8,
        payload: &[u8],
    ) -> Result<ApduResponse, WalletError> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(MAX_CHUNK).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let p1 = if i == 0 {
                P1_FIRST
            } else if i == last {
                P1_LAST
            } else {
                P1_MORE
            };
            let timeout = if i == last {
                self.config.confirm_timeout
            } else {
                self.config.exchange_timeout
            };

            let command = ApduCommand::new(ins, p1, p2, chunk.to_vec());
            let response = self.exchange(&command, timeout).await?;

            if i == last {
                return Ok(response);
            }
            if response.sw != SW_OK {
                return Err(status_to_error(response.sw));
            }
        }
        unreachable!("loop returns on the final chunk");
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mocks::{MockHidBackend, MockHidScript};
    use std::sync::Arc;

    fn echo_script() -> MockHidScript {
        // Respond to any APDU with its own data + SW_OK.
        MockHidScript::new(|apdu| {
            let mut out = apdu[5..].to_vec();
            out.extend_from_slice(&[0x90, 0x00]);
            out
        })
    }

    #[tokio::test]
    async fn test_connect_exchange_disconnect() {
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(echo_script())),
            TransportConfig::default(),
        );
        assert_eq!(transport.state(), DeviceSessionState::Disconnected);

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), DeviceSessionState::Idle);

        let cmd = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![1, 2, 3]);
        let resp = transport.exchange(&cmd, Duration::from_secs(1)).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data, vec![1, 2, 3]);
        assert_eq!(transport.state(), DeviceSessionState::Idle);

        transport.disconnect().await;
        assert_eq!(transport.state(), DeviceSessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_exchange_without_session_is_disconnected() {
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(echo_script())),
            TransportConfig::default(),
        );
        let cmd = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![]);
        let err = transport.exchange(&cmd, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_exchange_fails_fast_with_device_busy() {
        let script = MockHidScript::new(|apdu| {
            let mut out = apdu[5..].to_vec();
            out.extend_from_slice(&[0x90, 0x00]);
            out
        })
        .with_response_delay(Duration::from_millis(200));
        let transport = Arc::new(DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        ));
        transport.connect().await.unwrap();

        let slow = Arc::clone(&transport);
        let slow_task = tokio::spawn(async move {
            let cmd = ApduCommand::new(Instruction::SignTransaction, 0, 0, vec![1]);
            slow.exchange(&cmd, Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cmd = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![]);
        let err = transport.exchange(&cmd, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceBusy);

        assert!(slow_task.await.unwrap().is_ok());
        assert_eq!(transport.state(), DeviceSessionState::Idle);
    }

    #[tokio::test]
    async fn test_timeout_disconnects_session() {
        let script = echo_script().with_response_delay(Duration::from_secs(5));
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        let cmd = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![]);
        let err = transport
            .exchange(&cmd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(transport.state(), DeviceSessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_status_word_error_keeps_session_open() {
        // Device answers "locked" to everything.
        let script = MockHidScript::new(|_| vec![0x69, 0x82]);
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        let cmd = ApduCommand::new(Instruction::GetVersion, 0, 0, vec![]);
        let resp = transport.exchange(&cmd, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.sw, 0x6982);
        assert_eq!(transport.state(), DeviceSessionState::Idle);
    }

    #[tokio::test]
    async fn test_chunked_payload_p1_sequence() {
        let script = echo_script();
        let seen = script.seen_commands();
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        let payload = vec![0x11u8; 600];
        let resp = transport
            .exchange_chunked(Instruction::SignTransaction, 0, &payload)
            .await
            .unwrap();
        assert!(resp.is_ok());

        let commands = seen.lock().unwrap();
        assert_eq!(commands.len(), 3);
        // [CLA, INS, P1, P2, Lc, ...]
        assert_eq!(commands[0][2], P1_FIRST);
        assert_eq!(commands[1][2], P1_MORE);
        assert_eq!(commands[2][2], P1_LAST);
        assert_eq!(commands[0][4], 250);
        assert_eq!(commands[1][4], 250);
        assert_eq!(commands[2][4], 100);
    }

    #[tokio::test]
    async fn test_single_chunk_stays_p1_first() {
        let script = echo_script();
        let seen = script.seen_commands();
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        transport
            .exchange_chunked(Instruction::SignTransaction, 0, &[1, 2, 3])
            .await
            .unwrap();
        let commands = seen.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][2], P1_FIRST);
    }

    #[tokio::test]
    async fn test_chunked_aborts_on_mid_chunk_error() {
        // First chunk answers busy, so the second never goes out.
        let script = MockHidScript::new(|_| vec![0x69, 0x86]);
        let seen = script.seen_commands();
        let transport = DeviceTransport::new(
            Box::new(MockHidBackend::new(script)),
            TransportConfig::default(),
        );
        transport.connect().await.unwrap();

        let err = transport
            .exchange_chunked(Instruction::SignTransaction, 0, &vec![0u8; 600])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceBusy);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
