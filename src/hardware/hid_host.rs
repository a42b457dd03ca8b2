//! hidapi-backed HID host (feature `hardware-hidapi`).
//!
//! The hidapi API is blocking, so calls run on the blocking pool. Output
//! reports carry a leading zero report id.

use std::time::Duration;

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use tokio::task;
use tracing::debug;

use crate::domain::{ErrorKind, WalletError};
use crate::hardware::framing::PACKET_SIZE;
use crate::hardware::transport::{HidBackend, HidDeviceHandle};

/// Ledger USB vendor id.
pub const LEDGER_VENDOR_ID: u16 = 0x2c97;

/// Opens the first matching HID device on the host.
pub struct HidApiBackend {
    vendor_id: u16,
    product_id: Option<u16>,
}

impl HidApiBackend {
    pub fn new(vendor_id: u16, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn ledger() -> Self {
        Self::new(LEDGER_VENDOR_ID, None)
    }
}

#[async_trait]
impl HidBackend for HidApiBackend {
    async fn open(&self) -> Result<Box<dyn HidDeviceHandle>, WalletError> {
        let vendor_id = self.vendor_id;
        let product_id = self.product_id;

        let device = task::spawn_blocking(move || -> Result<HidDevice, WalletError> {
            let api = HidApi::new().map_err(|e| {
                WalletError::new(ErrorKind::WebhidNotSupported, format!("hid init: {e}"))
            })?;

            let info = api
                .device_list()
                .find(|d| {
                    d.vendor_id() == vendor_id
                        && product_id.is_none_or(|p| d.product_id() == p)
                })
                .ok_or_else(|| {
                    WalletError::new(ErrorKind::DeviceNotFound, "no matching HID device")
                })?;

            debug!(path = ?info.path(), "Opening HID device");
            info.open_device(&api).map_err(|e| {
                WalletError::new(ErrorKind::TransportError, format!("hid open: {e}"))
            })
        })
        .await
        .map_err(|e| WalletError::new(ErrorKind::TransportError, format!("hid task: {e}")))??;

        Ok(Box::new(HidApiHandle {
            device: Some(device),
        }))
    }
}

struct HidApiHandle {
    device: Option<HidDevice>,
}

#[async_trait]
impl HidDeviceHandle for HidApiHandle {
    async fn write_packet(&mut self, packet: &[u8; PACKET_SIZE]) -> Result<(), WalletError> {
        let device = self.device.take().ok_or_else(|| {
            WalletError::new(ErrorKind::Disconnected, "device handle closed")
        })?;
        let packet = *packet;

        let (device, result) = task::spawn_blocking(move || {
            let mut report = [0u8; PACKET_SIZE + 1];
            report[1..].copy_from_slice(&packet);
            let result = device.write(&report).map(|_| ()).map_err(|e| {
                WalletError::new(ErrorKind::TransportError, format!("hid write: {e}"))
            });
            (device, result)
        })
        .await
        .map_err(|e| WalletError::new(ErrorKind::TransportError, format!("hid task: {e}")))?;

        self.device = Some(device);
        result
    }

    async fn read_packet(&mut self, timeout: Duration) -> Result<[u8; PACKET_SIZE], WalletError> {
        let device = self.device.take().ok_or_else(|| {
            WalletError::new(ErrorKind::Disconnected, "device handle closed")
        })?;
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let (device, result) = task::spawn_blocking(move || {
            let mut packet = [0u8; PACKET_SIZE];
            let result = match device.read_timeout(&mut packet, timeout_ms) {
                Ok(0) => Err(WalletError::new(
                    ErrorKind::Timeout,
                    "device read timed out",
                )),
                Ok(_) => Ok(packet),
                Err(e) => Err(WalletError::new(
                    ErrorKind::TransportError,
                    format!("hid read: {e}"),
                )),
            };
            (device, result)
        })
        .await
        .map_err(|e| WalletError::new(ErrorKind::TransportError, format!("hid task: {e}")))?;

        self.device = Some(device);
        result
    }

    fn close(&mut self) {
        self.device = None;
    }
}
