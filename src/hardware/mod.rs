//! Hardware wallet tier: HID framing, APDU exchange, derivation paths,
//! the exclusive device transport, NEAR app commands, and the driver.

pub mod apdu;
pub mod app;
pub mod driver;
pub mod framing;
pub mod path;
pub mod transport;

#[cfg(feature = "hardware-hidapi")]
pub mod hid_host;

pub use apdu::{ApduCommand, ApduResponse, Instruction, status_to_error};
pub use app::{AppVersion, NearApp};
pub use driver::{HardwareWalletConfig, HardwareWalletDriver};
pub use framing::{PACKET_SIZE, Reassembler, frame};
pub use path::{DEFAULT_PATH, DerivationPath};
pub use transport::{
    DeviceSessionState, DeviceTransport, HidBackend, HidDeviceHandle, TransportConfig,
};

#[cfg(feature = "hardware-hidapi")]
pub use hid_host::HidApiBackend;
