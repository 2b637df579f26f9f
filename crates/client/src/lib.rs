//! usbpipe host client
//!
//! Finds the usbpipe peripheral, picks a bulk endpoint pair and tunnels
//! stdin to the device and device data to stdout using a pool of
//! asynchronous libusb transfers per direction.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod slot;
pub mod test_utils;
pub mod transport;

pub use discovery::{BulkEndpoints, ConfigLayout, discover, pipe_endpoints};
pub use engine::{EngineConfig, EngineStats, TransferEngine};
pub use error::{ClientError, DiscoveryError, Result};
pub use slot::{Direction, SlotStatus, TransferSlot};
pub use transport::{BulkTransport, Completion, LibusbTransport, TransferStatus};

/// Parse a USB vendor or product id given in hex, with or without `0x`
pub fn parse_usb_id(s: &str) -> std::result::Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid USB id '{}': {}", s, e))
}
