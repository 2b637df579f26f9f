//! Client error types

use thiserror::Error;

/// The device does not look like a usbpipe peripheral
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

/// Errors raised by the host-side client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// libusb refused a transfer submission
    #[error("Transfer submission failed on endpoint {endpoint:#04x}: {source}")]
    Submit {
        endpoint: u8,
        #[source]
        source: rusb::Error,
    },

    /// Local output sink failed; the inbound path cannot continue
    #[error("Output write failed: {0}")]
    Output(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The device is gone; nothing on this handle can succeed again
    pub fn is_no_device(&self) -> bool {
        matches!(
            self,
            ClientError::Usb(rusb::Error::NoDevice)
                | ClientError::Submit {
                    source: rusb::Error::NoDevice,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
