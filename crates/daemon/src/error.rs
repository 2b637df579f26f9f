//! Daemon error types

use protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the device-side daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A descriptor blob was not accepted in a single write
    #[error("Short write of {what}: wrote {written} of {expected} bytes")]
    ShortWrite {
        what: &'static str,
        written: usize,
        expected: usize,
    },

    /// Waiting on the control channel failed; ends the event loop
    #[error("Poll on control channel failed: {0}")]
    Poll(#[source] std::io::Error),

    /// configfs gadget provisioning failed
    #[error("Gadget error at {path}: {source}")]
    Gadget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// FunctionFS mount or unmount failed
    #[error("Mount error at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_write_display() {
        let err = DaemonError::ShortWrite {
            what: "descriptors",
            written: 10,
            expected: 177,
        };
        let msg = err.to_string();
        assert!(msg.contains("descriptors"));
        assert!(msg.contains("10 of 177"));
    }

    #[test]
    fn test_gadget_error_display() {
        let err = DaemonError::Gadget {
            path: PathBuf::from("/sys/kernel/config/usb_gadget/usbpipe"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("usb_gadget/usbpipe"));
    }
}
