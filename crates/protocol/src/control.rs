//! Vendor control protocol
//!
//! Pipes are opened and closed with vendor-specific control requests on
//! endpoint 0. None of the requests carries a data stage; the device
//! answers every request with a zero-length status acknowledgment.
//!
//! | bRequest | command    | wValue     |
//! |----------|------------|------------|
//! | 0        | reset all  | unused     |
//! | 1        | open pipe  | pipe index |
//! | 2        | close pipe | pipe index |

use crate::error::{ProtocolError, Result};
use crate::pipe::USB_DIR_IN;
use byteorder::{ByteOrder, LittleEndian};

/// Close every pipe
pub const CMD_RESET_PIPES: u8 = 0;
/// Open the pipe named by wValue
pub const CMD_OPEN_PIPE: u8 = 1;
/// Close the pipe named by wValue
pub const CMD_CLOSE_PIPE: u8 = 2;

/// bmRequestType used by the host: vendor, interface recipient, host-to-device
pub const VENDOR_OUT_REQUEST_TYPE: u8 = 0x41;

/// Raw `usb_ctrlrequest` as delivered in a FunctionFS setup event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    /// Encoded size of a setup packet
    pub const SIZE: usize = 8;

    /// Decode a setup packet (multi-byte fields little-endian)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::ShortRequest {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    /// Encode back into setup packet layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    /// Whether the data/status direction of this request is device-to-host
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & USB_DIR_IN != 0
    }

    /// Decode the multiplexing command carried by this request
    pub fn command(&self) -> Option<ControlCommand> {
        ControlCommand::decode(self)
    }
}

/// Pipe multiplexing command
///
/// Pipe indices are carried raw; range checking is the receiver's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ResetAll,
    Open(u16),
    Close(u16),
}

impl ControlCommand {
    /// Decode a control request. Unknown request codes yield `None`.
    pub fn decode(request: &ControlRequest) -> Option<Self> {
        match request.request {
            CMD_RESET_PIPES => Some(Self::ResetAll),
            CMD_OPEN_PIPE => Some(Self::Open(request.value)),
            CMD_CLOSE_PIPE => Some(Self::Close(request.value)),
            _ => None,
        }
    }

    /// bRequest code for this command
    pub fn request_code(&self) -> u8 {
        match self {
            Self::ResetAll => CMD_RESET_PIPES,
            Self::Open(_) => CMD_OPEN_PIPE,
            Self::Close(_) => CMD_CLOSE_PIPE,
        }
    }

    /// wValue for this command
    pub fn value(&self) -> u16 {
        match self {
            Self::ResetAll => 0,
            Self::Open(index) | Self::Close(index) => *index,
        }
    }

    /// Build the host-side setup packet for this command
    pub fn to_request(&self) -> ControlRequest {
        ControlRequest {
            request_type: VENDOR_OUT_REQUEST_TYPE,
            request: self.request_code(),
            value: self.value(),
            index: 0,
            length: 0,
        }
    }
}
