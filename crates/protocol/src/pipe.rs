//! Pipe identities and their endpoint numbering
//!
//! Pipe `i` owns a pair of bulk endpoints: device-to-host endpoint `2i+1`
//! and host-to-device endpoint `2i+2`. Endpoint numbers double as the
//! FunctionFS endpoint file names (`ep1`, `ep2`, ...) on the device side.

use std::fmt;

/// Number of multiplexed pipes exposed by the device
pub const PIPE_COUNT: usize = 3;

/// Largest pipe count whose endpoint numbers stay within the 4-bit USB range
pub const MAX_PIPE_COUNT: usize = 7;

/// Direction bit of an endpoint address (set = device-to-host)
pub const USB_DIR_IN: u8 = 0x80;

/// Mask selecting the endpoint number from an address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Index of a pipe, always within `[0, PIPE_COUNT)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeIndex(u8);

impl PipeIndex {
    /// Validate a raw index received from the host
    ///
    /// Returns `None` for out-of-range values.
    pub fn new(raw: u16) -> Option<Self> {
        if (raw as usize) < PIPE_COUNT {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    /// Iterate over every pipe in ascending order
    pub fn all() -> impl Iterator<Item = PipeIndex> {
        (0..PIPE_COUNT as u8).map(PipeIndex)
    }

    /// Position of this pipe in a channel table
    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Endpoint number carrying device-to-host data
    pub fn in_endpoint(self) -> u8 {
        self.0 * 2 + 1
    }

    /// Endpoint number carrying host-to-device data
    pub fn out_endpoint(self) -> u8 {
        self.0 * 2 + 2
    }

    /// Full endpoint address (with direction bit) of the device-to-host endpoint
    pub fn in_address(self) -> u8 {
        USB_DIR_IN | self.in_endpoint()
    }

    /// Full endpoint address of the host-to-device endpoint
    pub fn out_address(self) -> u8 {
        self.out_endpoint()
    }
}

impl fmt::Display for PipeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// Whether an endpoint address is device-to-host
pub fn is_in_address(address: u8) -> bool {
    address & USB_DIR_IN != 0
}
