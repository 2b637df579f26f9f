//! Protocol library for usbpipe
//!
//! This crate defines everything the device daemon and the host client must
//! agree on: the FunctionFS descriptor/string blobs, the vendor control
//! commands that open and close pipes, the FunctionFS event records, and the
//! per-pipe endpoint numbering.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlCommand, LifecycleEvent, PipeIndex};
//!
//! let event = LifecycleEvent::setup(ControlCommand::Open(1));
//! let decoded = LifecycleEvent::parse(&event.to_bytes()).unwrap();
//! assert_eq!(decoded, event);
//!
//! let pipe = PipeIndex::new(1).unwrap();
//! assert_eq!((pipe.in_endpoint(), pipe.out_endpoint()), (3, 4));
//! ```

pub mod control;
pub mod descriptors;
pub mod error;
pub mod event;
pub mod pipe;

pub use control::{
    CMD_CLOSE_PIPE, CMD_OPEN_PIPE, CMD_RESET_PIPES, ControlCommand, ControlRequest,
    VENDOR_OUT_REQUEST_TYPE,
};
pub use descriptors::{FunctionDescriptors, INTERFACE_NAME, SpeedClass};
pub use error::{ProtocolError, Result};
pub use event::{EVENT_SIZE, LifecycleEvent};
pub use pipe::{PIPE_COUNT, PipeIndex, USB_DIR_IN, is_in_address};
