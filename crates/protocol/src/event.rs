//! FunctionFS event records read from endpoint 0
//!
//! Layout of `struct usb_functionfs_event`:
//! ```text
//! [0..8]  union { struct usb_ctrlrequest setup; }
//! [8]     type
//! [9..12] padding
//! ```

use crate::control::{ControlCommand, ControlRequest};
use crate::error::{ProtocolError, Result};

/// Size of one event record
pub const EVENT_SIZE: usize = 12;

/// Raw FunctionFS event type codes
pub mod event_type {
    pub const BIND: u8 = 0;
    pub const UNBIND: u8 = 1;
    pub const ENABLE: u8 = 2;
    pub const DISABLE: u8 = 3;
    pub const SETUP: u8 = 4;
    pub const SUSPEND: u8 = 5;
    pub const RESUME: u8 = 6;
}

/// Lifecycle event delivered by the peripheral controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Bind,
    Unbind,
    Enable,
    Disable,
    /// Control request addressed to the function. `command` is `None` for
    /// request codes outside the multiplexing protocol.
    Setup {
        request: ControlRequest,
        command: Option<ControlCommand>,
    },
    Suspend,
    Resume,
}

impl LifecycleEvent {
    /// Decode one event record
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EVENT_SIZE {
            return Err(ProtocolError::ShortEvent {
                expected: EVENT_SIZE,
                actual: bytes.len(),
            });
        }

        let event = match bytes[ControlRequest::SIZE] {
            event_type::BIND => Self::Bind,
            event_type::UNBIND => Self::Unbind,
            event_type::ENABLE => Self::Enable,
            event_type::DISABLE => Self::Disable,
            event_type::SETUP => {
                let request = ControlRequest::parse(&bytes[..ControlRequest::SIZE])?;
                Self::Setup {
                    request,
                    command: request.command(),
                }
            }
            event_type::SUSPEND => Self::Suspend,
            event_type::RESUME => Self::Resume,
            other => return Err(ProtocolError::UnknownEvent(other)),
        };

        Ok(event)
    }

    /// Encode into the kernel's record layout
    pub fn to_bytes(&self) -> [u8; EVENT_SIZE] {
        let mut out = [0u8; EVENT_SIZE];
        let kind = match self {
            Self::Bind => event_type::BIND,
            Self::Unbind => event_type::UNBIND,
            Self::Enable => event_type::ENABLE,
            Self::Disable => event_type::DISABLE,
            Self::Setup { request, .. } => {
                out[..ControlRequest::SIZE].copy_from_slice(&request.to_bytes());
                event_type::SETUP
            }
            Self::Suspend => event_type::SUSPEND,
            Self::Resume => event_type::RESUME,
        };
        out[ControlRequest::SIZE] = kind;
        out
    }

    /// Build a setup event for a multiplexing command
    pub fn setup(command: ControlCommand) -> Self {
        Self::Setup {
            request: command.to_request(),
            command: Some(command),
        }
    }

    /// Short name used in log output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind => "BIND",
            Self::Unbind => "UNBIND",
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::Setup { .. } => "SETUP",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifecycle_events() {
        let mut raw = [0u8; EVENT_SIZE];
        raw[8] = event_type::ENABLE;
        assert_eq!(LifecycleEvent::parse(&raw).unwrap(), LifecycleEvent::Enable);

        raw[8] = event_type::RESUME;
        assert_eq!(LifecycleEvent::parse(&raw).unwrap(), LifecycleEvent::Resume);
    }

    #[test]
    fn test_parse_setup_event() {
        let raw = [0x41, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 4, 0, 0, 0];
        match LifecycleEvent::parse(&raw).unwrap() {
            LifecycleEvent::Setup { request, command } => {
                assert_eq!(request.value, 2);
                assert_eq!(command, Some(ControlCommand::Open(2)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_short_event() {
        let err = LifecycleEvent::parse(&[0u8; 7]).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortEvent { actual: 7, .. }));
    }

    #[test]
    fn test_unknown_event_type() {
        let mut raw = [0u8; EVENT_SIZE];
        raw[8] = 42;
        assert!(matches!(
            LifecycleEvent::parse(&raw),
            Err(ProtocolError::UnknownEvent(42))
        ));
    }

    #[test]
    fn test_setup_record_layout() {
        let raw = LifecycleEvent::setup(ControlCommand::Close(1)).to_bytes();
        assert_eq!(raw[1], crate::control::CMD_CLOSE_PIPE);
        assert_eq!(raw[2], 1);
        assert_eq!(raw[8], event_type::SETUP);
        assert_eq!(&raw[9..], &[0, 0, 0]);
    }
}
