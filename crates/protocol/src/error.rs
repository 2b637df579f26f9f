//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event record shorter or longer than the fixed FunctionFS event size
    #[error("Short event: expected {expected} bytes, got {actual}")]
    ShortEvent { expected: usize, actual: usize },

    /// Event type byte not known to this implementation
    #[error("Unknown event type: {0}")]
    UnknownEvent(u8),

    /// Control request record too short to decode
    #[error("Short control request: expected {expected} bytes, got {actual}")]
    ShortRequest { expected: usize, actual: usize },

    /// Pipe count outside what the endpoint numbering can address
    #[error("Invalid pipe count: {count} (allowed: 1..={max})")]
    InvalidPipeCount { count: usize, max: usize },

    /// Interface name does not fit a string descriptor
    #[error("Interface name too long: {len} bytes (max: {max})")]
    NameTooLong { len: usize, max: usize },

    /// I/O error while assembling a descriptor blob
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::ShortEvent {
            expected: 12,
            actual: 5,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Short event"));
        assert!(msg.contains("12"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_invalid_pipe_count_error() {
        let err = ProtocolError::InvalidPipeCount { count: 9, max: 7 };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid pipe count"));
        assert!(msg.contains("1..=7"));
    }
}
