//! Common error types

use thiserror::Error;

/// Errors from process-wide setup shared by both binaries
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signal handler error: {0}")]
    Signal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Signal("handler already set".to_string());
        assert_eq!(err.to_string(), "Signal handler error: handler already set");
    }
}
