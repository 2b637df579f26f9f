//! Cooperative shutdown token
//!
//! A cloneable flag shared between the execution contexts of a process.
//! Any holder may cancel; every loop polls it once per iteration. Signal
//! handlers only record the request here and never do work themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Create a token in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Translate SIGINT, SIGTERM and SIGHUP into a cancellation of `token`
///
/// Can only be installed once per process.
pub fn install_signal_handler(token: ShutdownToken) -> crate::Result<()> {
    ctrlc::set_handler(move || {
        token.cancel();
    })
    .map_err(|e| crate::Error::Signal(e.to_string()))?;

    info!("Signal handler installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_running() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_across_threads() {
        let token = ShutdownToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel())
            .join()
            .unwrap();
        assert!(token.is_cancelled());
    }
}
