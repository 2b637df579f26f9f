//! Common utilities for usbpipe
//!
//! This crate provides what the device daemon and the host client share
//! beyond the wire protocol: error handling, logging setup, and the
//! cooperative shutdown token with its signal translation.

pub mod error;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use shutdown::{ShutdownToken, install_signal_handler};
