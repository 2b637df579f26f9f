//! usbpipe device daemon
//!
//! Presents a vendor-specific FunctionFS interface with a fixed number of
//! bulk pipes and runs one worker process per pipe the host opens. Worker
//! stdin and stdout are the pipe's endpoint files, so data never passes
//! through the daemon.
//!
//! The pieces, in the order `main` wires them:
//! - [`gadget`]: configfs gadget and FunctionFS mount guards
//! - [`ep0`]: descriptor writes and the control channel
//! - [`multiplexer`]: per-pipe worker lifecycle
//! - [`event_loop`]: lifecycle and control-request dispatch

pub mod config;
pub mod ep0;
pub mod error;
pub mod event_loop;
pub mod gadget;
pub mod launcher;
pub mod multiplexer;
pub mod test_utils;

pub use error::{DaemonError, Result};
pub use event_loop::{EventLoop, LoopStats};
pub use launcher::{CommandLauncher, PipeEndpoints, ProcessLauncher, WorkerCommand};
pub use multiplexer::PipeMultiplexer;
