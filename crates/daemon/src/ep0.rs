//! FunctionFS endpoint 0
//!
//! ep0 carries three things: the descriptor and string blobs written once
//! at startup, the stream of fixed-size lifecycle events, and the
//! zero-length status acknowledgment that completes every setup request.

use crate::error::{DaemonError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use protocol::{ControlRequest, FunctionDescriptors};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// Source of lifecycle events plus the status stage of control transfers
pub trait ControlChannel {
    /// Wait up to `timeout` for an event; `Ok(false)` on timeout
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Read one event record into `buf`, returning the byte count
    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Complete the status stage of `request` with a zero-length transfer
    fn acknowledge(&mut self, request: &ControlRequest) -> io::Result<()>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for &mut C {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }

    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_event(buf)
    }

    fn acknowledge(&mut self, request: &ControlRequest) -> io::Result<()> {
        (**self).acknowledge(request)
    }
}

/// Open ep0 file of a mounted FunctionFS instance
#[derive(Debug)]
pub struct Ep0 {
    file: File,
    path: PathBuf,
}

impl Ep0 {
    /// Open `<mount>/ep0` read-write
    pub fn open(mount: &Path) -> Result<Self> {
        let path = mount.join("ep0");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("Opened {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the descriptor blob, then the string blob
    ///
    /// FunctionFS only accepts each blob in a single write; anything short
    /// is an error.
    pub fn write_descriptors(&mut self, blobs: &FunctionDescriptors) -> Result<()> {
        trace!("functionfs descriptors: {:x?}", blobs.descriptors);
        write_blob(&mut self.file, "descriptors", &blobs.descriptors)?;

        trace!("functionfs strings: {:x?}", blobs.strings);
        write_blob(&mut self.file, "strings", &blobs.strings)?;

        debug!("Wrote descriptors to {}", self.path.display());
        Ok(())
    }
}

/// Status stage of a control transfer
///
/// The host expects the opposite direction to the data stage: a zero-length
/// write after device-to-host requests, a zero-length read otherwise.
pub fn status_stage<F: Read + Write>(ep0: &mut F, request: &ControlRequest) -> io::Result<()> {
    if request.is_device_to_host() {
        let _ = ep0.write(&[])?;
    } else {
        let _ = ep0.read(&mut [])?;
    }
    Ok(())
}

/// Interpret poll results for ep0
///
/// Error or hangup without pending input means the function is gone.
fn readiness(revents: Option<PollFlags>) -> io::Result<bool> {
    let revents = revents.unwrap_or_else(PollFlags::empty);
    if revents.contains(PollFlags::POLLIN) {
        return Ok(true);
    }
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        return Err(io::Error::other(format!("ep0 poll reported {:?}", revents)));
    }
    Ok(false)
}

/// Write `blob` in one call, rejecting short writes
pub fn write_blob<W: Write>(out: &mut W, what: &'static str, blob: &[u8]) -> Result<()> {
    let written = out.write(blob)?;
    if written != blob.len() {
        return Err(DaemonError::ShortWrite {
            what,
            written,
            expected: blob.len(),
        });
    }
    Ok(())
}

impl ControlChannel for Ep0 {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => readiness(fds[0].revents()),
            // A signal arrived; the caller rechecks its shutdown flag
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn acknowledge(&mut self, request: &ControlRequest) -> io::Result<()> {
        status_stage(&mut self.file, request)
    }
}
