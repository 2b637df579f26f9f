//! Asynchronous bulk transport
//!
//! [`BulkTransport`] is the seam between the transfer engine and libusb.
//! Submitting hands a slot to the transport; it comes back exactly once, on
//! the completion channel given at submission, whatever the outcome.

use crate::error::{ClientError, Result};
use crate::slot::TransferSlot;
use async_channel::Sender;
use rusb::ffi::{self, constants};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashSet;
use std::ffi::{CStr, c_int, c_void};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{trace, warn};

/// Outcome of one transfer as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    TimedOut,
    Stall,
    NoDevice,
    Overflow,
    Error,
}

impl TransferStatus {
    fn from_raw(status: c_int) -> Self {
        match status {
            constants::LIBUSB_TRANSFER_COMPLETED => Self::Completed,
            constants::LIBUSB_TRANSFER_CANCELLED => Self::Cancelled,
            constants::LIBUSB_TRANSFER_TIMED_OUT => Self::TimedOut,
            constants::LIBUSB_TRANSFER_STALL => Self::Stall,
            constants::LIBUSB_TRANSFER_NO_DEVICE => Self::NoDevice,
            constants::LIBUSB_TRANSFER_OVERFLOW => Self::Overflow,
            _ => Self::Error,
        }
    }
}

/// A finished transfer and the slot it used
#[derive(Debug)]
pub struct Completion {
    pub slot: TransferSlot,
    pub status: TransferStatus,
}

/// A submission the transport refused; the slot is handed back
#[derive(Debug)]
pub struct SubmitError {
    pub slot: TransferSlot,
    pub error: ClientError,
}

pub trait BulkTransport: Send + Sync {
    /// Queue `slot.data()` (outbound) or `slot.len()` bytes of space
    /// (inbound) on `endpoint`
    fn submit(
        &self,
        endpoint: u8,
        slot: TransferSlot,
        done: &Sender<Completion>,
    ) -> std::result::Result<(), SubmitError>;

    /// Run completion callbacks for at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<()>;

    /// Ask every in-flight transfer to complete as cancelled
    fn cancel_all(&self);

    /// Transfers submitted and not yet completed
    fn in_flight(&self) -> usize;
}

type Registry = Arc<Mutex<HashSet<usize>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashSet<usize>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// State owned by libusb between submission and callback
struct InFlight {
    slot: TransferSlot,
    done: Sender<Completion>,
    registry: Registry,
}

/// libusb asynchronous API over an opened device
pub struct LibusbTransport {
    context: Context,
    handle: Arc<DeviceHandle<Context>>,
    registry: Registry,
}

impl LibusbTransport {
    pub fn new(context: Context, handle: Arc<DeviceHandle<Context>>) -> Self {
        Self {
            context,
            handle,
            registry: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

fn error_name(code: c_int) -> String {
    // SAFETY: libusb_error_name returns a pointer to a static string
    unsafe { CStr::from_ptr(ffi::libusb_error_name(code)) }
        .to_string_lossy()
        .into_owned()
}

/// Map a libusb return code onto the rusb error type
fn usb_error(code: c_int) -> rusb::Error {
    match code {
        constants::LIBUSB_ERROR_IO => rusb::Error::Io,
        constants::LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        constants::LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        constants::LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        constants::LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        constants::LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        constants::LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        constants::LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        constants::LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        constants::LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        constants::LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        constants::LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data came from Box::into_raw in submit and libusb calls
    // back exactly once per submission, so the box is reclaimed once.
    let (state, status, actual) = unsafe {
        let t = &*transfer;
        (
            Box::from_raw(t.user_data as *mut InFlight),
            t.status,
            t.actual_length,
        )
    };

    lock(&state.registry).remove(&(transfer as usize));
    // SAFETY: no longer registered, so cancel_all cannot touch it
    unsafe { ffi::libusb_free_transfer(transfer) };

    let InFlight { mut slot, done, .. } = *state;
    slot.set_len(actual.max(0) as usize);
    let status = TransferStatus::from_raw(status);
    trace!("Slot {} completed: {:?}, {} bytes", slot.id(), status, slot.len());

    // Closed only once the engine has stopped listening
    let _ = done.try_send(Completion { slot, status });
}

impl BulkTransport for LibusbTransport {
    fn submit(
        &self,
        endpoint: u8,
        slot: TransferSlot,
        done: &Sender<Completion>,
    ) -> std::result::Result<(), SubmitError> {
        // SAFETY: plain allocation, checked for null below
        let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(SubmitError {
                slot,
                error: ClientError::Usb(rusb::Error::NoMem),
            });
        }

        let length = slot.len() as c_int;
        let mut state = Box::new(InFlight {
            slot,
            done: done.clone(),
            registry: Arc::clone(&self.registry),
        });
        // The boxed slice does not move when the box is leaked
        let buffer = state.slot.as_mut_ptr();
        let user_data = Box::into_raw(state) as *mut c_void;

        lock(&self.registry).insert(transfer as usize);

        // SAFETY: transfer is freshly allocated, buffer stays valid until the
        // callback reclaims user_data, and the handle outlives the transport.
        let rc = unsafe {
            ffi::libusb_fill_bulk_transfer(
                transfer,
                self.handle.as_raw(),
                endpoint,
                buffer,
                length,
                transfer_callback,
                user_data,
                0,
            );
            ffi::libusb_submit_transfer(transfer)
        };

        if rc != 0 {
            lock(&self.registry).remove(&(transfer as usize));
            // SAFETY: submission failed, so libusb holds no reference to either
            let state = unsafe {
                ffi::libusb_free_transfer(transfer);
                Box::from_raw(user_data as *mut InFlight)
            };
            trace!("Submit on {:#04x} failed: {}", endpoint, error_name(rc));
            return Err(SubmitError {
                slot: state.slot,
                error: ClientError::Submit {
                    endpoint,
                    source: usb_error(rc),
                },
            });
        }

        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) | Err(rusb::Error::Interrupted) => Ok(()),
            Err(e) => Err(ClientError::Usb(e)),
        }
    }

    fn cancel_all(&self) {
        let registry = lock(&self.registry);
        for &transfer in registry.iter() {
            // SAFETY: registered transfers are freed only after removal,
            // which needs the lock held here
            let rc = unsafe { ffi::libusb_cancel_transfer(transfer as *mut ffi::libusb_transfer) };
            if rc != 0 && rc != constants::LIBUSB_ERROR_NOT_FOUND {
                warn!("Cancel failed: {}", error_name(rc));
            }
        }
    }

    fn in_flight(&self) -> usize {
        lock(&self.registry).len()
    }
}

impl Drop for LibusbTransport {
    fn drop(&mut self) {
        let pending = self.in_flight();
        if pending > 0 {
            warn!("{} transfers still in flight at transport teardown", pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw() {
        assert_eq!(
            TransferStatus::from_raw(constants::LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(
            TransferStatus::from_raw(constants::LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(TransferStatus::from_raw(42), TransferStatus::Error);
    }

    #[test]
    fn test_usb_error_from_code() {
        assert_eq!(
            usb_error(constants::LIBUSB_ERROR_NO_DEVICE),
            rusb::Error::NoDevice
        );
        assert_eq!(usb_error(constants::LIBUSB_ERROR_BUSY), rusb::Error::Busy);
        assert_eq!(usb_error(-1234), rusb::Error::Other);
    }
}
