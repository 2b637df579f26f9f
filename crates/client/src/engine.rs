//! Asynchronous transfer engine
//!
//! Two data paths over one transport, driven from two threads:
//!
//! - The calling thread runs the event loop. It keeps every inbound slot
//!   submitted, writes completed inbound payloads to the output sink in
//!   completion order, and returns completed outbound slots to the free
//!   queue.
//! - A feeder thread takes free outbound slots, fills them from the input
//!   source and submits them. An empty free queue blocks the feeder, which
//!   bounds how fast input is admitted.
//!
//! Slots travel by value through channels, so each one has a single owner
//! at any time and a completion hands it back exactly once.

use crate::error::{ClientError, Result};
use crate::slot::{Direction, TransferSlot};
use crate::transport::{BulkTransport, Completion, SubmitError, TransferStatus};
use async_channel::{Receiver, Sender};
use common::ShutdownToken;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Engine tuning, see `TransferSettings` for the configured defaults
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool_size: usize,
    pub buffer_size: usize,
    pub event_timeout: Duration,
    pub retry_delay: Duration,
    pub exit_on_eof: bool,
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            buffer_size: 8192,
            event_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_micros(100),
            exit_on_eof: false,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Counters reported when the engine stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub inbound_completions: u64,
    pub outbound_completions: u64,
    pub outbound_submissions: u64,
    pub cancelled: u64,
    pub errors: u64,
}

/// State shared with the feeder thread
#[derive(Debug, Default)]
struct FeederShared {
    /// Outbound slots submitted and not yet completed
    busy: AtomicUsize,
    /// Input has ended or failed; no more outbound submissions
    finished: AtomicBool,
    /// An outbound submission found the device gone
    disconnected: AtomicBool,
    submissions: AtomicU64,
    submit_errors: AtomicU64,
}

pub struct TransferEngine<T: BulkTransport> {
    transport: Arc<T>,
    config: EngineConfig,
    inbound: u8,
    outbound: u8,
    token: ShutdownToken,
}

impl<T: BulkTransport + 'static> TransferEngine<T> {
    pub fn new(
        transport: Arc<T>,
        config: EngineConfig,
        inbound: u8,
        outbound: u8,
        token: ShutdownToken,
    ) -> Self {
        Self {
            transport,
            config,
            inbound,
            outbound,
            token,
        }
    }

    /// Stream `input` to the device and device data to `output` until the
    /// token is cancelled
    ///
    /// Returns an error only when the device disappears, the output sink
    /// fails, or the inbound pool cannot be submitted at startup. The device
    /// counts as gone once any transfer completes, or any submission fails,
    /// with `NoDevice`.
    pub fn run<R, W>(&self, input: R, mut output: W) -> Result<EngineStats>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let (in_done_tx, in_done_rx) = async_channel::unbounded();
        let (out_done_tx, out_done_rx) = async_channel::unbounded();
        let (free_tx, free_rx) = async_channel::bounded(self.config.pool_size);

        for slot in TransferSlot::pool(
            Direction::Outbound,
            self.config.pool_size,
            self.config.buffer_size,
        ) {
            // Capacity equals pool size, so this never fails
            let _ = free_tx.try_send(slot);
        }

        let mut stats = EngineStats::default();
        let mut parked = Vec::new();
        for slot in TransferSlot::pool(
            Direction::Inbound,
            self.config.pool_size,
            self.config.buffer_size,
        ) {
            if let Err(e) = self.submit_inbound(slot, &in_done_tx) {
                self.token.cancel();
                self.shutdown(&in_done_rx, &out_done_rx, &mut output, &mut stats);
                return Err(e.error);
            }
        }
        debug!(
            "Submitted {} inbound transfers on {:#04x}",
            self.config.pool_size, self.inbound
        );

        let shared = Arc::new(FeederShared::default());
        let feeder = Feeder {
            transport: Arc::clone(&self.transport),
            endpoint: self.outbound,
            retry_delay: self.config.retry_delay,
            token: self.token.clone(),
            shared: Arc::clone(&shared),
            free_tx: free_tx.clone(),
            free_rx,
            done: out_done_tx,
        };
        let feeder_handle = match thread::Builder::new()
            .name("usbpipe-feeder".to_string())
            .spawn(move || feeder.run(input))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.token.cancel();
                self.shutdown(&in_done_rx, &out_done_rx, &mut output, &mut stats);
                return Err(ClientError::Io(e));
            }
        };

        let result = self.event_loop(
            &in_done_tx,
            &in_done_rx,
            &out_done_rx,
            &free_tx,
            &shared,
            &mut output,
            &mut stats,
            &mut parked,
        );

        // Wakes a feeder blocked on the free queue
        self.token.cancel();
        free_tx.close();

        self.shutdown(&in_done_rx, &out_done_rx, &mut output, &mut stats);

        if feeder_handle.is_finished() {
            if feeder_handle.join().is_err() {
                error!("Feeder thread panicked");
            }
        } else {
            // Blocked reading input; it holds no slot that matters any more
            debug!("Leaving feeder blocked on input");
        }

        stats.outbound_submissions = shared.submissions.load(Ordering::SeqCst);
        stats.errors += shared.submit_errors.load(Ordering::SeqCst);

        result.map(|()| stats)
    }

    fn submit_inbound(
        &self,
        mut slot: TransferSlot,
        done: &Sender<Completion>,
    ) -> std::result::Result<(), SubmitError> {
        slot.mark_free();
        let capacity = slot.capacity();
        slot.mark_busy(capacity);
        self.transport.submit(self.inbound, slot, done)
    }

    #[allow(clippy::too_many_arguments)]
    fn event_loop<W: Write>(
        &self,
        in_done_tx: &Sender<Completion>,
        in_done_rx: &Receiver<Completion>,
        out_done_rx: &Receiver<Completion>,
        free_tx: &Sender<TransferSlot>,
        shared: &FeederShared,
        output: &mut W,
        stats: &mut EngineStats,
        parked: &mut Vec<TransferSlot>,
    ) -> Result<()> {
        info!("Transfer engine running");

        while !self.token.is_cancelled() {
            match self.transport.handle_events(self.config.event_timeout) {
                Ok(()) => {}
                Err(e) if e.is_no_device() => return Err(disconnected()),
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    thread::sleep(self.config.event_timeout);
                }
            }

            // Inbound slots whose resubmission failed earlier
            for slot in std::mem::take(parked) {
                self.resubmit_inbound(slot, in_done_tx, stats, parked)?;
            }

            while let Ok(completion) = in_done_rx.try_recv() {
                let slot = self.complete_inbound(completion, output, stats)?;
                self.resubmit_inbound(slot, in_done_tx, stats, parked)?;
            }

            while let Ok(completion) = out_done_rx.try_recv() {
                let lost = completion.status == TransferStatus::NoDevice;
                let slot = self.complete_outbound(completion, stats);
                shared.busy.fetch_sub(1, Ordering::SeqCst);
                // Fails only once the feeder has stopped
                let _ = free_tx.try_send(slot);
                if lost {
                    return Err(disconnected());
                }
            }

            if shared.disconnected.load(Ordering::SeqCst) {
                return Err(disconnected());
            }

            if self.config.exit_on_eof
                && shared.finished.load(Ordering::SeqCst)
                && shared.busy.load(Ordering::SeqCst) == 0
            {
                info!("Input drained, stopping");
                self.token.cancel();
            }
        }

        Ok(())
    }

    /// Put an inbound slot back in flight, parking it if the transport
    /// refuses for any reason other than a missing device
    fn resubmit_inbound(
        &self,
        slot: TransferSlot,
        done: &Sender<Completion>,
        stats: &mut EngineStats,
        parked: &mut Vec<TransferSlot>,
    ) -> Result<()> {
        match self.submit_inbound(slot, done) {
            Ok(()) => Ok(()),
            Err(e) if e.error.is_no_device() => Err(disconnected()),
            Err(e) => {
                warn!("Inbound resubmission failed: {}", e.error);
                stats.errors += 1;
                parked.push(e.slot);
                Ok(())
            }
        }
    }

    fn complete_inbound<W: Write>(
        &self,
        completion: Completion,
        output: &mut W,
        stats: &mut EngineStats,
    ) -> Result<TransferSlot> {
        let Completion { slot, status } = completion;
        stats.inbound_completions += 1;
        self.record_status(Direction::Inbound, status, stats);
        if status == TransferStatus::NoDevice {
            return Err(disconnected());
        }

        if !slot.is_empty() {
            output
                .write_all(slot.data())
                .and_then(|()| output.flush())
                .map_err(ClientError::Output)?;
            stats.bytes_in += slot.len() as u64;
        }
        trace!("Inbound slot {}: {} bytes", slot.id(), slot.len());
        Ok(slot)
    }

    fn complete_outbound(&self, completion: Completion, stats: &mut EngineStats) -> TransferSlot {
        let Completion { mut slot, status } = completion;
        stats.outbound_completions += 1;
        self.record_status(Direction::Outbound, status, stats);

        if status == TransferStatus::Completed {
            stats.bytes_out += slot.len() as u64;
        }
        trace!("Outbound slot {} done", slot.id());
        slot.mark_free();
        slot
    }

    fn record_status(&self, direction: Direction, status: TransferStatus, stats: &mut EngineStats) {
        match status {
            TransferStatus::Completed => {}
            TransferStatus::Cancelled => {
                debug!("{:?} transfer cancelled", direction);
                stats.cancelled += 1;
            }
            other => {
                warn!("{:?} transfer error: {:?}", direction, other);
                stats.errors += 1;
            }
        }
    }

    /// Cancel everything in flight and collect completions until the
    /// transport is empty or the grace period runs out
    fn shutdown<W: Write>(
        &self,
        in_done_rx: &Receiver<Completion>,
        out_done_rx: &Receiver<Completion>,
        output: &mut W,
        stats: &mut EngineStats,
    ) {
        info!(
            "Cancelling {} in-flight transfers",
            self.transport.in_flight()
        );
        self.transport.cancel_all();

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            while let Ok(completion) = in_done_rx.try_recv() {
                if let Err(e) = self.complete_inbound(completion, output, stats) {
                    debug!("Discarding inbound data during shutdown: {}", e);
                }
            }
            while let Ok(completion) = out_done_rx.try_recv() {
                self.complete_outbound(completion, stats);
            }

            if self.transport.in_flight() == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} transfers did not complete within the grace period",
                    self.transport.in_flight()
                );
                break;
            }

            let wait = self.config.event_timeout.min(deadline - now);
            if let Err(e) = self.transport.handle_events(wait) {
                warn!("Error handling USB events during shutdown: {}", e);
                break;
            }
        }
    }
}

fn disconnected() -> ClientError {
    ClientError::Usb(rusb::Error::NoDevice)
}

/// Outbound path, run on its own thread
struct Feeder<T: BulkTransport> {
    transport: Arc<T>,
    endpoint: u8,
    retry_delay: Duration,
    token: ShutdownToken,
    shared: Arc<FeederShared>,
    free_tx: Sender<TransferSlot>,
    free_rx: Receiver<TransferSlot>,
    done: Sender<Completion>,
}

impl<T: BulkTransport> Feeder<T> {
    fn run<R: Read>(self, mut input: R) {
        debug!("Feeder started on {:#04x}", self.endpoint);

        while let Ok(mut slot) = self.free_rx.recv_blocking() {
            let Some(len) = self.fill(&mut slot, &mut input) else {
                break;
            };
            if self.token.is_cancelled() {
                break;
            }

            slot.mark_busy(len);
            self.shared.busy.fetch_add(1, Ordering::SeqCst);
            self.shared.submissions.fetch_add(1, Ordering::SeqCst);
            trace!("Submitting outbound slot {}: {} bytes", slot.id(), len);

            match self.transport.submit(self.endpoint, slot, &self.done) {
                Ok(()) => {
                    // Shutdown may have swept the transport between the check
                    // above and this submission
                    if self.token.is_cancelled() {
                        self.transport.cancel_all();
                        break;
                    }
                }
                Err(e) => {
                    warn!("Outbound submission failed: {}", e.error);
                    self.shared.submit_errors.fetch_add(1, Ordering::SeqCst);
                    self.shared.busy.fetch_sub(1, Ordering::SeqCst);
                    if e.error.is_no_device() {
                        self.shared.disconnected.store(true, Ordering::SeqCst);
                        break;
                    }
                    let mut slot = e.slot;
                    slot.mark_free();
                    let _ = self.free_tx.try_send(slot);
                }
            }
        }

        self.shared.finished.store(true, Ordering::SeqCst);
        debug!("Feeder stopped");
    }

    /// Read the next chunk of input into `slot`
    ///
    /// `None` ends the outbound path: end of input, a read error, or
    /// shutdown.
    fn fill<R: Read>(&self, slot: &mut TransferSlot, input: &mut R) -> Option<usize> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            match input.read(slot.buffer_mut()) {
                Ok(0) => {
                    info!("End of input, outbound path finished");
                    return None;
                }
                Ok(n) => return Some(n),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    error!("Input read failed: {}", e);
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use std::io::Cursor;

    fn engine(transport: &Arc<MockTransport>, config: EngineConfig) -> TransferEngine<MockTransport> {
        TransferEngine::new(
            Arc::clone(transport),
            config,
            0x81,
            0x02,
            transport.token(),
        )
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            event_timeout: Duration::from_millis(1),
            retry_delay: Duration::from_micros(10),
            shutdown_grace: Duration::from_millis(200),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_inbound_pool_fully_subscribed() {
        let transport = Arc::new(MockTransport::new(vec![]));
        let config = EngineConfig {
            pool_size: 4,
            ..fast_config()
        };

        let mut out = Vec::new();
        let stats = engine(&transport, config).run(Cursor::new(Vec::new()), &mut out).unwrap();

        assert_eq!(transport.max_inbound_pending(), 4);
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(stats.cancelled, 4);
        assert!(out.is_empty());
    }

    #[test]
    fn test_output_failure_is_fatal() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let transport = Arc::new(MockTransport::new(vec![b"data".to_vec()]));
        let result = engine(&transport, fast_config()).run(Cursor::new(Vec::new()), Broken);

        assert!(matches!(result, Err(ClientError::Output(_))));
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_transfer_errors_do_not_stop_inbound() {
        let transport = Arc::new(MockTransport::new(vec![b"one".to_vec(), b"two".to_vec()]));
        transport.fail_next_inbound(TransferStatus::Overflow);

        let mut out = Vec::new();
        let stats = engine(&transport, fast_config()).run(Cursor::new(Vec::new()), &mut out).unwrap();

        assert_eq!(out, b"onetwo");
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_no_device_completion_is_fatal() {
        let transport = Arc::new(
            MockTransport::new(vec![b"one".to_vec(), b"two".to_vec()]).keep_running(),
        );
        transport.fail_next_inbound(TransferStatus::NoDevice);

        let mut out = Vec::new();
        let result = engine(&transport, fast_config()).run(Cursor::new(Vec::new()), &mut out);

        assert!(matches!(result, Err(ClientError::Usb(rusb::Error::NoDevice))));
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_no_device_on_inbound_resubmit_is_fatal() {
        let transport = Arc::new(MockTransport::new(vec![b"one".to_vec()]).keep_running());
        transport.fail_submissions_after(2, rusb::Error::NoDevice);
        let config = EngineConfig {
            pool_size: 2,
            ..fast_config()
        };

        let mut out = Vec::new();
        let result = engine(&transport, config).run(Cursor::new(Vec::new()), &mut out);

        assert!(matches!(result, Err(ClientError::Usb(rusb::Error::NoDevice))));
        assert_eq!(out, b"one");
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_no_device_on_outbound_submit_is_fatal() {
        let transport = Arc::new(MockTransport::new(vec![]).keep_running());
        transport.fail_submissions_after(2, rusb::Error::NoDevice);
        let config = EngineConfig {
            pool_size: 2,
            ..fast_config()
        };

        let mut out = Vec::new();
        let result = engine(&transport, config).run(Cursor::new(b"data".to_vec()), &mut out);

        assert!(matches!(result, Err(ClientError::Usb(rusb::Error::NoDevice))));
        assert!(transport.outbound().is_empty());
    }

    #[test]
    fn test_busy_resubmit_is_parked() {
        let transport = Arc::new(MockTransport::new(vec![b"one".to_vec()]));
        transport.fail_submissions_after(2, rusb::Error::Busy);
        let config = EngineConfig {
            pool_size: 2,
            ..fast_config()
        };

        let mut out = Vec::new();
        let stats = engine(&transport, config).run(Cursor::new(Vec::new()), &mut out).unwrap();

        assert_eq!(out, b"one");
        assert_eq!(stats.errors, 1);
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_feeder_cancels_submission_made_during_shutdown() {
        let transport = Arc::new(MockTransport::new(vec![]));
        transport.cancel_on_outbound_submit();

        let (free_tx, free_rx) = async_channel::bounded(2);
        for slot in TransferSlot::pool(Direction::Outbound, 2, 16) {
            free_tx.try_send(slot).unwrap();
        }
        let (done_tx, done_rx) = async_channel::unbounded();
        let shared = Arc::new(FeederShared::default());

        let feeder = Feeder {
            transport: Arc::clone(&transport),
            endpoint: 0x02,
            retry_delay: Duration::from_micros(10),
            token: transport.token(),
            shared: Arc::clone(&shared),
            free_tx,
            free_rx,
            done: done_tx,
        };
        feeder.run(Cursor::new(b"payload".to_vec()));

        assert_eq!(transport.outbound(), vec![b"payload".to_vec()]);
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(done_rx.try_recv().unwrap().status, TransferStatus::Cancelled);
        assert!(shared.finished.load(Ordering::SeqCst));
    }
}
