//! In-memory transport for exercising the transfer engine
//!
//! Inbound transfers complete in submission order, one scripted chunk
//! each. Outbound transfers are recorded and complete on the next call to
//! `handle_events`.

use crate::error::{ClientError, Result};
use crate::slot::TransferSlot;
use crate::transport::{BulkTransport, Completion, SubmitError, TransferStatus};
use async_channel::Sender;
use common::ShutdownToken;
use protocol::is_in_address;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Vec<u8>>,
    pending_in: VecDeque<(TransferSlot, Sender<Completion>)>,
    pending_out: VecDeque<(TransferSlot, Sender<Completion>)>,
    outbound: Vec<Vec<u8>>,
    max_inbound_pending: usize,
    fail_next_inbound: Option<TransferStatus>,
    /// Submissions still accepted before `submit_error` applies
    submits_left: Option<usize>,
    submit_error: Option<rusb::Error>,
    cancel_on_outbound: bool,
}

#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    token: ShutdownToken,
    stop_when_drained: bool,
}

impl MockTransport {
    /// Deliver `chunks` inbound, then cancel the token
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(MockState {
                script: chunks.into(),
                ..MockState::default()
            }),
            token: ShutdownToken::new(),
            stop_when_drained: true,
        }
    }

    /// Leave stopping to the engine or the test
    pub fn keep_running(mut self) -> Self {
        self.stop_when_drained = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token the engine under test should be given
    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    /// Next inbound completion carries `status` and no data
    pub fn fail_next_inbound(&self, status: TransferStatus) {
        self.state().fail_next_inbound = Some(status);
    }

    /// Accept `count` more submissions, then refuse every one with `error`
    pub fn fail_submissions_after(&self, count: usize, error: rusb::Error) {
        let mut state = self.state();
        state.submits_left = Some(count);
        state.submit_error = Some(error);
    }

    /// Cancel the token while an outbound submission is being accepted
    pub fn cancel_on_outbound_submit(&self) {
        self.state().cancel_on_outbound = true;
    }

    /// Payload of every outbound submission, in order
    pub fn outbound(&self) -> Vec<Vec<u8>> {
        self.state().outbound.clone()
    }

    pub fn outbound_sizes(&self) -> Vec<usize> {
        self.state().outbound.iter().map(Vec::len).collect()
    }

    /// Most inbound transfers ever queued at once
    pub fn max_inbound_pending(&self) -> usize {
        self.state().max_inbound_pending
    }
}

impl BulkTransport for MockTransport {
    fn submit(
        &self,
        endpoint: u8,
        slot: TransferSlot,
        done: &Sender<Completion>,
    ) -> std::result::Result<(), SubmitError> {
        let mut state = self.state();
        if let Some(left) = state.submits_left {
            if left == 0 {
                let source = state.submit_error.unwrap_or(rusb::Error::Other);
                return Err(SubmitError {
                    slot,
                    error: ClientError::Submit { endpoint, source },
                });
            }
            state.submits_left = Some(left - 1);
        }

        if is_in_address(endpoint) {
            state.pending_in.push_back((slot, done.clone()));
            state.max_inbound_pending = state.max_inbound_pending.max(state.pending_in.len());
        } else {
            state.outbound.push(slot.data().to_vec());
            state.pending_out.push_back((slot, done.clone()));
            if state.cancel_on_outbound {
                self.token.cancel();
            }
        }
        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        let mut progressed = false;
        {
            let mut state = self.state();

            while let Some((slot, done)) = state.pending_out.pop_front() {
                let _ = done.try_send(Completion {
                    slot,
                    status: TransferStatus::Completed,
                });
                progressed = true;
            }

            while !state.script.is_empty() {
                let Some((mut slot, done)) = state.pending_in.pop_front() else {
                    break;
                };
                progressed = true;

                if let Some(status) = state.fail_next_inbound.take() {
                    slot.set_len(0);
                    let _ = done.try_send(Completion { slot, status });
                    continue;
                }

                let Some(chunk) = state.script.pop_front() else {
                    break;
                };
                let n = chunk.len().min(slot.capacity());
                slot.buffer_mut()[..n].copy_from_slice(&chunk[..n]);
                slot.set_len(n);
                let _ = done.try_send(Completion {
                    slot,
                    status: TransferStatus::Completed,
                });
            }

            if self.stop_when_drained && state.script.is_empty() {
                self.token.cancel();
            }
        }

        if !progressed {
            thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(())
    }

    fn cancel_all(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        let pending: Vec<_> = state
            .pending_in
            .drain(..)
            .chain(state.pending_out.drain(..))
            .collect();

        for (mut slot, done) in pending {
            slot.set_len(0);
            let _ = done.try_send(Completion {
                slot,
                status: TransferStatus::Cancelled,
            });
        }
    }

    fn in_flight(&self) -> usize {
        let state = self.state();
        state.pending_in.len() + state.pending_out.len()
    }
}
