//! Test doubles for the daemon's capabilities
//!
//! [`FakeLauncher`] stands in for worker processes, [`ScriptedChannel`]
//! for ep0 and [`RecordingConfigFs`] for configfs, so the daemon runs
//! without USB hardware.
//! Both are cheap handles over shared state: clone one before moving it
//! into the code under test and inspect it afterwards.

use crate::ep0::ControlChannel;
use crate::gadget::ConfigFs;
use crate::launcher::{PipeEndpoints, ProcessLauncher, WorkerCommand};
use common::ShutdownToken;
use nix::errno::Errno;
use protocol::{ControlRequest, LifecycleEvent};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Handle to a fake worker
#[derive(Debug)]
pub struct FakeProcess {
    pub id: u32,
}

#[derive(Debug, Default)]
struct LauncherState {
    next_id: u32,
    live: BTreeSet<u32>,
    spawned: Vec<(u32, PipeEndpoints)>,
    terminated: Vec<u32>,
    reaped: Vec<u32>,
    fail_next_spawn: bool,
}

/// In-memory process launcher recording every lifecycle step
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next spawn fail as if exec had failed
    pub fn fail_next_spawn(&self) {
        self.state().fail_next_spawn = true;
    }

    /// Workers started and not yet reaped
    pub fn live(&self) -> Vec<u32> {
        self.state().live.iter().copied().collect()
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn spawn_count(&self) -> usize {
        self.state().spawned.len()
    }

    /// Endpoints passed to each spawn, in order
    pub fn spawned_endpoints(&self) -> Vec<PipeEndpoints> {
        self.state().spawned.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Worker ids in spawn order
    pub fn spawned_ids(&self) -> Vec<u32> {
        self.state().spawned.iter().map(|(id, _)| *id).collect()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state().terminated.clone()
    }

    pub fn reaped(&self) -> Vec<u32> {
        self.state().reaped.clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    type Handle = FakeProcess;

    fn spawn(
        &mut self,
        _command: &WorkerCommand,
        endpoints: &PipeEndpoints,
    ) -> io::Result<FakeProcess> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_spawn) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "exec failed"));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.live.insert(id);
        state.spawned.push((id, endpoints.clone()));
        Ok(FakeProcess { id })
    }

    fn terminate(&mut self, handle: &mut FakeProcess) -> io::Result<()> {
        self.state().terminated.push(handle.id);
        Ok(())
    }

    fn wait(&mut self, handle: FakeProcess) -> io::Result<()> {
        let mut state = self.state();
        state.live.remove(&handle.id);
        state.reaped.push(handle.id);
        Ok(())
    }

    fn id(&self, handle: &FakeProcess) -> u32 {
        handle.id
    }
}

/// One step of a scripted ep0 session
#[derive(Debug, Clone)]
pub enum Step {
    /// Poll times out with nothing to read
    Idle,
    /// Poll reports readable and the next read returns these bytes
    Record(Vec<u8>),
    /// Poll fails
    PollError(io::ErrorKind),
    /// Poll reports readable but the read fails
    ReadError(io::ErrorKind),
}

impl Step {
    /// A well-formed event record
    pub fn event(event: LifecycleEvent) -> Self {
        Step::Record(event.to_bytes().to_vec())
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    script: VecDeque<Step>,
    pending: Option<Step>,
    acks: Vec<ControlRequest>,
    polls: usize,
}

/// ep0 replacement driven by a fixed script
///
/// Cancels `token` once the script is exhausted so the event loop ends.
#[derive(Debug, Clone)]
pub struct ScriptedChannel {
    state: Arc<Mutex<ChannelState>>,
    token: ShutdownToken,
}

impl ScriptedChannel {
    pub fn new(steps: impl IntoIterator<Item = Step>, token: ShutdownToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                script: steps.into_iter().collect(),
                ..ChannelState::default()
            })),
            token,
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests acknowledged so far
    pub fn acks(&self) -> Vec<ControlRequest> {
        self.state().acks.clone()
    }

    pub fn polls(&self) -> usize {
        self.state().polls
    }
}

impl ControlChannel for ScriptedChannel {
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        let mut state = self.state();
        state.polls += 1;

        match state.script.pop_front() {
            None => {
                self.token.cancel();
                Ok(false)
            }
            Some(Step::Idle) => Ok(false),
            Some(Step::PollError(kind)) => Err(io::Error::from(kind)),
            Some(step) => {
                state.pending = Some(step);
                Ok(true)
            }
        }
    }

    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state().pending.take() {
            Some(Step::Record(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(Step::ReadError(kind)) => Err(io::Error::from(kind)),
            _ => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn acknowledge(&mut self, request: &ControlRequest) -> io::Result<()> {
        self.state().acks.push(*request);
        Ok(())
    }
}

/// Groups configfs creates on its own and removes with their parent
const DEFAULT_GROUPS: &[&str] = &["configs", "functions", "strings", "os_desc", "webusb"];

/// A removal that succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Link(PathBuf),
    Dir(PathBuf),
}

/// configfs over a plain directory tree
///
/// Removing a group also removes its attribute files and default groups.
/// It fails with `ENOTEMPTY` while the group still holds a symlink or a
/// user-created group, as the kernel does.
#[derive(Debug, Clone, Default)]
pub struct RecordingConfigFs {
    removals: Arc<Mutex<Vec<Removal>>>,
}

impl RecordingConfigFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful removals, in order
    pub fn removals(&self) -> Vec<Removal> {
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, removal: Removal) {
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(removal);
    }
}

fn holds_group(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        if entry?.file_type()?.is_dir() {
            return Ok(true);
        }
    }
    Ok(false)
}

impl ConfigFs for RecordingConfigFs {
    fn remove_link(&self, path: &Path) -> io::Result<()> {
        if !fs::symlink_metadata(path)?.file_type().is_symlink() {
            return Err(io::Error::from(Errno::EPERM));
        }
        fs::remove_file(path)?;
        self.record(Removal::Link(path.to_path_buf()));
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_symlink() {
                return Err(io::Error::from(Errno::ENOTEMPTY));
            }
            if kind.is_dir() {
                let name = entry.file_name();
                let default = DEFAULT_GROUPS.iter().any(|g| name == *g);
                if !default || holds_group(&entry.path())? {
                    return Err(io::Error::from(Errno::ENOTEMPTY));
                }
            }
        }

        fs::remove_dir_all(path)?;
        self.record(Removal::Dir(path.to_path_buf()));
        Ok(())
    }
}
