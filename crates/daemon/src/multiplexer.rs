//! Pipe multiplexer
//!
//! Owns the channel table: one entry per pipe, either Closed or Open with
//! exactly one live worker. All mutation goes through [`PipeMultiplexer::apply`]
//! or the per-command methods; out-of-range indices are dropped before any
//! state is touched.

use crate::launcher::{PipeEndpoints, ProcessLauncher, WorkerCommand};
use protocol::{ControlCommand, PIPE_COUNT, PipeIndex};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// State of one pipe
#[derive(Debug)]
pub enum PipeState<H> {
    Closed,
    Open(H),
}

impl<H> PipeState<H> {
    pub fn is_open(&self) -> bool {
        matches!(self, PipeState::Open(_))
    }
}

/// State machine over the fixed set of pipes
pub struct PipeMultiplexer<L: ProcessLauncher> {
    launcher: L,
    command: WorkerCommand,
    /// Directory holding the FunctionFS endpoint files (`ep1`, `ep2`, ...)
    endpoint_root: PathBuf,
    channels: Vec<PipeState<L::Handle>>,
}

impl<L: ProcessLauncher> PipeMultiplexer<L> {
    pub fn new(launcher: L, command: WorkerCommand, endpoint_root: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            command,
            endpoint_root: endpoint_root.into(),
            channels: (0..PIPE_COUNT).map(|_| PipeState::Closed).collect(),
        }
    }

    /// Endpoint files backing `pipe`
    pub fn endpoints(&self, pipe: PipeIndex) -> PipeEndpoints {
        endpoint_files(&self.endpoint_root, pipe)
    }

    /// Apply one decoded control command
    pub fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::ResetAll => self.reset_all(),
            ControlCommand::Open(index) => self.open(index),
            ControlCommand::Close(index) => self.close(index),
        }
    }

    /// Start a worker for pipe `index` unless one is already running
    ///
    /// A worker that cannot be started leaves the pipe Closed.
    pub fn open(&mut self, index: u16) {
        let Some(pipe) = PipeIndex::new(index) else {
            debug!("Ignoring open of out-of-range pipe {}", index);
            return;
        };

        if self.channels[pipe.get()].is_open() {
            debug!("{} already open", pipe);
            return;
        }

        let endpoints = self.endpoints(pipe);
        match self.launcher.spawn(&self.command, &endpoints) {
            Ok(handle) => {
                info!("Opened {} (worker {})", pipe, self.launcher.id(&handle));
                self.channels[pipe.get()] = PipeState::Open(handle);
            }
            Err(e) => {
                error!("Unable to start worker for {}: {}", pipe, e);
            }
        }
    }

    /// Terminate and reap the worker of pipe `index`, if any
    pub fn close(&mut self, index: u16) {
        let Some(pipe) = PipeIndex::new(index) else {
            debug!("Ignoring close of out-of-range pipe {}", index);
            return;
        };

        let PipeState::Open(mut handle) =
            std::mem::replace(&mut self.channels[pipe.get()], PipeState::Closed)
        else {
            debug!("{} already closed", pipe);
            return;
        };

        let id = self.launcher.id(&handle);
        if let Err(e) = self.launcher.terminate(&mut handle) {
            warn!("Unable to signal worker {} of {}: {}", id, pipe, e);
        }
        if let Err(e) = self.launcher.wait(handle) {
            warn!("Unable to reap worker {} of {}: {}", id, pipe, e);
        }
        info!("Closed {}", pipe);
    }

    /// Close every pipe, blocking until all workers have exited
    ///
    /// All workers are signalled before the first wait so they shut down
    /// in parallel.
    pub fn reset_all(&mut self) {
        let mut stopping = Vec::new();

        for pipe in PipeIndex::all() {
            if let PipeState::Open(mut handle) =
                std::mem::replace(&mut self.channels[pipe.get()], PipeState::Closed)
            {
                if let Err(e) = self.launcher.terminate(&mut handle) {
                    warn!("Unable to signal worker of {}: {}", pipe, e);
                }
                stopping.push((pipe, handle));
            }
        }

        for (pipe, handle) in stopping {
            if let Err(e) = self.launcher.wait(handle) {
                warn!("Unable to reap worker of {}: {}", pipe, e);
            }
            info!("Closed {}", pipe);
        }
    }

    pub fn is_open(&self, pipe: PipeIndex) -> bool {
        self.channels[pipe.get()].is_open()
    }

    /// Pipes that currently have a live worker
    pub fn open_pipes(&self) -> Vec<PipeIndex> {
        PipeIndex::all().filter(|p| self.is_open(*p)).collect()
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }
}

impl<L: ProcessLauncher> Drop for PipeMultiplexer<L> {
    fn drop(&mut self) {
        self.reset_all();
    }
}

/// FunctionFS endpoint files of `pipe` under `root`
pub fn endpoint_files(root: &Path, pipe: PipeIndex) -> PipeEndpoints {
    PipeEndpoints {
        input: root.join(format!("ep{}", pipe.out_endpoint())),
        output: root.join(format!("ep{}", pipe.in_endpoint())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeLauncher;

    fn multiplexer() -> (PipeMultiplexer<FakeLauncher>, FakeLauncher) {
        let launcher = FakeLauncher::new();
        let command = WorkerCommand::from_argv(["worker", "--flag"]).unwrap();
        (
            PipeMultiplexer::new(launcher.clone(), command, "/dev/ffs"),
            launcher,
        )
    }

    #[test]
    fn test_endpoint_files() {
        let endpoints = endpoint_files(Path::new("/dev/ffs"), PipeIndex::new(2).unwrap());
        assert_eq!(endpoints.output, PathBuf::from("/dev/ffs/ep5"));
        assert_eq!(endpoints.input, PathBuf::from("/dev/ffs/ep6"));
    }

    #[test]
    fn test_open_spawns_one_worker() {
        let (mut mux, launcher) = multiplexer();
        mux.open(0);

        assert!(mux.is_open(PipeIndex::new(0).unwrap()));
        assert_eq!(launcher.live_count(), 1);
        assert_eq!(
            launcher.spawned_endpoints()[0],
            endpoint_files(Path::new("/dev/ffs"), PipeIndex::new(0).unwrap())
        );
    }

    #[test]
    fn test_open_is_idempotent() {
        let (mut mux, launcher) = multiplexer();
        mux.open(1);
        mux.open(1);

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.live_count(), 1);
    }

    #[test]
    fn test_close_reaps_worker() {
        let (mut mux, launcher) = multiplexer();
        mux.open(2);
        mux.close(2);

        assert!(!mux.is_open(PipeIndex::new(2).unwrap()));
        assert_eq!(launcher.live_count(), 0);
        assert_eq!(launcher.terminated().len(), 1);

        mux.close(2);
        assert_eq!(launcher.terminated().len(), 1);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let (mut mux, launcher) = multiplexer();
        mux.open(PIPE_COUNT as u16);
        mux.close(u16::MAX);

        assert_eq!(launcher.spawn_count(), 0);
        assert!(mux.open_pipes().is_empty());
    }

    #[test]
    fn test_spawn_failure_leaves_pipe_closed() {
        let (mut mux, launcher) = multiplexer();
        launcher.fail_next_spawn();
        mux.open(0);

        assert!(!mux.is_open(PipeIndex::new(0).unwrap()));
        assert_eq!(launcher.live_count(), 0);

        mux.open(0);
        assert!(mux.is_open(PipeIndex::new(0).unwrap()));
    }

    #[test]
    fn test_drop_closes_open_pipes() {
        let (mut mux, launcher) = multiplexer();
        mux.open(0);
        mux.open(2);
        drop(mux);

        assert_eq!(launcher.live_count(), 0);
    }
}
