//! Worker process management
//!
//! The multiplexer never touches processes directly; it goes through a
//! [`ProcessLauncher`] so its state machine can run against a fake.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Program and arguments executed for every opened pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Split a command line into program and arguments
    ///
    /// Returns `None` for an empty command line.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
        })
    }
}

/// Endpoint files a worker's standard streams are wired to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeEndpoints {
    /// Host-to-device endpoint, opened read-only as the worker's stdin
    pub input: PathBuf,
    /// Device-to-host endpoint, opened write-only as the worker's stdout
    pub output: PathBuf,
}

/// Capability to start, stop and reap worker processes
pub trait ProcessLauncher {
    type Handle;

    /// Start `command` with stdin/stdout redirected to `endpoints`
    fn spawn(&mut self, command: &WorkerCommand, endpoints: &PipeEndpoints)
    -> io::Result<Self::Handle>;

    /// Ask the process to exit
    fn terminate(&mut self, handle: &mut Self::Handle) -> io::Result<()>;

    /// Block until the process has exited
    fn wait(&mut self, handle: Self::Handle) -> io::Result<()>;

    /// OS-level identifier, for logging
    fn id(&self, handle: &Self::Handle) -> u32;
}

/// Launches workers as child processes with [`std::process::Command`]
///
/// Endpoint files are opened in the daemon before the child starts, so a
/// missing endpoint or a failed exec is reported by `spawn` itself.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    type Handle = Child;

    fn spawn(
        &mut self,
        command: &WorkerCommand,
        endpoints: &PipeEndpoints,
    ) -> io::Result<Child> {
        let stdout = OpenOptions::new().write(true).open(&endpoints.output)?;
        let stdin = File::open(&endpoints.input)?;

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .spawn()?;

        debug!(
            "Spawned {:?} as pid {} (stdin={}, stdout={})",
            command.program,
            child.id(),
            endpoints.input.display(),
            endpoints.output.display()
        );
        Ok(child)
    }

    fn terminate(&mut self, handle: &mut Child) -> io::Result<()> {
        match kill(Pid::from_raw(handle.id() as i32), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            // Already exited and reaped elsewhere; wait() will report it
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn wait(&mut self, mut handle: Child) -> io::Result<()> {
        let pid = handle.id();
        let status = handle.wait()?;
        if status.success() {
            debug!("Worker {} exited cleanly", pid);
        } else {
            warn!("Worker {} exited with {}", pid, status);
        }
        Ok(())
    }

    fn id(&self, handle: &Child) -> u32 {
        handle.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_from_argv() {
        let cmd = WorkerCommand::from_argv(["iiod", "-F", "/dev/ffs"]).unwrap();
        assert_eq!(cmd.program, OsString::from("iiod"));
        assert_eq!(cmd.args, vec![OsString::from("-F"), OsString::from("/dev/ffs")]);
    }

    #[test]
    fn test_worker_command_empty() {
        assert!(WorkerCommand::from_argv(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_spawn_missing_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = PipeEndpoints {
            input: dir.path().join("ep2"),
            output: dir.path().join("ep1"),
        };
        let cmd = WorkerCommand::from_argv(["cat"]).unwrap();

        let err = CommandLauncher.spawn(&cmd, &endpoints).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
