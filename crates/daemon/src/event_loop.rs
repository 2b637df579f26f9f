//! Device-side event loop
//!
//! Single-threaded. Each iteration checks the shutdown token, waits on ep0
//! for at most the poll interval, reads one event record and dispatches it.
//! Setup events drive the multiplexer and are always acknowledged, whether
//! or not the request was understood.

use crate::ep0::ControlChannel;
use crate::error::{DaemonError, Result};
use crate::launcher::ProcessLauncher;
use crate::multiplexer::PipeMultiplexer;
use common::ShutdownToken;
use protocol::{EVENT_SIZE, LifecycleEvent};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub events: u64,
    pub setups: u64,
    pub malformed: u64,
}

pub struct EventLoop<C: ControlChannel> {
    channel: C,
    poll_interval: Duration,
    token: ShutdownToken,
    stats: LoopStats,
}

impl<C: ControlChannel> EventLoop<C> {
    pub fn new(channel: C, poll_interval: Duration, token: ShutdownToken) -> Self {
        Self {
            channel,
            poll_interval,
            token,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Run until shutdown is requested or ep0 polling fails
    ///
    /// Every pipe is closed before this returns, on both paths.
    pub fn run<L: ProcessLauncher>(&mut self, mux: &mut PipeMultiplexer<L>) -> Result<()> {
        info!("Event loop started");
        let result = self.pump(mux);

        info!("Event loop stopped, closing pipes");
        mux.reset_all();

        debug!(
            "Handled {} events ({} setup, {} malformed)",
            self.stats.events, self.stats.setups, self.stats.malformed
        );
        result
    }

    fn pump<L: ProcessLauncher>(&mut self, mux: &mut PipeMultiplexer<L>) -> Result<()> {
        let mut record = [0u8; EVENT_SIZE];

        while !self.token.is_cancelled() {
            match self.channel.wait_readable(self.poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("Unable to poll ep0: {}", e);
                    return Err(DaemonError::Poll(e));
                }
            }

            let n = match self.channel.read_event(&mut record) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Event read failed: {}", e);
                    self.stats.malformed += 1;
                    continue;
                }
            };

            match LifecycleEvent::parse(&record[..n]) {
                Ok(event) => self.dispatch(event, mux),
                Err(e) => {
                    warn!("Dropping event: {}", e);
                    self.stats.malformed += 1;
                }
            }
        }

        info!("Shutdown requested");
        Ok(())
    }

    fn dispatch<L: ProcessLauncher>(
        &mut self,
        event: LifecycleEvent,
        mux: &mut PipeMultiplexer<L>,
    ) {
        self.stats.events += 1;

        match event {
            LifecycleEvent::Setup { request, command } => {
                self.stats.setups += 1;
                match command {
                    Some(command) => {
                        debug!("Got event: SETUP {:?}", command);
                        mux.apply(command);
                    }
                    None => {
                        debug!("Ignoring unknown request {:#04x}", request.request);
                    }
                }

                if let Err(e) = self.channel.acknowledge(&request) {
                    warn!("Unable to acknowledge request {:#04x}: {}", request.request, e);
                }
            }
            LifecycleEvent::Bind => info!("Got event: BIND"),
            LifecycleEvent::Unbind => info!("Got event: UNBIND"),
            LifecycleEvent::Enable => info!("Got event: ENABLE"),
            LifecycleEvent::Disable => info!("Got event: DISABLE"),
            LifecycleEvent::Suspend => info!("Got event: SUSPEND"),
            LifecycleEvent::Resume => info!("Got event: RESUME"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::WorkerCommand;
    use crate::test_utils::{FakeLauncher, ScriptedChannel, Step};
    use protocol::ControlCommand;

    fn run_script(steps: Vec<Step>) -> (Result<()>, ScriptedChannel, FakeLauncher, LoopStats) {
        let token = ShutdownToken::new();
        let channel = ScriptedChannel::new(steps, token.clone());
        let launcher = FakeLauncher::new();
        let mut mux = PipeMultiplexer::new(
            launcher.clone(),
            WorkerCommand::from_argv(["worker"]).unwrap(),
            "/dev/ffs",
        );

        let mut event_loop = EventLoop::new(channel.clone(), Duration::from_millis(1), token);
        let result = event_loop.run(&mut mux);
        (result, channel, launcher, event_loop.stats())
    }

    #[test]
    fn test_setup_is_acknowledged() {
        let (result, channel, launcher, stats) =
            run_script(vec![Step::event(LifecycleEvent::setup(ControlCommand::Open(0)))]);

        assert!(result.is_ok());
        assert_eq!(channel.acks().len(), 1);
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(stats.setups, 1);
    }

    #[test]
    fn test_informational_events_change_nothing() {
        let (result, channel, launcher, stats) = run_script(vec![
            Step::event(LifecycleEvent::Bind),
            Step::event(LifecycleEvent::Enable),
            Step::event(LifecycleEvent::Suspend),
            Step::event(LifecycleEvent::Resume),
            Step::event(LifecycleEvent::Disable),
            Step::event(LifecycleEvent::Unbind),
        ]);

        assert!(result.is_ok());
        assert!(channel.acks().is_empty());
        assert_eq!(launcher.spawn_count(), 0);
        assert_eq!(stats.events, 6);
    }

    #[test]
    fn test_poll_error_is_fatal_and_closes_pipes() {
        let (result, _channel, launcher, _) = run_script(vec![
            Step::event(LifecycleEvent::setup(ControlCommand::Open(1))),
            Step::PollError(std::io::ErrorKind::Other),
            Step::event(LifecycleEvent::setup(ControlCommand::Open(2))),
        ]);

        assert!(matches!(result, Err(DaemonError::Poll(_))));
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.live_count(), 0);
    }

    #[test]
    fn test_borrowed_channel_stays_with_owner() {
        let token = ShutdownToken::new();
        let mut channel = ScriptedChannel::new(
            vec![Step::event(LifecycleEvent::setup(ControlCommand::ResetAll))],
            token.clone(),
        );
        let mut mux = PipeMultiplexer::new(
            FakeLauncher::new(),
            WorkerCommand::from_argv(["worker"]).unwrap(),
            "/dev/ffs",
        );

        let stats = {
            let mut event_loop = EventLoop::new(&mut channel, Duration::from_millis(1), token);
            event_loop.run(&mut mux).unwrap();
            event_loop.stats()
        };

        // The loop is gone; the owner still holds an open channel
        assert_eq!(stats.setups, 1);
        assert_eq!(channel.acks().len(), 1);
        assert!(!channel.wait_readable(Duration::ZERO).unwrap());
    }
}
