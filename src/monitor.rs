//! Background monitor that watches one activation's deadline on its own thread.

use crate::{
    guard::GuardConfig,
    handshake::{Handshake, Phase},
    interrupt::{ActivationId, Expired, Interrupt, InterruptError},
};
use crossbeam_channel as channel;
use log::{debug, trace, warn};
use std::{
    cmp,
    fmt,
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Abstraction over monotonic time for testing.
pub(crate) trait Clock: Send + 'static {
    /// Return the current monotonic time.
    fn now(&self) -> Instant;
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug)]
pub(crate) enum MonitorMsg {
    Resolved,
}

/// Outcome of one pass through the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Wait(Duration),
    Fired,
    Stopped,
}

pub(crate) struct Monitor<C, T> {
    activation: ActivationId,
    duration: Duration,
    floor_interval: Duration,
    start: Instant,
    clock: C,
    target: T,
    handshake: Arc<Handshake>,
    wakeups: channel::Receiver<MonitorMsg>,
}

impl<C, T> Monitor<C, T>
where
    C: Clock,
    T: Interrupt,
{
    pub(crate) fn new(
        activation: ActivationId,
        config: GuardConfig,
        start: Instant,
        clock: C,
        target: T,
        handshake: Arc<Handshake>,
        wakeups: channel::Receiver<MonitorMsg>,
    ) -> Self {
        Monitor {
            activation,
            duration: config.duration(),
            floor_interval: config.floor_interval(),
            start,
            clock,
            target,
            handshake,
            wakeups,
        }
    }

    /// Run the watch loop on a new thread. The thread is never joined by the
    /// activation; it ends within one step of firing or of resolution.
    pub(crate) fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("deadline-monitor".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!("Watching {} for {:?}", self.activation, self.duration);
        'watch_loop: loop {
            match self.step() {
                Step::Wait(wait) => match self.wakeups.recv_timeout(wait) {
                    Ok(MonitorMsg::Resolved) => (),
                    Err(channel::RecvTimeoutError::Timeout) => (),
                    Err(channel::RecvTimeoutError::Disconnected) => {
                        debug!("{} went away, stopping its monitor", self.activation);
                        break 'watch_loop;
                    }
                },
                Step::Fired => {
                    debug!("Fired {} after {:?}", self.activation, self.elapsed());
                    break 'watch_loop;
                }
                Step::Stopped => {
                    debug!("{} completed in time", self.activation);
                    break 'watch_loop;
                }
            }
        }
    }

    fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    /// One iteration of the watch loop, entirely inside the handshake's
    /// critical section.
    pub(crate) fn step(&self) -> Step {
        let mut phase = self.handshake.lock();
        match *phase {
            Phase::Completed => return Step::Stopped,
            Phase::Fired => return Step::Fired,
            Phase::Watching => (),
        }
        let elapsed = self.elapsed();
        match self.duration.checked_sub(elapsed) {
            Some(remaining) => {
                let wait = cmp::max(self.floor_interval, remaining / 2);
                trace!(
                    "{} has {:?} left, next check in {:?}",
                    self.activation, remaining, wait
                );
                Step::Wait(wait)
            }
            None => self.fire(&mut phase, elapsed),
        }
    }

    fn fire(&self, phase: &mut Phase, elapsed: Duration) -> Step {
        let expired = Expired {
            duration: self.duration,
            elapsed,
        };
        match self.target.interrupt(self.activation, expired) {
            Ok(()) => {
                *phase = Phase::Fired;
                Step::Fired
            }
            Err(e @ InterruptError::InvalidTarget { .. }) => {
                debug!("Nothing to cancel for {}: {}", self.activation, e);
                *phase = Phase::Fired;
                Step::Fired
            }
            Err(e @ InterruptError::Unconfirmed { .. }) => {
                warn!("Retrying cancellation of {}: {}", self.activation, e);
                Step::Wait(self.floor_interval)
            }
        }
    }
}

impl<C, T> fmt::Debug for Monitor<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Monitor {} duration={:?}>",
            self.activation, self.duration
        )
    }
}
