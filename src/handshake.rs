//! Completion handshake between one activation and its monitor.
//!
//! The monitor decides to fire and the activation marks itself complete under
//! the same lock, so the two can never both win.

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Watching,
    Fired,
    Completed,
}

/// How the activation's side of the handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Completed,
    /// The monitor fired before completion was recorded.
    Fired,
}

#[derive(Debug)]
pub(crate) struct Handshake {
    phase: Mutex<Phase>,
}

impl Handshake {
    pub(crate) fn new() -> Self {
        Handshake {
            phase: Mutex::new(Phase::Watching),
        }
    }

    /// The monitor's critical section. Only `Watching -> Fired` may happen here.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock()
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub(crate) fn complete(&self) -> Resolution {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Watching | Phase::Completed => {
                *phase = Phase::Completed;
                Resolution::Completed
            }
            Phase::Fired => Resolution::Fired,
        }
    }
}
