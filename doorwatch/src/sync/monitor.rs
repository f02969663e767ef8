//! Manual open monitor
//!
//! State machine for the operator "open door" command:
//!
//! ```text
//!   Idle --begin--> Requesting --accepted--> Monitoring --window elapsed--> Idle
//!                        |
//!                        +------rejected-----> Idle
//! ```
//!
//! While `Requesting` or `Monitoring` the trigger is disabled (single
//! flight). `Monitoring` owns exactly two timers, a periodic fast poll of
//! the door status and a one-shot end of window, and every way out of
//! `Monitoring` cancels both. The window is a fixed duration: the monitor
//! does not wait for the door to be observed closed.

use super::timers::{TimerId, TimerKind, Timers};

use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Requesting,
    Monitoring,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Requesting => "requesting",
            Phase::Monitoring => "monitoring",
        }
    }
}

/// A second activation while a manual open is in flight.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("manual open already {}", .0.as_str())]
pub struct MonitorBusy(pub Phase);

/// Public view of the in-flight manual open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualOpenSession {
    pub phase: Phase,
    pub started_at: Instant,
    /// Set once the command is accepted and monitoring begins.
    pub deadline: Option<Instant>,
}

struct Watch {
    fast_poll: TimerId,
    window: TimerId,
}

struct Session {
    started_at: Instant,
    deadline: Option<Instant>,
    watch: Option<Watch>,
}

/// What the core should do after a timer was routed to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStep {
    /// Not a monitor timer, or a stale one.
    Ignore,
    /// Re-fetch the door status.
    FetchDoor,
    /// Window elapsed, back to idle.
    Finished,
}

pub struct ManualOpenMonitor {
    fast_poll_interval: Duration,
    window: Duration,
    session: Option<Session>,
}

impl ManualOpenMonitor {
    pub fn new(fast_poll_interval: Duration, window: Duration) -> ManualOpenMonitor {
        ManualOpenMonitor {
            fast_poll_interval,
            window,
            session: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.session {
            None => Phase::Idle,
            Some(Session { watch: None, .. }) => Phase::Requesting,
            Some(Session { watch: Some(_), .. }) => Phase::Monitoring,
        }
    }

    pub fn trigger_enabled(&self) -> bool {
        self.session.is_none()
    }

    pub fn session(&self) -> Option<ManualOpenSession> {
        let phase = self.phase();
        self.session.as_ref().map(|s| ManualOpenSession {
            phase,
            started_at: s.started_at,
            deadline: s.deadline,
        })
    }

    /// Idle -> Requesting. Rejected while a manual open is in flight.
    pub fn begin(&mut self, now: Instant) -> Result<(), MonitorBusy> {
        if self.session.is_some() {
            return Err(MonitorBusy(self.phase()));
        }
        self.session = Some(Session {
            started_at: now,
            deadline: None,
            watch: None,
        });
        Ok(())
    }

    /// The server accepted the command: start monitoring. A repeated
    /// acceptance restarts the window, replacing the running timers.
    /// Returns false if there is no session to accept (e.g. after cancel).
    pub fn accepted(&mut self, now: Instant, timers: &mut Timers) -> bool {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return false,
        };
        if let Some(watch) = session.watch.take() {
            timers.cancel(watch.fast_poll);
            timers.cancel(watch.window);
        }
        let deadline = now + self.window;
        session.deadline = Some(deadline);
        session.watch = Some(Watch {
            fast_poll: timers.every(
                TimerKind::FastPoll,
                now + self.fast_poll_interval,
                self.fast_poll_interval,
            ),
            window: timers.once(TimerKind::MonitorWindow, deadline),
        });
        true
    }

    /// The server rejected the command: Requesting -> Idle.
    pub fn rejected(&mut self) -> bool {
        match self.phase() {
            Phase::Requesting => {
                self.session = None;
                true
            }
            _ => false,
        }
    }

    /// Routes a fired timer. Only the timers of the current watch count.
    pub fn on_timer(&mut self, id: TimerId, timers: &mut Timers) -> MonitorStep {
        let watch = match self.session.as_ref().and_then(|s| s.watch.as_ref()) {
            Some(w) => w,
            None => return MonitorStep::Ignore,
        };
        if id == watch.fast_poll {
            MonitorStep::FetchDoor
        } else if id == watch.window {
            self.cancel(timers);
            MonitorStep::Finished
        } else {
            MonitorStep::Ignore
        }
    }

    /// Any phase -> Idle, cancelling the watch timers.
    pub fn cancel(&mut self, timers: &mut Timers) {
        if let Some(session) = self.session.take() {
            if let Some(watch) = session.watch {
                timers.cancel(watch.fast_poll);
                timers.cancel(watch.window);
            }
        }
    }
}
