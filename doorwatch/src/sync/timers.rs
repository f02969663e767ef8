//! Deadline bookkeeping for the core loop.
//!
//! Timers are plain deadlines, ordered in a `BTreeMap` so the loop can
//! compute how long to sleep. Nothing fires on its own: the loop calls
//! `expired()` after waking up. Periodic timers re-arm themselves one
//! period after their due time; if the loop fell behind by more than a
//! period, missed ticks are skipped rather than fired in a burst.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Baseline poll of volatile entities.
    Poll,
    /// High-frequency door status poll while a manual open is monitored.
    FastPoll,
    /// End of the manual open monitoring window.
    MonitorWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Timer {
    kind: TimerKind,
    due: Instant,
    period: Option<Duration>,
}

#[derive(Default)]
pub struct Timers {
    next_id: u64,
    timers: HashMap<TimerId, Timer>,
    queue: BTreeMap<Instant, HashSet<TimerId>>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    fn arm(&mut self, id: TimerId, timer: Timer) {
        self.queue.entry(timer.due).or_default().insert(id);
        self.timers.insert(id, timer);
    }

    fn unqueue(&mut self, id: TimerId, due: Instant) {
        if let Some(ids) = self.queue.get_mut(&due) {
            ids.remove(&id);
            if ids.is_empty() {
                self.queue.remove(&due);
            }
        }
    }

    fn schedule(&mut self, kind: TimerKind, due: Instant, period: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.arm(id, Timer { kind, due, period });
        id
    }

    /// One-shot timer due at `at`.
    pub fn once(&mut self, kind: TimerKind, at: Instant) -> TimerId {
        self.schedule(kind, at, None)
    }

    /// Periodic timer, first due at `first`, then every `period`.
    pub fn every(&mut self, kind: TimerKind, first: Instant, period: Duration) -> TimerId {
        self.schedule(kind, first, Some(period.max(Duration::from_millis(1))))
    }

    /// Returns false if the timer already fired (one-shot) or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                self.unqueue(id, timer.due);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
        self.queue.clear();
    }

    pub fn is_active(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Number of live timers of a kind.
    pub fn active(&self, kind: TimerKind) -> usize {
        self.timers.values().filter(|t| t.kind == kind).count()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().copied()
    }

    /// Pops every timer due at or before `now`, in due order.
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(due) = self.next_due() {
            if due > now {
                break;
            }
            let ids = self.queue.remove(&due).unwrap_or_default();
            let mut ids: Vec<TimerId> = ids.into_iter().collect();
            ids.sort();
            for id in ids {
                let timer = match self.timers.remove(&id) {
                    Some(t) => t,
                    None => continue,
                };
                fired.push((id, timer.kind));
                if let Some(period) = timer.period {
                    let mut next = timer.due + period;
                    if next <= now {
                        next = now + period;
                    }
                    self.arm(
                        id,
                        Timer {
                            kind: timer.kind,
                            due: next,
                            period: timer.period,
                        },
                    );
                }
            }
        }
        fired
    }

    /// Time until the next timer, capped at `max`.
    pub fn timeout(&self, now: Instant, max: Duration) -> Duration {
        match self.next_due() {
            Some(due) => std::cmp::min(due.saturating_duration_since(now), max),
            None => max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        let id = timers.once(TimerKind::MonitorWindow, t0 + Duration::from_millis(10));
        assert!(timers.expired(t0).is_empty());
        assert_eq!(
            timers.expired(t0 + Duration::from_millis(10)),
            vec![(id, TimerKind::MonitorWindow)]
        );
        assert!(!timers.is_active(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.next_due(), None);
    }

    #[test]
    fn periodic_rearms_and_skips_missed_ticks() {
        let t0 = Instant::now();
        let period = Duration::from_millis(100);
        let mut timers = Timers::new();
        let id = timers.every(TimerKind::Poll, t0 + period, period);

        assert_eq!(timers.expired(t0 + period).len(), 1);
        assert_eq!(timers.next_due(), Some(t0 + 2 * period));

        // Loop stalled for several periods: a single tick, then back on cadence.
        let late = t0 + Duration::from_millis(750);
        assert_eq!(timers.expired(late), vec![(id, TimerKind::Poll)]);
        assert_eq!(timers.next_due(), Some(late + period));
        assert_eq!(timers.active(TimerKind::Poll), 1);
    }

    #[test]
    fn cancel_removes_from_queue() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        let a = timers.every(TimerKind::FastPoll, t0, Duration::from_millis(5));
        let b = timers.once(TimerKind::MonitorWindow, t0);
        assert!(timers.cancel(a));
        assert_eq!(timers.active(TimerKind::FastPoll), 0);
        assert_eq!(timers.expired(t0), vec![(b, TimerKind::MonitorWindow)]);
        assert_eq!(
            timers.timeout(t0, Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
