//! Synchronization
//!
//! The pieces the dashboard core is assembled from: the canonical `Store`,
//! the bounded `AccessLog`, the `Loader` that fetches snapshots, the manual
//! open `ManualOpenMonitor`, the `NotificationQueue` and the `Timers` the
//! core loop sleeps on. None of these do I/O or spawn threads on their own;
//! they are driven by `crate::dashboard_core`.

mod access_log;
mod loader;
mod monitor;
mod notify;
mod store;
mod timers;

pub use access_log::AccessLog;
pub use loader::{Limits, Loader};
pub use monitor::{ManualOpenMonitor, ManualOpenSession, MonitorBusy, MonitorStep, Phase};
pub use notify::{Notification, NotificationQueue, Severity};
pub use store::{Confirmed, Counters, Optimistic, Store, UserRow};
pub use timers::{TimerId, TimerKind, Timers};

/// Position in the store's write sequence. Every write gets a fresh stamp,
/// and fetches remember the stamp current when they were issued, which
/// orders snapshots against writes that happened while they were in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stamp(pub u64);

/// Identifies an operator command whose effect is pending confirmation.
pub type CommandId = u64;
