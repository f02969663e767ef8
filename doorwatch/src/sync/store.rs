//! Store
//!
//! The canonical in-memory state of the dashboard. Every source of updates
//! (snapshots, push events, operator commands) goes through one of the
//! `apply_*` methods, which enforce the ordering rules:
//!
//! - Door status is last-timestamp-wins on the server's event timestamp: an
//!   older status is ignored, an equal or newer one replaces the current.
//! - Users, access log entries and stats carry the `Stamp` of the write that
//!   installed them. A snapshot requested at `as_of` never overrides
//!   anything written after `as_of`.
//! - Operator commands are kept in an overlay on top of the confirmed users
//!   until the server answers, so a rejected command leaves the confirmed
//!   collection untouched.

use super::{AccessLog, CommandId, Stamp};
use crate::api::Snapshot;
use crate::live::PushEvent;
use crate::model::{DoorStatus, LinkHealth, LinkState, NewUser, Stats, User, UserId, MAIN_DOOR};

use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct UserSlot {
    /// None marks a deletion that must outlive older snapshots.
    user: Option<User>,
    stamp: Stamp,
}

/// Speculative effect of an operator command, shown until confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Optimistic {
    Create(NewUser),
    SetActive { id: UserId, active: bool },
    Delete(UserId),
}

/// Effect of a command as confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmed {
    Upserted(User),
    Removed(UserId),
}

/// A user as presented: confirmed state with pending commands applied.
/// Rows created by a pending command have no id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: Option<UserId>,
    pub name: String,
    pub access_code: String,
    pub is_active: bool,
    pub pending: bool,
}

impl UserRow {
    fn confirmed(user: &User) -> UserRow {
        UserRow {
            id: Some(user.id.clone()),
            name: user.name.clone(),
            access_code: user.access_code.clone(),
            is_active: user.is_active,
            pending: false,
        }
    }
}

/// Counters derived locally from the collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub active_users: usize,
    pub granted_accesses: usize,
    pub unauthorized_attempts: usize,
}

pub struct Store {
    clock: u64,
    revision: u64,
    users: BTreeMap<UserId, UserSlot>,
    overlay: BTreeMap<CommandId, Optimistic>,
    log: AccessLog,
    unauthorized: AccessLog,
    doors: BTreeMap<String, DoorStatus>,
    stats: Option<(Stats, Stamp)>,
    link: LinkHealth,
}

impl Store {
    pub fn new(log_capacity: usize, unauthorized_capacity: usize) -> Store {
        Store {
            clock: 0,
            revision: 0,
            users: BTreeMap::new(),
            overlay: BTreeMap::new(),
            log: AccessLog::new(log_capacity),
            unauthorized: AccessLog::new(unauthorized_capacity),
            doors: BTreeMap::new(),
            stats: None,
            link: LinkHealth::default(),
        }
    }

    fn next_stamp(&mut self) -> Stamp {
        self.clock += 1;
        Stamp(self.clock)
    }

    /// Stamp of the latest write. Record it when issuing a fetch, and pass
    /// it back as `as_of` when applying the result.
    pub fn mark(&self) -> Stamp {
        Stamp(self.clock)
    }

    /// Bumped on every visible change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn changed(&mut self) {
        self.revision += 1;
    }

    /// Installs a fetched collection. Returns false when nothing was applied
    /// (stale door status, or stats superseded by a later push).
    pub fn apply_snapshot(&mut self, snapshot: Snapshot, as_of: Stamp) -> bool {
        let stamp = self.next_stamp();
        let applied = match snapshot {
            Snapshot::Users(users) => {
                let mut next = BTreeMap::new();
                for user in users {
                    next.insert(
                        user.id.clone(),
                        UserSlot {
                            user: Some(user),
                            stamp,
                        },
                    );
                }
                for (id, slot) in std::mem::take(&mut self.users) {
                    if slot.stamp > as_of {
                        next.insert(id, slot);
                    }
                }
                self.users = next;
                true
            }
            Snapshot::AccessLog(entries) => {
                self.log.apply_snapshot(entries, as_of, stamp);
                true
            }
            Snapshot::Unauthorized(entries) => {
                self.unauthorized.apply_snapshot(entries, as_of, stamp);
                true
            }
            Snapshot::DoorStatus(status) => return self.apply_door_status(status),
            Snapshot::Stats(stats) => {
                if matches!(&self.stats, Some((_, written)) if *written > as_of) {
                    debug!("stats snapshot superseded by a newer push");
                    false
                } else {
                    self.stats = Some((stats, stamp));
                    true
                }
            }
        };
        if applied {
            self.changed();
        }
        applied
    }

    /// Door status supersedes the current one for the same door only if its
    /// event timestamp is not older.
    pub fn apply_door_status(&mut self, status: DoorStatus) -> bool {
        if let Some(current) = self.doors.get(&status.door_id) {
            if status.last_event_ts < current.last_event_ts {
                debug!(
                    door = %status.door_id,
                    "ignoring stale door status from {} (have {})",
                    status.last_event_ts,
                    current.last_event_ts
                );
                return false;
            }
            if *current == status {
                return false;
            }
        }
        self.doors.insert(status.door_id.clone(), status);
        self.changed();
        true
    }

    /// Applies a targeted update from the push channel. Returns whether
    /// anything visible changed.
    pub fn apply_push_event(&mut self, event: PushEvent) -> bool {
        let stamp = self.next_stamp();
        let changed = match event {
            PushEvent::NewAccessLog(entry) => {
                let mut changed = false;
                if entry.is_unauthorized() {
                    changed |= self.unauthorized.insert(entry.clone(), stamp);
                }
                changed |= self.log.insert(entry, stamp);
                changed
            }
            PushEvent::UserCreated(user) | PushEvent::UserUpdated(user) => {
                self.users.insert(
                    user.id.clone(),
                    UserSlot {
                        user: Some(user),
                        stamp,
                    },
                );
                true
            }
            PushEvent::UserDeleted(id) => {
                let existed = self.user(&id).is_some();
                self.users.insert(id, UserSlot { user: None, stamp });
                existed
            }
            PushEvent::StatsUpdated(stats) => {
                self.stats = Some((stats, stamp));
                true
            }
            PushEvent::LinkStatus(state) => return self.set_relay_link(state),
        };
        if changed {
            self.changed();
        }
        changed
    }

    /// Shows the effect of a command before the server confirms it.
    pub fn apply_optimistic_command(&mut self, id: CommandId, op: Optimistic) {
        self.overlay.insert(id, op);
        self.changed();
    }

    /// Installs the confirmed result of a command and drops its overlay.
    pub fn confirm_command(&mut self, id: CommandId, confirmed: Confirmed) {
        self.overlay.remove(&id);
        let stamp = self.next_stamp();
        match confirmed {
            Confirmed::Upserted(user) => {
                self.users.insert(
                    user.id.clone(),
                    UserSlot {
                        user: Some(user),
                        stamp,
                    },
                );
            }
            Confirmed::Removed(user_id) => {
                self.users.insert(user_id, UserSlot { user: None, stamp });
            }
        }
        self.changed();
    }

    /// Forgets a rejected command. Confirmed state is not touched.
    pub fn discard_command(&mut self, id: CommandId) -> bool {
        if self.overlay.remove(&id).is_some() {
            self.changed();
            true
        } else {
            false
        }
    }

    pub fn pending_commands(&self) -> usize {
        self.overlay.len()
    }

    pub fn set_transport_link(&mut self, state: LinkState) -> bool {
        if self.link.transport == state {
            return false;
        }
        self.link.transport = state;
        self.changed();
        true
    }

    pub fn set_relay_link(&mut self, state: LinkState) -> bool {
        if self.link.relay == Some(state) {
            return false;
        }
        self.link.relay = Some(state);
        self.changed();
        true
    }

    pub fn link(&self) -> LinkHealth {
        self.link
    }

    pub fn user(&self, id: &UserId) -> Option<&User> {
        self.users.get(id).and_then(|slot| slot.user.as_ref())
    }

    /// Users confirmed by the server, without pending commands.
    pub fn confirmed_users(&self) -> impl Iterator<Item = &User> {
        self.users.values().filter_map(|slot| slot.user.as_ref())
    }

    /// Users as presented, with pending commands applied in issue order.
    pub fn users(&self) -> Vec<UserRow> {
        let mut rows: Vec<UserRow> = self.confirmed_users().map(UserRow::confirmed).collect();
        for op in self.overlay.values() {
            match op {
                Optimistic::SetActive { id, active } => {
                    if let Some(row) = rows.iter_mut().find(|r| r.id.as_ref() == Some(id)) {
                        row.is_active = *active;
                        row.pending = true;
                    }
                }
                Optimistic::Delete(id) => rows.retain(|r| r.id.as_ref() != Some(id)),
                Optimistic::Create(new) => {
                    // A push may confirm the user before the command returns.
                    if !rows.iter().any(|r| r.access_code == new.access_code) {
                        rows.push(UserRow {
                            id: None,
                            name: new.name.clone(),
                            access_code: new.access_code.clone(),
                            is_active: new.is_active,
                            pending: true,
                        });
                    }
                }
            }
        }
        rows
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.log
    }

    pub fn unauthorized(&self) -> &AccessLog {
        &self.unauthorized
    }

    pub fn door(&self, door_id: &str) -> Option<&DoorStatus> {
        self.doors.get(door_id)
    }

    /// The main door, or the only door a server reports under another id.
    pub fn primary_door(&self) -> Option<&DoorStatus> {
        match self.door(MAIN_DOOR) {
            Some(door) => Some(door),
            None if self.doors.len() == 1 => self.doors.values().next(),
            None => None,
        }
    }

    pub fn doors(&self) -> impl Iterator<Item = &DoorStatus> {
        self.doors.values()
    }

    pub fn stats(&self) -> Option<&Stats> {
        self.stats.as_ref().map(|(stats, _)| stats)
    }

    pub fn counters(&self) -> Counters {
        Counters {
            active_users: self.users().iter().filter(|u| u.is_active).count(),
            granted_accesses: self.log.granted_count(),
            unauthorized_attempts: self.unauthorized.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessLogEntry, AccessStatus, MAIN_DOOR};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(secs: i64, code: &str, granted: bool) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: ts(secs),
            user_name: Some("Ana".into()),
            access_code: code.to_string(),
            door_id: MAIN_DOOR.to_string(),
            granted,
            status: if granted {
                AccessStatus::NormalGrant
            } else {
                AccessStatus::Unauthorized
            },
            reason: None,
        }
    }

    fn user(id: &str, active: bool) -> User {
        User {
            id: UserId::from(id),
            name: format!("user {}", id),
            access_code: format!("code-{}", id),
            is_active: active,
        }
    }

    fn door(open: bool, secs: i64) -> DoorStatus {
        DoorStatus {
            door_id: MAIN_DOOR.to_string(),
            is_open: open,
            last_event_ts: ts(secs),
        }
    }

    #[test]
    fn pushed_log_entries_are_bounded() {
        let mut store = Store::new(100, 20);
        store.apply_push_event(PushEvent::NewAccessLog(entry(1, "A1", true)));
        assert_eq!(store.access_log().len(), 1);
        assert_eq!(store.counters().granted_accesses, 1);

        for i in 0..100 {
            store.apply_push_event(PushEvent::NewAccessLog(entry(10 + i, "B", true)));
        }
        assert_eq!(store.access_log().len(), 100);
        assert!(!store.access_log().contains(&entry(1, "A1", true).key()));
        assert_eq!(store.access_log().newest().unwrap().timestamp, ts(109));
    }

    #[test]
    fn repeated_push_is_idempotent() {
        let mut store = Store::new(100, 20);
        assert!(store.apply_push_event(PushEvent::NewAccessLog(entry(3, "X", false))));
        let rev = store.revision();
        assert!(!store.apply_push_event(PushEvent::NewAccessLog(entry(3, "X", false))));
        assert_eq!(store.revision(), rev);
        assert_eq!(store.access_log().len(), 1);
        assert_eq!(store.unauthorized().len(), 1);
    }

    #[test]
    fn unauthorized_push_lands_in_both_lists() {
        let mut store = Store::new(100, 2);
        for i in 0..3 {
            store.apply_push_event(PushEvent::NewAccessLog(entry(i, "X", false)));
        }
        assert_eq!(store.access_log().len(), 3);
        assert_eq!(store.unauthorized().len(), 2);
        assert_eq!(store.counters().unauthorized_attempts, 2);
    }

    #[test]
    fn stale_door_status_is_ignored() {
        let mut store = Store::new(100, 20);
        assert!(store.apply_door_status(door(true, 10)));
        let rev = store.revision();
        assert!(!store.apply_snapshot(Snapshot::DoorStatus(door(false, 5)), store.mark()));
        assert_eq!(store.revision(), rev);
        assert!(store.door(MAIN_DOOR).unwrap().is_open);

        // Same timestamp is not older: it supersedes.
        assert!(store.apply_door_status(door(false, 10)));
        assert!(!store.door(MAIN_DOOR).unwrap().is_open);
    }

    #[test]
    fn single_door_under_other_id_is_primary() {
        let mut store = Store::new(100, 20);
        assert!(store.primary_door().is_none());
        let mut side = door(true, 10);
        side.door_id = "side".into();
        store.apply_door_status(side.clone());
        assert_eq!(store.primary_door(), Some(&side));

        let mut back = door(false, 11);
        back.door_id = "back".into();
        store.apply_door_status(back);
        assert!(store.primary_door().is_none());

        store.apply_door_status(door(false, 12));
        assert_eq!(store.primary_door().map(|d| d.door_id.as_str()), Some(MAIN_DOOR));
    }

    #[test]
    fn slow_user_snapshot_does_not_undo_push() {
        let mut store = Store::new(100, 20);
        store.apply_snapshot(Snapshot::Users(vec![user("1", true), user("2", true)]), store.mark());

        let as_of = store.mark();
        store.apply_push_event(PushEvent::UserUpdated(user("1", false)));
        store.apply_push_event(PushEvent::UserDeleted(UserId::from("2")));
        store.apply_push_event(PushEvent::UserCreated(user("3", true)));

        // Snapshot taken before the pushes arrives late.
        store.apply_snapshot(
            Snapshot::Users(vec![user("1", true), user("2", true)]),
            as_of,
        );
        assert!(!store.user(&UserId::from("1")).unwrap().is_active);
        assert!(store.user(&UserId::from("2")).is_none());
        assert!(store.user(&UserId::from("3")).is_some());

        // A fresh snapshot is authoritative again.
        store.apply_snapshot(Snapshot::Users(vec![user("2", true)]), store.mark());
        let ids: Vec<_> = store.confirmed_users().map(|u| u.id.0.clone()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn stats_snapshot_older_than_push_is_skipped() {
        let mut store = Store::new(100, 20);
        let as_of = store.mark();
        let pushed = Stats {
            total_users: 5,
            ..Stats::default()
        };
        store.apply_push_event(PushEvent::StatsUpdated(pushed.clone()));
        assert!(!store.apply_snapshot(Snapshot::Stats(Stats::default()), as_of));
        assert_eq!(store.stats(), Some(&pushed));
        assert!(store.apply_snapshot(Snapshot::Stats(Stats::default()), store.mark()));
        assert_eq!(store.stats(), Some(&Stats::default()));
    }

    #[test]
    fn rejected_command_leaves_users_untouched() {
        let mut store = Store::new(100, 20);
        store.apply_snapshot(Snapshot::Users(vec![user("1", true)]), store.mark());
        let before: Vec<User> = store.confirmed_users().cloned().collect();

        store.apply_optimistic_command(
            1,
            Optimistic::SetActive {
                id: UserId::from("1"),
                active: false,
            },
        );
        store.apply_optimistic_command(2, Optimistic::Delete(UserId::from("1")));
        store.apply_optimistic_command(3, Optimistic::Create(NewUser::new("Eva", "777")));
        assert_eq!(store.users().len(), 1);
        assert!(store.users()[0].pending);
        assert!(store.users()[0].id.is_none());

        store.discard_command(1);
        store.discard_command(2);
        store.discard_command(3);
        let after: Vec<User> = store.confirmed_users().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(store.users(), vec![UserRow::confirmed(&before[0])]);
    }

    #[test]
    fn confirmed_command_replaces_overlay() {
        let mut store = Store::new(100, 20);
        store.apply_snapshot(Snapshot::Users(vec![user("1", true)]), store.mark());
        store.apply_optimistic_command(
            7,
            Optimistic::SetActive {
                id: UserId::from("1"),
                active: false,
            },
        );
        let row = &store.users()[0];
        assert!(!row.is_active && row.pending);
        assert_eq!(store.counters().active_users, 0);

        store.confirm_command(7, Confirmed::Upserted(user("1", false)));
        assert_eq!(store.pending_commands(), 0);
        let row = &store.users()[0];
        assert!(!row.is_active && !row.pending);
    }

    #[test]
    fn pending_create_hidden_once_pushed() {
        let mut store = Store::new(100, 20);
        let new = NewUser {
            name: "user 9".into(),
            access_code: "code-9".into(),
            is_active: true,
        };
        store.apply_optimistic_command(1, Optimistic::Create(new));
        store.apply_push_event(PushEvent::UserCreated(user("9", true)));
        assert_eq!(store.users().len(), 1);
        assert!(!store.users()[0].pending);
    }

    #[test]
    fn relay_link_only_touches_relay() {
        let mut store = Store::new(100, 20);
        store.set_transport_link(LinkState::Connected);
        store.apply_push_event(PushEvent::LinkStatus(LinkState::Error));
        assert_eq!(store.link().transport, LinkState::Connected);
        assert_eq!(store.link().relay, Some(LinkState::Error));
    }
}
