use doorwatch::api::{AccessApi, CommandError, EntityKind, FetchError};
use doorwatch::live::{PushTransport, TransportError, TransportEvent, NEW_ACCESS_LOG};
use doorwatch::model::{
    AccessLogEntry, AccessStatus, DoorStatus, LinkState, NewUser, Stats, User, UserId, MAIN_DOOR,
};
use doorwatch::sync::{Phase, Severity};
use doorwatch::{Config, DashboardView, Event, FetchCause, Interface, InterfaceError};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam::channel;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn entry(secs: i64, code: &str, granted: bool) -> AccessLogEntry {
    AccessLogEntry {
        timestamp: ts(secs),
        user_name: Some("Ana".to_string()),
        access_code: code.to_string(),
        door_id: MAIN_DOOR.to_string(),
        granted,
        status: if granted {
            AccessStatus::NormalGrant
        } else {
            AccessStatus::NormalDeny
        },
        reason: None,
    }
}

fn user(id: &str, name: &str, code: &str, active: bool) -> User {
    User {
        id: UserId::from(id),
        name: name.to_string(),
        access_code: code.to_string(),
        is_active: active,
    }
}

struct FakeState {
    users: Vec<User>,
    logs: Vec<AccessLogEntry>,
    door: DoorStatus,
    open_reply: Result<(), String>,
    reject_user_commands: Option<String>,
    fail_door: bool,
    door_delay: Option<Duration>,
    next_id: u64,
}

struct FakeApi {
    state: Mutex<FakeState>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeApi {
    fn new() -> Arc<FakeApi> {
        Arc::new(FakeApi {
            state: Mutex::new(FakeState {
                users: vec![user("1", "Ana", "1111", true), user("2", "Luis", "2222", false)],
                logs: vec![entry(0, "1111", true)],
                door: DoorStatus {
                    door_id: MAIN_DOOR.to_string(),
                    is_open: false,
                    last_event_ts: ts(0),
                },
                open_reply: Ok(()),
                reject_user_commands: None,
                fail_door: false,
                door_delay: None,
                next_id: 10,
            }),
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn count(&self, call: &'static str) {
        *self.calls.lock().unwrap().entry(call).or_default() += 1;
    }

    fn calls(&self, call: &'static str) -> usize {
        self.calls.lock().unwrap().get(call).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl AccessApi for FakeApi {
    fn users(&self) -> Result<Vec<User>, FetchError> {
        self.count("users");
        Ok(self.with(|s| s.users.clone()))
    }

    fn create_user(&self, new: &NewUser) -> Result<User, CommandError> {
        self.count("create_user");
        self.with(|s| {
            if let Some(reason) = &s.reject_user_commands {
                return Err(CommandError::Rejected(reason.clone()));
            }
            s.next_id += 1;
            let created = user(&s.next_id.to_string(), &new.name, &new.access_code, new.is_active);
            s.users.push(created.clone());
            Ok(created)
        })
    }

    fn set_user_active(&self, id: &UserId, active: bool) -> Result<User, CommandError> {
        self.count("set_user_active");
        self.with(|s| {
            if let Some(reason) = &s.reject_user_commands {
                return Err(CommandError::Rejected(reason.clone()));
            }
            let found = s.users.iter_mut().find(|u| &u.id == id);
            match found {
                Some(u) => {
                    u.is_active = active;
                    Ok(u.clone())
                }
                None => Err(CommandError::Rejected("user not found".to_string())),
            }
        })
    }

    fn delete_user(&self, id: &UserId) -> Result<(), CommandError> {
        self.count("delete_user");
        self.with(|s| {
            if let Some(reason) = &s.reject_user_commands {
                return Err(CommandError::Rejected(reason.clone()));
            }
            s.users.retain(|u| &u.id != id);
            Ok(())
        })
    }

    fn access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>, FetchError> {
        self.count("access_logs");
        Ok(self.with(|s| s.logs.iter().take(limit).cloned().collect()))
    }

    fn unauthorized_access(&self, _limit: usize) -> Result<Vec<AccessLogEntry>, FetchError> {
        self.count("unauthorized_access");
        Ok(Vec::new())
    }

    fn door_status(&self) -> Result<DoorStatus, FetchError> {
        self.count("door_status");
        if let Some(delay) = self.with(|s| s.door_delay) {
            thread::sleep(delay);
        }
        self.with(|s| {
            if s.fail_door {
                Err(FetchError::Status(503))
            } else {
                Ok(s.door.clone())
            }
        })
    }

    fn open_door(&self, _admin_name: &str) -> Result<(), CommandError> {
        self.count("open_door");
        self.with(|s| s.open_reply.clone().map_err(CommandError::Rejected))
    }

    fn stats(&self) -> Result<Stats, FetchError> {
        self.count("stats");
        Ok(Stats {
            total_users: self.with(|s| s.users.len() as u64),
            ..Stats::default()
        })
    }
}

/// Transport driven by the test through a `ScriptHandle`.
struct ScriptedTransport {
    sink: Arc<Mutex<Option<channel::Sender<TransportEvent>>>>,
    disconnects: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct ScriptHandle {
    sink: Arc<Mutex<Option<channel::Sender<TransportEvent>>>>,
    disconnects: Arc<AtomicUsize>,
}

impl ScriptHandle {
    fn emit(&self, event: TransportEvent) {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.send(event).unwrap();
                return;
            }
            assert!(Instant::now() < deadline, "transport never connected");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn message(&self, event: &str, data: serde_json::Value) {
        self.emit(TransportEvent::Message {
            event: event.to_string(),
            data,
        });
    }
}

fn scripted() -> (Box<dyn PushTransport>, ScriptHandle) {
    let sink = Arc::new(Mutex::new(None));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let transport = ScriptedTransport {
        sink: sink.clone(),
        disconnects: disconnects.clone(),
    };
    (Box::new(transport), ScriptHandle { sink, disconnects })
}

impl PushTransport for ScriptedTransport {
    fn connect(&mut self, sink: channel::Sender<TransportEvent>) -> Result<(), TransportError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn disconnect(&mut self) {
        *self.sink.lock().unwrap() = None;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config() -> Config {
    Config {
        push_addr: None,
        poll_interval_ms: 60_000,
        fast_poll_interval_ms: 20,
        monitor_window_ms: 250,
        notification_ttl_ms: 5_000,
        ..Config::default()
    }
}

struct Harness {
    api: Arc<FakeApi>,
    link: ScriptHandle,
    events: channel::Receiver<Event>,
    dashboard: Interface,
}

impl Harness {
    fn mount(config: Config, api: Arc<FakeApi>) -> Harness {
        let (transport, link) = scripted();
        let (tx, events) = channel::unbounded();
        let dashboard =
            Interface::mount(&config, api.clone(), Some(transport), Some(tx)).unwrap();
        let harness = Harness {
            api,
            link,
            events,
            dashboard,
        };
        let mut loaded = 0;
        harness.wait_for(|ev| {
            if let Event::SnapshotApplied {
                cause: FetchCause::Initial,
                ..
            } = ev
            {
                loaded += 1;
            }
            loaded == EntityKind::ALL.len()
        });
        harness
    }

    /// Collects events until `pred` matches, panicking on timeout.
    fn wait_for(&self, mut pred: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(ev) => {
                    let done = pred(&ev);
                    seen.push(ev);
                    if done {
                        return seen;
                    }
                }
                Err(_) => panic!("timed out, saw {:?}", seen),
            }
        }
    }

    fn drain(&self, quiet: Duration) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Ok(ev) = self.events.recv_timeout(quiet) {
            seen.push(ev);
        }
        seen
    }

    /// Waits until the published view satisfies `pred`.
    fn view_where(&self, pred: impl Fn(&DashboardView) -> bool) -> DashboardView {
        let deadline = Instant::now() + WAIT;
        loop {
            let view = self.dashboard.view();
            if pred(&view) {
                return view;
            }
            assert!(Instant::now() < deadline, "view never matched: {:?}", view);
            thread::sleep(Duration::from_millis(5));
        }
    }
}

#[test]
fn mount_loads_every_entity_kind() {
    let h = Harness::mount(test_config(), FakeApi::new());
    let view = h.view_where(|v| v.users.len() == 2 && v.door.is_some() && v.stats.is_some());
    assert!(view.mounted);
    assert_eq!(view.access_log.len(), 1);
    assert_eq!(view.counters.active_users, 1);
    assert_eq!(view.counters.granted_accesses, 1);
    assert_eq!(view.phase, Phase::Idle);
    assert!(view.trigger_enabled);
    for call in ["users", "access_logs", "unauthorized_access", "door_status", "stats"] {
        assert_eq!(h.api.calls(call), 1, "{}", call);
    }
}

#[test]
fn accepted_open_monitors_then_returns_to_idle() {
    let h = Harness::mount(test_config(), FakeApi::new());
    h.dashboard.open_door().unwrap();

    h.wait_for(|ev| *ev == Event::Monitor(Phase::Monitoring));
    let window = h.wait_for(|ev| *ev == Event::Monitor(Phase::Idle));
    let fast_polls = window
        .iter()
        .filter(|ev| {
            matches!(
                ev,
                Event::SnapshotApplied {
                    kind: EntityKind::DoorStatus,
                    cause: FetchCause::FastPoll,
                    ..
                }
            )
        })
        .count();
    assert!(fast_polls >= 3, "only {} fast polls", fast_polls);

    let view = h.view_where(|v| v.phase == Phase::Idle);
    assert!(view.trigger_enabled);
    assert!(view.manual_open.is_none());
    assert!(view
        .notifications
        .iter()
        .any(|n| n.severity == Severity::Success && n.message == "Door opened successfully"));

    // No more fast polls once the window is over.
    thread::sleep(Duration::from_millis(50));
    let settled = h.api.calls("door_status");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(h.api.calls("door_status"), settled);
}

#[test]
fn rejected_open_notifies_reason_and_returns_to_idle() {
    let api = FakeApi::new();
    api.with(|s| s.open_reply = Err("locked".to_string()));
    let h = Harness::mount(test_config(), api);
    let before = h.view_where(|v| v.door.is_some() && v.users.len() == 2);

    h.dashboard.open_door().unwrap();
    let seen = h.wait_for(|ev| *ev == Event::Monitor(Phase::Idle));
    assert!(seen.contains(&Event::ManualOpenRejected("locked".to_string())));
    assert!(!seen.contains(&Event::Monitor(Phase::Monitoring)));

    let view = h.view_where(|v| !v.notifications.is_empty());
    assert!(view.trigger_enabled);
    assert_eq!(view.notifications[0].severity, Severity::Error);
    assert!(view.notifications[0].message.contains("locked"));
    assert_eq!(view.users, before.users);
    assert_eq!(view.door, before.door);
    assert_eq!(h.api.calls("door_status"), 1);
}

#[test]
fn trigger_is_single_flight() {
    let h = Harness::mount(test_config(), FakeApi::new());
    h.dashboard.open_door().unwrap();
    h.view_where(|v| v.phase == Phase::Monitoring);
    assert!(matches!(
        h.dashboard.open_door(),
        Err(InterfaceError::TriggerBusy(Phase::Monitoring))
    ));
    h.wait_for(|ev| *ev == Event::Monitor(Phase::Idle));
    assert_eq!(h.api.calls("open_door"), 1);
}

#[test]
fn reconnect_repairs_each_kind_once() {
    let h = Harness::mount(test_config(), FakeApi::new());

    h.link.emit(TransportEvent::Connecting);
    h.link.emit(TransportEvent::Connected);
    let seen = h.wait_for(|ev| matches!(ev, Event::Link(l) if l.transport == LinkState::Connected));
    assert!(!seen.contains(&Event::RepairRequested));

    h.link.emit(TransportEvent::Disconnected);
    h.link.emit(TransportEvent::Connecting);
    h.link.emit(TransportEvent::Error("connection refused".to_string()));
    h.link.emit(TransportEvent::Connecting);
    h.link.emit(TransportEvent::Connected);
    h.wait_for(|ev| *ev == Event::RepairRequested);

    let mut repaired = HashMap::new();
    h.wait_for(|ev| {
        if let Event::SnapshotApplied {
            kind,
            cause: FetchCause::Repair,
            ..
        } = ev
        {
            *repaired.entry(*kind).or_insert(0) += 1;
        }
        repaired.len() == EntityKind::ALL.len()
    });
    let rest = h.drain(Duration::from_millis(200));
    assert!(!rest.contains(&Event::RepairRequested));
    for kind in EntityKind::ALL {
        assert_eq!(repaired.get(&kind), Some(&1), "{}", kind);
    }
    assert_eq!(h.api.calls("users"), 2);
}

#[test]
fn malformed_push_is_dropped_and_state_kept() {
    let h = Harness::mount(test_config(), FakeApi::new());
    h.view_where(|v| v.access_log.len() == 1);

    h.link.message(NEW_ACCESS_LOG, json!({"timestamp": "yesterday"}));
    h.wait_for(|ev| matches!(ev, Event::PushDropped(_)));
    assert_eq!(h.dashboard.view().access_log.len(), 1);

    let pushed = serde_json::to_value(entry(60, "2222", true)).unwrap();
    h.link.message(NEW_ACCESS_LOG, pushed);
    h.wait_for(|ev| {
        matches!(
            ev,
            Event::PushApplied {
                changed: true,
                ..
            }
        )
    });
    let view = h.view_where(|v| v.access_log.len() == 2);
    assert_eq!(view.access_log[0].timestamp, ts(60));
    assert_eq!(view.counters.granted_accesses, 2);
    assert!(view
        .notifications
        .iter()
        .any(|n| n.message == "Access granted: Ana"));
}

#[test]
fn redelivered_push_notifies_once() {
    let h = Harness::mount(test_config(), FakeApi::new());
    h.view_where(|v| v.access_log.len() == 1);

    let pushed = serde_json::to_value(entry(70, "2222", false)).unwrap();
    h.link.message(NEW_ACCESS_LOG, pushed.clone());
    h.link.message(NEW_ACCESS_LOG, pushed);
    let mut applied = Vec::new();
    let seen = h.wait_for(|ev| {
        if let Event::PushApplied { changed, .. } = ev {
            applied.push(*changed);
        }
        applied.len() == 2
    });
    assert_eq!(applied, vec![true, false]);
    let toasts = seen
        .iter()
        .filter(|ev| matches!(ev, Event::Notified(msg, _) if msg == "Access denied: Ana"))
        .count();
    assert_eq!(toasts, 1);

    let view = h.view_where(|v| v.access_log.len() == 2);
    assert_eq!(
        view.notifications
            .iter()
            .filter(|n| n.message == "Access denied: Ana")
            .count(),
        1
    );
}

#[test]
fn rejected_user_command_leaves_users_untouched() {
    let api = FakeApi::new();
    api.with(|s| s.reject_user_commands = Some("not allowed".to_string()));
    let h = Harness::mount(test_config(), api);
    let before = h.view_where(|v| v.users.len() == 2);

    h.dashboard.set_user_active(UserId::from("1"), false).unwrap();
    let seen = h.wait_for(|ev| matches!(ev, Event::CommandRejected(..)));
    assert!(matches!(seen.last(), Some(Event::CommandRejected(_, reason)) if reason == "not allowed"));

    let view = h.view_where(|v| v.pending_commands == 0 && !v.notifications.is_empty());
    assert_eq!(view.users, before.users);
    assert!(view.users.iter().all(|u| !u.pending));
    assert_eq!(view.notifications[0].message, "Failed to disable user: not allowed");
}

#[test]
fn user_commands_confirm_into_the_collection() {
    let h = Harness::mount(test_config(), FakeApi::new());
    h.view_where(|v| v.users.len() == 2);

    h.dashboard.create_user(NewUser::new(" Marta ", "3333")).unwrap();
    h.wait_for(|ev| matches!(ev, Event::CommandConfirmed(_)));
    h.dashboard.delete_user(UserId::from("2")).unwrap();
    h.wait_for(|ev| matches!(ev, Event::CommandConfirmed(_)));

    let view = h.view_where(|v| v.pending_commands == 0 && v.users.len() == 2);
    let marta = view.users.iter().find(|u| u.name == "Marta").unwrap();
    assert_eq!(marta.id, Some(UserId::from("11")));
    assert!(!marta.pending);
    assert!(view.users.iter().all(|u| u.id != Some(UserId::from("2"))));

    assert!(matches!(
        h.dashboard.create_user(NewUser::new("", "4444")),
        Err(InterfaceError::IncompleteUser)
    ));
}

#[test]
fn fetch_failure_streak_notifies_once() {
    let api = FakeApi::new();
    api.with(|s| s.fail_door = true);
    let config = Config {
        poll_interval_ms: 30,
        ..test_config()
    };
    let (transport, _link) = scripted();
    let (tx, events) = channel::unbounded();
    let dashboard = Interface::mount(&config, api.clone(), Some(transport), Some(tx)).unwrap();

    let mut failures = 0;
    let deadline = Instant::now() + WAIT;
    while failures < 3 {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left).unwrap() {
            Event::FetchFailed(EntityKind::DoorStatus, FetchError::Status(503)) => failures += 1,
            _ => {}
        }
    }
    let view = dashboard.view();
    let door_errors = view
        .notifications
        .iter()
        .filter(|n| n.message.starts_with("Failed to load door status"))
        .count();
    assert_eq!(door_errors, 1);
    assert!(view.door.is_none());
    dashboard.unmount();
}

#[test]
fn unmount_stops_timers_and_channel() {
    let config = Config {
        poll_interval_ms: 20,
        ..test_config()
    };
    let h = Harness::mount(config, FakeApi::new());
    let mut polls = 0;
    h.wait_for(|ev| {
        if let Event::SnapshotApplied {
            cause: FetchCause::Poll,
            ..
        } = ev
        {
            polls += 1;
        }
        polls >= 6
    });

    let Harness {
        api,
        link,
        events,
        dashboard,
    } = h;
    dashboard.unmount();
    assert_eq!(link.disconnects.load(Ordering::SeqCst), 1);
    assert!(events.try_iter().any(|ev| ev == Event::Unmounted));

    // Requests already on the wire may still land; nothing new is issued.
    thread::sleep(Duration::from_millis(50));
    let settled = api.total_calls();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(api.total_calls(), settled);
    assert!(events.try_iter().next().is_none());
}

#[test]
fn slow_poll_does_not_hold_back_ticks_or_outlive_unmount() {
    let config = Config {
        poll_interval_ms: 50,
        ..test_config()
    };
    let h = Harness::mount(config, FakeApi::new());
    h.api.with(|s| s.door_delay = Some(Duration::from_millis(400)));
    let before = h.api.calls("door_status");

    // Access log polls keep landing while door fetches are stuck.
    let mut polls = 0;
    h.wait_for(|ev| {
        if let Event::SnapshotApplied {
            kind: EntityKind::AccessLog,
            cause: FetchCause::Poll,
            ..
        } = ev
        {
            polls += 1;
        }
        polls >= 4
    });
    assert!(h.api.calls("door_status") >= before + 3);

    // The door changes while those fetches are still blocked.
    h.api.with(|s| {
        s.door.is_open = true;
        s.door.last_event_ts = ts(50);
    });
    let Harness {
        api,
        events,
        dashboard,
        ..
    } = h;
    dashboard.unmount();
    let mut after_unmount = events.try_iter().skip_while(|ev| *ev != Event::Unmounted);
    assert_eq!(after_unmount.next(), Some(Event::Unmounted));
    assert!(after_unmount.next().is_none());

    thread::sleep(Duration::from_millis(600));
    let settled = api.calls("door_status");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(api.calls("door_status"), settled);
    let late: Vec<Event> = events.try_iter().collect();
    assert!(
        !late.iter().any(|ev| matches!(ev, Event::SnapshotApplied { .. })),
        "late events {:?}",
        late
    );
}
