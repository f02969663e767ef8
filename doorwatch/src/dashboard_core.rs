//! Dashboard core
//!
//! The single thread that owns the `Store`. Everything that changes the
//! dashboard state arrives here as a message: operator commands from the
//! `Interface`, completions of fetches and commands from short-lived worker
//! threads, and transport events from the push channel. Timers (baseline
//! poll, manual open monitoring) are deadlines checked on every pass of the
//! loop. Since there is exactly one writer, the ordering rules of the store
//! are the only thing needed to merge racing sources.

use crate::api::{AccessApi, CommandError, EntityKind, FetchError, Snapshot};
use crate::config::Config;
use crate::dashboard::{DashboardView, Event};
use crate::live::{ChannelAction, LiveChannel, PushEvent, TransportEvent};
use crate::model::{LinkState, NewUser, UserId, MAIN_DOOR};
use crate::sync::{
    CommandId, Confirmed, Limits, Loader, ManualOpenMonitor, MonitorStep, NotificationQueue,
    Optimistic, Severity, Stamp, Store, TimerId, TimerKind, Timers,
};

use crossbeam::channel;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest the loop sleeps without checking its deadlines.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Requests from the `Interface` to the core thread.
#[derive(Debug, Clone)]
pub enum Command {
    OpenDoor,
    CreateUser(NewUser),
    SetUserActive(UserId, bool),
    DeleteUser(UserId),
    Refresh,
    Unmount,
}

/// Why a fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchCause {
    Initial,
    Poll,
    FastPoll,
    Repair,
    Refresh,
    AfterCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserAction {
    Create,
    Enable,
    Disable,
    Delete,
}

impl UserAction {
    fn done(&self) -> &'static str {
        match self {
            UserAction::Create => "User created",
            UserAction::Enable => "User enabled",
            UserAction::Disable => "User disabled",
            UserAction::Delete => "User deleted",
        }
    }

    fn failed(&self) -> &'static str {
        match self {
            UserAction::Create => "Failed to create user",
            UserAction::Enable => "Failed to enable user",
            UserAction::Disable => "Failed to disable user",
            UserAction::Delete => "Failed to delete user",
        }
    }
}

enum Completion {
    Fetched {
        kind: EntityKind,
        as_of: Stamp,
        cause: FetchCause,
        result: Result<Snapshot, FetchError>,
    },
    DoorOpen(Result<(), CommandError>),
    UserCommand {
        id: CommandId,
        action: UserAction,
        result: Result<Confirmed, CommandError>,
    },
}

/// Shared by the core and every worker it spawned. Once cancelled, workers
/// drop their results instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct StatusQueue {
    dest: Option<channel::Sender<Event>>,
}

impl StatusQueue {
    fn send(&self, event: Event) {
        if let Some(dest) = &self.dest {
            if let Err(e) = dest.try_send(event) {
                debug!("status event dropped: {:?}", e.into_inner());
            }
        }
    }
}

pub struct DashboardCore {
    admin_name: String,
    poll_interval: Duration,
    loader: Loader,
    channel: Option<LiveChannel>,
    commands: channel::Receiver<Command>,
    completion_tx: channel::Sender<Completion>,
    completion_rx: channel::Receiver<Completion>,
    status_queue: StatusQueue,
    view: Arc<RwLock<DashboardView>>,

    store: Store,
    timers: Timers,
    poll_timer: Option<TimerId>,
    monitor: ManualOpenMonitor,
    notifications: NotificationQueue,
    cancel: CancelToken,

    next_command_id: CommandId,
    /// Kinds whose last fetch failed; a streak is notified once.
    failing: HashSet<EntityKind>,
    /// Bumped on changes outside the store (monitor, notifications).
    generation: u64,
    published: Option<(u64, u64)>,
    view_revision: u64,
}

impl DashboardCore {
    pub fn new(
        config: &Config,
        api: Arc<dyn AccessApi>,
        channel: Option<LiveChannel>,
        commands: channel::Receiver<Command>,
        status_queue: Option<channel::Sender<Event>>,
        view: Arc<RwLock<DashboardView>>,
    ) -> DashboardCore {
        let (completion_tx, completion_rx) = channel::unbounded();
        let limits = Limits {
            log: config.log_limit,
            unauthorized: config.unauthorized_limit,
        };
        DashboardCore {
            admin_name: config.admin_name.clone(),
            poll_interval: config.poll_interval(),
            loader: Loader::new(api, limits),
            channel,
            commands,
            completion_tx,
            completion_rx,
            status_queue: StatusQueue { dest: status_queue },
            view,
            store: Store::new(config.log_limit, config.unauthorized_limit),
            timers: Timers::new(),
            poll_timer: None,
            monitor: ManualOpenMonitor::new(config.fast_poll_interval(), config.monitor_window()),
            notifications: NotificationQueue::new(config.notification_ttl()),
            cancel: CancelToken::default(),
            next_command_id: 0,
            failing: HashSet::new(),
            generation: 0,
            published: None,
            view_revision: 0,
        }
    }

    fn notify(&mut self, message: String, severity: Severity) {
        self.notifications.emit(message.clone(), severity, Instant::now());
        self.generation += 1;
        self.status_queue.send(Event::Notified(message, severity));
    }

    fn monitor_changed(&mut self) {
        self.generation += 1;
        self.status_queue.send(Event::Monitor(self.monitor.phase()));
    }

    /// Runs `job` on a worker thread, delivering its result unless the
    /// token was cancelled in the meantime.
    fn spawn<F>(&self, name: &str, job: F)
    where
        F: FnOnce() -> Completion + Send + 'static,
    {
        let tx = self.completion_tx.clone();
        let token = self.cancel.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if token.is_cancelled() {
                    return;
                }
                let completion = job();
                if !token.is_cancelled() {
                    let _ = tx.send(completion);
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn {}: {}", name, e);
        }
    }

    fn fetch(&self, kind: EntityKind, cause: FetchCause) {
        let as_of = self.store.mark();
        let loader = self.loader.clone();
        debug!(?cause, "fetching {}", kind);
        self.spawn("fetch", move || Completion::Fetched {
            kind,
            as_of,
            cause,
            result: loader.load(kind),
        });
    }

    fn fetch_all(&self, kinds: &[EntityKind], cause: FetchCause) {
        for kind in kinds {
            self.fetch(*kind, cause);
        }
    }

    fn mount(&mut self) {
        info!("dashboard mounted");
        self.status_queue.send(Event::Mounted);
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.connect() {
                warn!("push channel unavailable: {}", e);
                self.store.set_transport_link(LinkState::Error);
                self.status_queue.send(Event::Link(self.store.link()));
            }
        }
        self.fetch_all(&EntityKind::ALL, FetchCause::Initial);
        let now = Instant::now();
        self.poll_timer = Some(self.timers.every(
            TimerKind::Poll,
            now + self.poll_interval,
            self.poll_interval,
        ));
    }

    fn unmount(&mut self) {
        self.cancel.cancel();
        self.monitor.cancel(&mut self.timers);
        self.timers.cancel_all();
        self.poll_timer = None;
        if let Some(channel) = self.channel.as_mut() {
            channel.disconnect();
        }
        self.store.set_transport_link(LinkState::Disconnected);
        self.publish(false);
        info!("dashboard unmounted");
        self.status_queue.send(Event::Unmounted);
    }

    fn process_timers(&mut self, now: Instant) {
        for (id, kind) in self.timers.expired(now) {
            match kind {
                TimerKind::Poll => self.fetch_all(&EntityKind::VOLATILE, FetchCause::Poll),
                TimerKind::FastPoll | TimerKind::MonitorWindow => {
                    match self.monitor.on_timer(id, &mut self.timers) {
                        MonitorStep::FetchDoor => self.fetch(EntityKind::DoorStatus, FetchCause::FastPoll),
                        MonitorStep::Finished => {
                            info!("manual open monitoring window elapsed");
                            self.monitor_changed();
                        }
                        MonitorStep::Ignore => {}
                    }
                }
            }
        }
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        let timeout = self.timers.timeout(now, MAX_WAIT);
        match self.notifications.next_expiry() {
            Some(at) => timeout.min(at.saturating_duration_since(now)),
            None => timeout,
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenDoor => {
                if let Err(busy) = self.monitor.begin(Instant::now()) {
                    debug!("{}", busy);
                    self.status_queue.send(Event::ManualOpenBusy(busy.0));
                    return;
                }
                info!("requesting manual open for {}", self.admin_name);
                self.monitor_changed();
                let api = self.loader.api().clone();
                let admin_name = self.admin_name.clone();
                self.spawn("open-door", move || {
                    Completion::DoorOpen(api.open_door(&admin_name))
                });
            }
            Command::CreateUser(user) => {
                let id = self.issue(Optimistic::Create(user.clone()));
                let api = self.loader.api().clone();
                self.spawn("user-command", move || Completion::UserCommand {
                    id,
                    action: UserAction::Create,
                    result: api.create_user(&user).map(Confirmed::Upserted),
                });
            }
            Command::SetUserActive(user_id, active) => {
                let id = self.issue(Optimistic::SetActive {
                    id: user_id.clone(),
                    active,
                });
                let api = self.loader.api().clone();
                let action = if active {
                    UserAction::Enable
                } else {
                    UserAction::Disable
                };
                self.spawn("user-command", move || Completion::UserCommand {
                    id,
                    action,
                    result: api.set_user_active(&user_id, active).map(Confirmed::Upserted),
                });
            }
            Command::DeleteUser(user_id) => {
                let id = self.issue(Optimistic::Delete(user_id.clone()));
                let api = self.loader.api().clone();
                self.spawn("user-command", move || Completion::UserCommand {
                    id,
                    action: UserAction::Delete,
                    result: api
                        .delete_user(&user_id)
                        .map(|_| Confirmed::Removed(user_id)),
                });
            }
            Command::Refresh => {
                info!("refresh requested");
                self.fetch_all(&EntityKind::ALL, FetchCause::Refresh);
            }
            // Handled by the main loop.
            Command::Unmount => {}
        }
    }

    fn issue(&mut self, op: Optimistic) -> CommandId {
        let id = self.next_command_id;
        self.next_command_id += 1;
        debug!(id, "optimistic {:?}", op);
        self.store.apply_optimistic_command(id, op);
        id
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched {
                kind,
                as_of,
                cause,
                result,
            } => match result {
                Ok(snapshot) => {
                    let changed = self.store.apply_snapshot(snapshot, as_of);
                    if self.failing.remove(&kind) {
                        info!("{} fetch recovered", kind);
                    }
                    self.status_queue.send(Event::SnapshotApplied {
                        kind,
                        cause,
                        changed,
                    });
                }
                Err(err) => {
                    warn!(?cause, "failed to load {}: {}", kind, err);
                    if self.failing.insert(kind) {
                        self.notify(format!("Failed to load {}: {}", kind, err), Severity::Error);
                    }
                    self.status_queue.send(Event::FetchFailed(kind, err));
                }
            },
            Completion::DoorOpen(Ok(())) => {
                if self.monitor.accepted(Instant::now(), &mut self.timers) {
                    info!("manual open accepted, monitoring door {}", MAIN_DOOR);
                    self.notify("Door opened successfully".to_string(), Severity::Success);
                    self.monitor_changed();
                    self.fetch(EntityKind::DoorStatus, FetchCause::AfterCommand);
                    self.fetch(EntityKind::AccessLog, FetchCause::AfterCommand);
                }
            }
            Completion::DoorOpen(Err(err)) => {
                if self.monitor.rejected() {
                    let reason = err.reason();
                    info!("manual open rejected: {}", reason);
                    self.notify(format!("Failed to open door: {}", reason), Severity::Error);
                    self.status_queue.send(Event::ManualOpenRejected(reason));
                    self.monitor_changed();
                }
            }
            Completion::UserCommand { id, action, result } => match result {
                Ok(confirmed) => {
                    info!(id, "{}", action.done());
                    self.store.confirm_command(id, confirmed);
                    self.notify(action.done().to_string(), Severity::Success);
                    self.status_queue.send(Event::CommandConfirmed(id));
                    self.fetch(EntityKind::Stats, FetchCause::AfterCommand);
                }
                Err(err) => {
                    let reason = err.reason();
                    info!(id, "{}: {}", action.failed(), reason);
                    self.store.discard_command(id);
                    self.notify(format!("{}: {}", action.failed(), reason), Severity::Error);
                    self.status_queue.send(Event::CommandRejected(id, reason));
                }
            },
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let action = match self.channel.as_mut() {
            Some(channel) => channel.handle(event),
            None => return,
        };
        match action {
            ChannelAction::Link { state, repair } => {
                self.store.set_transport_link(state);
                self.status_queue.send(Event::Link(self.store.link()));
                if repair {
                    info!("push channel reconnected, reloading everything");
                    self.status_queue.send(Event::RepairRequested);
                    self.fetch_all(&EntityKind::ALL, FetchCause::Repair);
                }
            }
            ChannelAction::Push(push) => {
                let name = push.name();
                let toast = match &push {
                    PushEvent::NewAccessLog(entry) if entry.granted => {
                        Some((format!("Access granted: {}", entry.subject()), Severity::Success))
                    }
                    PushEvent::NewAccessLog(entry) => {
                        Some((format!("Access denied: {}", entry.subject()), Severity::Error))
                    }
                    _ => None,
                };
                let relay = matches!(push, PushEvent::LinkStatus(_));
                let changed = self.store.apply_push_event(push);
                if changed {
                    if let Some((message, severity)) = toast {
                        self.notify(message, severity);
                    }
                    if relay {
                        self.status_queue.send(Event::Link(self.store.link()));
                    }
                }
                self.status_queue.send(Event::PushApplied { event: name, changed });
            }
            ChannelAction::Dropped(reason) => {
                self.status_queue.send(Event::PushDropped(reason));
            }
            ChannelAction::None => {}
        }
    }

    fn build_view(&self, mounted: bool) -> DashboardView {
        DashboardView {
            mounted,
            users: self.store.users(),
            access_log: self.store.access_log().to_vec(),
            unauthorized: self.store.unauthorized().to_vec(),
            door: self.store.primary_door().cloned(),
            doors: self.store.doors().cloned().collect(),
            stats: self.store.stats().cloned(),
            counters: self.store.counters(),
            link: self.store.link(),
            phase: self.monitor.phase(),
            manual_open: self.monitor.session(),
            trigger_enabled: self.monitor.trigger_enabled(),
            notifications: self.notifications.to_vec(),
            pending_commands: self.store.pending_commands(),
            revision: self.view_revision,
        }
    }

    /// Publishes the view if anything changed since the last publish.
    fn publish(&mut self, mounted: bool) {
        let key = (self.store.revision(), self.generation);
        if mounted && self.published == Some(key) {
            return;
        }
        self.published = Some(key);
        self.view_revision += 1;
        let view = self.build_view(mounted);
        match self.view.write() {
            Ok(mut slot) => *slot = view,
            Err(poisoned) => *poisoned.into_inner() = view,
        }
    }

    pub fn run(&mut self) {
        use channel::TryRecvError;

        self.mount();

        'mainloop: loop {
            let now = Instant::now();
            self.process_timers(now);
            if self.notifications.expire(now) > 0 {
                self.generation += 1;
            }
            self.publish(true);

            let timeout = self.next_timeout(Instant::now());
            let index = {
                let mut sel = channel::Select::new();
                sel.recv(&self.commands);
                sel.recv(&self.completion_rx);
                if let Some(channel) = &self.channel {
                    sel.recv(channel.receiver());
                }
                match sel.ready_timeout(timeout) {
                    Ok(index) => index,
                    Err(channel::ReadyTimeoutError) => continue,
                }
            };

            match index {
                0 => loop {
                    match self.commands.try_recv() {
                        Ok(Command::Unmount) | Err(TryRecvError::Disconnected) => break 'mainloop,
                        Ok(command) => self.handle_command(command),
                        Err(TryRecvError::Empty) => break,
                    }
                },
                1 => {
                    while let Ok(completion) = self.completion_rx.try_recv() {
                        self.handle_completion(completion);
                    }
                }
                2 => loop {
                    let event = match self.channel.as_ref().map(|c| c.receiver().try_recv()) {
                        Some(Ok(event)) => event,
                        _ => break,
                    };
                    self.handle_transport(event);
                },
                _ => {}
            }
        }

        self.unmount();
    }
}
