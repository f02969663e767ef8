use crate::api::{AccessApi, EntityKind, FetchError, HttpApi};
use crate::config::{Config, ConfigError};
use crate::dashboard_core::{Command, DashboardCore, FetchCause};
use crate::live::{Backoff, LiveChannel, PushTransport, TcpTransport};
use crate::model::{AccessLogEntry, DoorStatus, LinkHealth, NewUser, Stats, UserId};
use crate::sync::{CommandId, Counters, ManualOpenSession, Notification, Phase, Severity, UserRow};

use crossbeam::channel;
use std::sync::{Arc, RwLock};
use std::thread;
use thiserror::Error;
use tracing::warn;

/// Lifecycle events published by the core on the optional status queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Mounted,
    SnapshotApplied {
        kind: EntityKind,
        cause: FetchCause,
        changed: bool,
    },
    FetchFailed(EntityKind, FetchError),
    PushApplied {
        event: &'static str,
        changed: bool,
    },
    PushDropped(String),
    Link(LinkHealth),
    /// The push channel came back; every entity kind is being reloaded.
    RepairRequested,
    Monitor(Phase),
    ManualOpenRejected(String),
    ManualOpenBusy(Phase),
    CommandConfirmed(CommandId),
    CommandRejected(CommandId, String),
    Notified(String, Severity),
    Unmounted,
}

/// Read-only copy of the dashboard state, republished by the core whenever
/// it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub mounted: bool,
    pub users: Vec<UserRow>,
    /// Newest first.
    pub access_log: Vec<AccessLogEntry>,
    pub unauthorized: Vec<AccessLogEntry>,
    /// Status of the main door, once known.
    pub door: Option<DoorStatus>,
    pub doors: Vec<DoorStatus>,
    pub stats: Option<Stats>,
    pub counters: Counters,
    pub link: LinkHealth,
    pub phase: Phase,
    pub manual_open: Option<ManualOpenSession>,
    pub trigger_enabled: bool,
    pub notifications: Vec<Notification>,
    pub pending_commands: usize,
    /// Increases with every publish.
    pub revision: u64,
}

impl Default for DashboardView {
    fn default() -> DashboardView {
        DashboardView {
            mounted: false,
            users: Vec::new(),
            access_log: Vec::new(),
            unauthorized: Vec::new(),
            door: None,
            doors: Vec::new(),
            stats: None,
            counters: Counters::default(),
            link: LinkHealth::default(),
            phase: Phase::Idle,
            manual_open: None,
            trigger_enabled: true,
            notifications: Vec::new(),
            pending_commands: 0,
            revision: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to start dashboard core: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("dashboard core is no longer running")]
    CoreGone,

    #[error("manual open already {}", .0.as_str())]
    TriggerBusy(Phase),

    #[error("name and access code are required")]
    IncompleteUser,
}

/// Handle to a mounted dashboard. The core runs on its own thread until
/// `unmount()` or until the handle is dropped.
pub struct Interface {
    commands: channel::Sender<Command>,
    view: Arc<RwLock<DashboardView>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Interface {
    /// Mounts a dashboard over the given API and optional push transport.
    /// Lifecycle events are sent to `status_queue` if given.
    pub fn mount(
        config: &Config,
        api: Arc<dyn AccessApi>,
        transport: Option<Box<dyn PushTransport>>,
        status_queue: Option<channel::Sender<Event>>,
    ) -> Result<Interface, InterfaceError> {
        config.validate()?;
        let (command_sender, command_receiver) = channel::unbounded::<Command>();
        let view = Arc::new(RwLock::new(DashboardView::default()));
        let mut core = DashboardCore::new(
            config,
            api,
            transport.map(LiveChannel::new),
            command_receiver,
            status_queue,
            view.clone(),
        );
        let thread = thread::Builder::new()
            .name("dashboard-core".to_string())
            .spawn(move || core.run())?;
        Ok(Interface {
            commands: command_sender,
            view,
            thread: Some(thread),
        })
    }

    /// Mounts a dashboard talking HTTP to `config.api_url`, with a TCP push
    /// channel to `config.push_addr` when set.
    pub fn connect(
        config: &Config,
        status_queue: Option<channel::Sender<Event>>,
    ) -> Result<Interface, InterfaceError> {
        config.validate()?;
        let api = Arc::new(HttpApi::new(&config.api_url, config.request_timeout()));
        let transport = config.push_addr.as_ref().map(|addr| {
            let backoff = Backoff::new(config.reconnect_min(), config.reconnect_max());
            Box::new(TcpTransport::new(addr, backoff, config.request_timeout()))
                as Box<dyn PushTransport>
        });
        Interface::mount(config, api, transport, status_queue)
    }

    pub fn view(&self) -> DashboardView {
        match self.view.read() {
            Ok(view) => view.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn send(&self, command: Command) -> Result<(), InterfaceError> {
        self.commands
            .send(command)
            .map_err(|_| InterfaceError::CoreGone)
    }

    /// Requests a manual open of the main door. Fails fast if the published
    /// view already shows one in flight; the core rejects races on its own.
    pub fn open_door(&self) -> Result<(), InterfaceError> {
        let view = self.view();
        if view.mounted && !view.trigger_enabled {
            return Err(InterfaceError::TriggerBusy(view.phase));
        }
        self.send(Command::OpenDoor)
    }

    pub fn create_user(&self, user: NewUser) -> Result<(), InterfaceError> {
        if !user.is_complete() {
            return Err(InterfaceError::IncompleteUser);
        }
        self.send(Command::CreateUser(user))
    }

    pub fn set_user_active(&self, id: UserId, active: bool) -> Result<(), InterfaceError> {
        self.send(Command::SetUserActive(id, active))
    }

    pub fn delete_user(&self, id: UserId) -> Result<(), InterfaceError> {
        self.send(Command::DeleteUser(id))
    }

    pub fn refresh(&self) -> Result<(), InterfaceError> {
        self.send(Command::Refresh)
    }

    /// Stops timers, drops in-flight results, disconnects the push channel
    /// and waits for the core thread to exit.
    pub fn unmount(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(Command::Unmount);
            if thread.join().is_err() {
                warn!("dashboard core thread panicked");
            }
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.shutdown();
    }
}
