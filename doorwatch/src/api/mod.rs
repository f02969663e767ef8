//! API
//!
//! The REST surface of the access-control server, as consumed by the
//! dashboard. `AccessApi` is the seam: the core only talks to the server
//! through it, and `HttpApi` is the production implementation.

mod http;

pub use http::HttpApi;

use crate::model::{AccessLogEntry, DoorStatus, NewUser, Stats, User, UserId};
use std::fmt;
use thiserror::Error;

/// Failure to read from the server. Never fatal: callers keep their
/// last-known-good data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Network failures and 5xx responses are expected to clear by themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::Decode(_) => false,
        }
    }
}

/// Failure of an operator command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The server refused the command, with its own reason.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl CommandError {
    pub fn reason(&self) -> String {
        match self {
            CommandError::Rejected(reason) => reason.clone(),
            CommandError::Fetch(err) => err.to_string(),
        }
    }
}

pub trait AccessApi: Send + Sync {
    /// `GET /users`
    fn users(&self) -> Result<Vec<User>, FetchError>;
    /// `POST /users`
    fn create_user(&self, user: &NewUser) -> Result<User, CommandError>;
    /// `PUT /users/{id}`
    fn set_user_active(&self, id: &UserId, active: bool) -> Result<User, CommandError>;
    /// `DELETE /users/{id}`
    fn delete_user(&self, id: &UserId) -> Result<(), CommandError>;
    /// `GET /access/logs?limit=N`, newest first.
    fn access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>, FetchError>;
    /// `GET /access/unauthorized?limit=N`, newest first.
    fn unauthorized_access(&self, limit: usize) -> Result<Vec<AccessLogEntry>, FetchError>;
    /// `GET /doors/status/realtime`
    fn door_status(&self) -> Result<DoorStatus, FetchError>;
    /// `POST /doors/open/manual`. A `success: false` reply is a rejection.
    fn open_door(&self, admin_name: &str) -> Result<(), CommandError>;
    /// `GET /stats`
    fn stats(&self) -> Result<Stats, FetchError>;
}

/// Entity collections tracked by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Users,
    AccessLog,
    Unauthorized,
    DoorStatus,
    Stats,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Users,
        EntityKind::AccessLog,
        EntityKind::Unauthorized,
        EntityKind::DoorStatus,
        EntityKind::Stats,
    ];

    /// Entities refreshed by the periodic poll.
    pub const VOLATILE: [EntityKind; 3] = [
        EntityKind::DoorStatus,
        EntityKind::AccessLog,
        EntityKind::Unauthorized,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::AccessLog => "access log",
            EntityKind::Unauthorized => "unauthorized access",
            EntityKind::DoorStatus => "door status",
            EntityKind::Stats => "stats",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A full collection as returned by the server.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Users(Vec<User>),
    AccessLog(Vec<AccessLogEntry>),
    Unauthorized(Vec<AccessLogEntry>),
    DoorStatus(DoorStatus),
    Stats(Stats),
}

impl Snapshot {
    pub fn kind(&self) -> EntityKind {
        match self {
            Snapshot::Users(_) => EntityKind::Users,
            Snapshot::AccessLog(_) => EntityKind::AccessLog,
            Snapshot::Unauthorized(_) => EntityKind::Unauthorized,
            Snapshot::DoorStatus(_) => EntityKind::DoorStatus,
            Snapshot::Stats(_) => EntityKind::Stats,
        }
    }
}
