//! Model
//!
//! Entities exchanged with the access-control API and the push channel.
//! Field names follow the JSON shapes of the REST surface (camelCase on
//! the wire).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Door identifier used when the server does not name the door.
pub const MAIN_DOOR: &str = "main";

fn default_door_id() -> String {
    MAIN_DOOR.to_string()
}

fn default_true() -> bool {
    true
}

/// Opaque user identity, as assigned by the server.
///
/// Servers hand out either numeric or string ids; both are accepted and
/// kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Num(u64),
            Str(String),
        }
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Num(n) => UserId(n.to_string()),
            RawId::Str(s) => UserId(s),
        })
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> UserId {
        UserId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(alias = "_id")]
    pub id: UserId,
    pub name: String,
    pub access_code: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Body of `POST /users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub access_code: String,
    pub is_active: bool,
}

impl NewUser {
    pub fn new(name: &str, access_code: &str) -> NewUser {
        NewUser {
            name: name.trim().to_string(),
            access_code: access_code.trim().to_string(),
            is_active: true,
        }
    }

    /// Both the name and the access code are required.
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.access_code.trim().is_empty()
    }
}

/// Body of `PUT /users/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub is_active: bool,
}

/// Payload identifying a user by id only (deletions).
#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    #[serde(alias = "_id")]
    pub id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessStatus {
    NormalGrant,
    NormalDeny,
    ManualOpen,
    Unauthorized,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::NormalGrant => "normal-grant",
            AccessStatus::NormalDeny => "normal-deny",
            AccessStatus::ManualOpen => "manual-open",
            AccessStatus::Unauthorized => "unauthorized",
        }
    }
}

/// One access attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub access_code: String,
    #[serde(default = "default_door_id")]
    pub door_id: String,
    pub granted: bool,
    pub status: AccessStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Dedup key of an access log entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogKey {
    pub timestamp: DateTime<Utc>,
    pub access_code: String,
    pub door_id: String,
}

impl AccessLogEntry {
    pub fn key(&self) -> LogKey {
        LogKey {
            timestamp: self.timestamp,
            access_code: self.access_code.clone(),
            door_id: self.door_id.clone(),
        }
    }

    /// Name of the person behind the attempt, "unknown" for unrecognized codes.
    pub fn subject(&self) -> &str {
        self.user_name.as_deref().unwrap_or("unknown")
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == AccessStatus::Unauthorized
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorStatus {
    #[serde(default = "default_door_id")]
    pub door_id: String,
    pub is_open: bool,
    pub last_event_ts: DateTime<Utc>,
}

/// Aggregate counters computed by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    pub total_users: u64,
    pub active_users: u64,
    pub total_accesses: u64,
    pub granted_accesses: u64,
    pub denied_accesses: u64,
    pub unauthorized_attempts: u64,
}

/// Body of `POST /doors/open/manual`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOpenRequest<'a> {
    pub admin_name: &'a str,
}

/// Reply of `POST /doors/open/manual`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualOpenReply {
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Connectivity of a link, as mirrored from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Error => "error",
        }
    }
}

/// Display-only health of the push channel (`transport`) and of the
/// upstream relay behind it (`relay`, unknown until first reported).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHealth {
    pub transport: LinkState,
    pub relay: Option<LinkState>,
}

impl Default for LinkHealth {
    fn default() -> Self {
        LinkHealth {
            transport: LinkState::Disconnected,
            relay: None,
        }
    }
}
