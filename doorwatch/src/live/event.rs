use crate::model::{AccessLogEntry, LinkState, Stats, User, UserId, UserRef};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const NEW_ACCESS_LOG: &str = "new-access-log";
pub const USER_CREATED: &str = "user-created";
pub const USER_UPDATED: &str = "user-updated";
pub const USER_DELETED: &str = "user-deleted";
pub const STATS_UPDATED: &str = "stats-updated";
pub const LINK_STATUS: &str = "link-status";

/// A targeted update delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    NewAccessLog(AccessLogEntry),
    UserCreated(User),
    UserUpdated(User),
    UserDeleted(UserId),
    StatsUpdated(Stats),
    /// Health of the relay behind the push server.
    LinkStatus(LinkState),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown push event '{0}'")]
    UnknownEvent(String),

    #[error("malformed '{event}' payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct LinkStatusPayload {
    #[serde(alias = "state")]
    status: LinkState,
}

impl PushEvent {
    /// Decodes an event by name from its JSON payload.
    pub fn decode(name: &str, data: Value) -> Result<PushEvent, DecodeError> {
        fn parse<T: serde::de::DeserializeOwned>(name: &str, data: Value) -> Result<T, DecodeError> {
            serde_json::from_value(data).map_err(|source| DecodeError::Payload {
                event: name.to_string(),
                source,
            })
        }
        Ok(match name {
            NEW_ACCESS_LOG => PushEvent::NewAccessLog(parse(name, data)?),
            USER_CREATED => PushEvent::UserCreated(parse(name, data)?),
            USER_UPDATED => PushEvent::UserUpdated(parse(name, data)?),
            USER_DELETED => PushEvent::UserDeleted(parse::<UserRef>(name, data)?.id),
            STATS_UPDATED => PushEvent::StatsUpdated(parse(name, data)?),
            LINK_STATUS => PushEvent::LinkStatus(parse::<LinkStatusPayload>(name, data)?.status),
            other => return Err(DecodeError::UnknownEvent(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NewAccessLog(_) => NEW_ACCESS_LOG,
            PushEvent::UserCreated(_) => USER_CREATED,
            PushEvent::UserUpdated(_) => USER_UPDATED,
            PushEvent::UserDeleted(_) => USER_DELETED,
            PushEvent::StatsUpdated(_) => STATS_UPDATED,
            PushEvent::LinkStatus(_) => LINK_STATUS,
        }
    }
}
