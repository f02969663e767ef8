use super::{AccessApi, CommandError, FetchError};
use crate::model::{
    AccessLogEntry, DoorStatus, ManualOpenReply, ManualOpenRequest, NewUser, Stats, User,
    UserId, UserUpdate,
};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Blocking JSON client for the access-control REST API.
pub struct HttpApi {
    base_url: String,
    agent: ureq::Agent,
}

/// Error body returned with 4xx responses.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpApi {
    /// `base_url` is the API root, e.g. `http://localhost:3000/api`.
    pub fn new(base_url: &str, timeout: Duration) -> HttpApi {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("doorwatch/", env!("CARGO_PKG_VERSION")))
            .build();
        HttpApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        debug!(path, "GET");
        let resp = self
            .agent
            .get(&self.url(path))
            .set("Accept", "application/json")
            .call()
            .map_err(fetch_error)?;
        resp.into_json::<T>()
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(resp: ureq::Response) -> Result<T, CommandError> {
        resp.into_json::<T>()
            .map_err(|e| CommandError::Fetch(FetchError::Decode(e.to_string())))
    }
}

fn fetch_error(err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(code, _) => FetchError::Status(code),
        ureq::Error::Transport(transport) => FetchError::Transport(transport.to_string()),
    }
}

/// 4xx responses carry the server's reason; everything else is a fetch failure.
fn command_error(err: ureq::Error) -> CommandError {
    match err {
        ureq::Error::Status(code, resp) if (400..500).contains(&code) => {
            let reason = resp
                .into_json::<ErrorBody>()
                .ok()
                .and_then(|body| body.error.or(body.reason).or(body.message))
                .unwrap_or_else(|| format!("request rejected with status {}", code));
            CommandError::Rejected(reason)
        }
        other => CommandError::Fetch(fetch_error(other)),
    }
}

impl AccessApi for HttpApi {
    fn users(&self) -> Result<Vec<User>, FetchError> {
        self.get("/users")
    }

    fn create_user(&self, user: &NewUser) -> Result<User, CommandError> {
        let resp = self
            .agent
            .post(&self.url("/users"))
            .send_json(user)
            .map_err(command_error)?;
        Self::decode(resp)
    }

    fn set_user_active(&self, id: &UserId, active: bool) -> Result<User, CommandError> {
        let resp = self
            .agent
            .put(&self.url(&format!("/users/{}", id)))
            .send_json(UserUpdate { is_active: active })
            .map_err(command_error)?;
        Self::decode(resp)
    }

    fn delete_user(&self, id: &UserId) -> Result<(), CommandError> {
        self.agent
            .delete(&self.url(&format!("/users/{}", id)))
            .call()
            .map_err(command_error)?;
        Ok(())
    }

    fn access_logs(&self, limit: usize) -> Result<Vec<AccessLogEntry>, FetchError> {
        self.get(&format!("/access/logs?limit={}", limit))
    }

    fn unauthorized_access(&self, limit: usize) -> Result<Vec<AccessLogEntry>, FetchError> {
        self.get(&format!("/access/unauthorized?limit={}", limit))
    }

    fn door_status(&self) -> Result<DoorStatus, FetchError> {
        self.get("/doors/status/realtime")
    }

    fn open_door(&self, admin_name: &str) -> Result<(), CommandError> {
        let resp = self
            .agent
            .post(&self.url("/doors/open/manual"))
            .send_json(ManualOpenRequest { admin_name })
            .map_err(command_error)?;
        let reply: ManualOpenReply = Self::decode(resp)?;
        if reply.success {
            Ok(())
        } else {
            Err(CommandError::Rejected(
                reply.reason.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    fn stats(&self) -> Result<Stats, FetchError> {
        self.get("/stats")
    }
}
