use crate::api::{AccessApi, EntityKind, FetchError, Snapshot};

use std::sync::Arc;

/// Row limits requested from the list endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub log: usize,
    pub unauthorized: usize,
}

/// One-shot fetch of a full entity collection. Has no side effects: the
/// caller decides how to merge the result.
#[derive(Clone)]
pub struct Loader {
    api: Arc<dyn AccessApi>,
    limits: Limits,
}

impl Loader {
    pub fn new(api: Arc<dyn AccessApi>, limits: Limits) -> Loader {
        Loader { api, limits }
    }

    pub fn api(&self) -> &Arc<dyn AccessApi> {
        &self.api
    }

    pub fn load(&self, kind: EntityKind) -> Result<Snapshot, FetchError> {
        Ok(match kind {
            EntityKind::Users => Snapshot::Users(self.api.users()?),
            EntityKind::AccessLog => Snapshot::AccessLog(self.api.access_logs(self.limits.log)?),
            EntityKind::Unauthorized => {
                Snapshot::Unauthorized(self.api.unauthorized_access(self.limits.unauthorized)?)
            }
            EntityKind::DoorStatus => Snapshot::DoorStatus(self.api.door_status()?),
            EntityKind::Stats => Snapshot::Stats(self.api.stats()?),
        })
    }
}
