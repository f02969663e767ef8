use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_API_URL: &str = "DOORWATCH_API_URL";
pub const ENV_PUSH_ADDR: &str = "DOORWATCH_PUSH_ADDR";
pub const ENV_ADMIN_NAME: &str = "DOORWATCH_ADMIN_NAME";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("fast poll interval ({fast_poll_ms} ms) must be shorter than the monitor window ({window_ms} ms)")]
    FastPollTooSlow { fast_poll_ms: u64, window_ms: u64 },

    #[error("api_url must not be empty")]
    NoApiUrl,
}

/// Dashboard settings. Every field has a default, so a partial file works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST API, without trailing slash.
    pub api_url: String,
    /// host:port of the push server. `None` disables the live channel and
    /// the dashboard runs on polling alone.
    pub push_addr: Option<String>,
    /// Name sent with manual open commands.
    pub admin_name: String,
    pub poll_interval_ms: u64,
    pub fast_poll_interval_ms: u64,
    pub monitor_window_ms: u64,
    pub notification_ttl_ms: u64,
    /// Rows requested from the access log; also the retained capacity.
    pub log_limit: usize,
    pub unauthorized_limit: usize,
    pub request_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            api_url: "http://localhost:3000/api".to_string(),
            push_addr: Some("localhost:3001".to_string()),
            admin_name: "Dashboard Administrator".to_string(),
            poll_interval_ms: 2000,
            fast_poll_interval_ms: 500,
            monitor_window_ms: 10_000,
            notification_ttl_ms: 4000,
            log_limit: 100,
            unauthorized_limit: 20,
            request_timeout_ms: 5000,
            reconnect_min_ms: 500,
            reconnect_max_ms: 10_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::NoApiUrl);
        }
        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("fast_poll_interval_ms", self.fast_poll_interval_ms),
            ("monitor_window_ms", self.monitor_window_ms),
            ("notification_ttl_ms", self.notification_ttl_ms),
            ("log_limit", self.log_limit as u64),
            ("unauthorized_limit", self.unauthorized_limit as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("reconnect_min_ms", self.reconnect_min_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.fast_poll_interval_ms >= self.monitor_window_ms {
            return Err(ConfigError::FastPollTooSlow {
                fast_poll_ms: self.fast_poll_interval_ms,
                window_ms: self.monitor_window_ms,
            });
        }
        Ok(())
    }

    /// Overrides fields from `DOORWATCH_*` environment variables. An empty
    /// `DOORWATCH_PUSH_ADDR` disables the push channel.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(addr) = var(ENV_PUSH_ADDR) {
            self.push_addr = if addr.trim().is_empty() { None } else { Some(addr) };
        }
        if let Some(name) = var(ENV_ADMIN_NAME) {
            self.admin_name = name;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fast_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fast_poll_interval_ms)
    }

    pub fn monitor_window(&self) -> Duration {
        Duration::from_millis(self.monitor_window_ms)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_millis(self.notification_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
