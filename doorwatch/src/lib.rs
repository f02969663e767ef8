pub mod api;
pub mod config;
pub mod dashboard;
pub mod dashboard_core;
pub mod live;
pub mod model;
pub mod sync;

pub use config::{Config, ConfigError};
pub use dashboard::{DashboardView, Event, Interface, InterfaceError};
pub use dashboard_core::FetchCause;
