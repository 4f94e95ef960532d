//! Wiring and lifecycle of the long-running services.

pub mod container;
pub mod status;

pub use container::{RunningServices, ServiceContainer};
pub use status::StatusReport;
