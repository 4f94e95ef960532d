//! Repository layer for database access.

pub mod settings;

pub use settings::{SettingsRepository, SqlxSettingsRepository};
