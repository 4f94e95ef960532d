//! starcast: watches a GitHub account for new stars and releases and
//! delivers enriched notifications to Telegram chats.

pub mod config;
pub mod database;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod github;
pub mod logging;
pub mod media;
pub mod monitor;
pub mod notification;
pub mod queue;
pub mod scheduler;
pub mod secret;
pub mod services;
pub mod settings;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
