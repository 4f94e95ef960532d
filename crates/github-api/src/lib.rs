//! Typed GitHub client used by starcast: starred feed, repository snapshots,
//! batched release lookups and star-list membership.

pub mod client;
pub mod error;
pub mod models;
pub mod queries;

pub use client::{GitHubClient, GitHubClientConfig, RELEASE_BATCH_SIZE, StaticToken, TokenProvider};
pub use error::{Error, Result};
pub use models::{
    LanguageShare, RateLimit, Release, RepoSnapshot, StarredEvent, StarredRepo,
    split_full_name,
};
