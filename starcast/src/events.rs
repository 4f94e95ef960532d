//! Events flowing from the monitors and the digest scheduler to the consumer.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Star,
    Release,
}

/// A repository that needs a notification. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// `owner/name`.
    pub repo: String,
}

impl Event {
    pub fn star(repo: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Star,
            repo: repo.into(),
        }
    }

    pub fn release(repo: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Release,
            repo: repo.into(),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.repo)
    }
}
