//! Value types persisted in `bot_state` and the row types of the other tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How new stars are delivered.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DigestMode {
    /// Every star is delivered right away.
    #[default]
    Off,
    Daily,
    Weekly,
}

/// The two polling monitors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum MonitorKind {
    Stars,
    Releases,
}

impl MonitorKind {
    pub(crate) fn interval_key(self) -> &'static str {
        match self {
            Self::Stars => "stars_monitor_interval",
            Self::Releases => "release_monitor_interval",
        }
    }
}

/// Toggleable enrichment features. Absent in storage means enabled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum FeatureFlag {
    Summary,
    MediaSelection,
}

impl FeatureFlag {
    pub(crate) fn state_key(self) -> &'static str {
        match self {
            Self::Summary => "ai_summary_enabled",
            Self::MediaSelection => "ai_media_selection_enabled",
        }
    }
}

/// Which destination list a target belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DestinationSet {
    Star,
    Release,
}

impl DestinationSet {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Star => "star_destinations",
            Self::Release => "release_destinations",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DigestQueueEntryDbModel {
    pub id: i64,
    pub repo_full_name: String,
    pub added_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReleaseStateDbModel {
    pub repo_full_name: String,
    pub latest_release_id: String,
    pub last_checked_at: String,
}

impl ReleaseStateDbModel {
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.last_checked_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn digest_mode_round_trips_through_strings() {
        assert_eq!(DigestMode::default(), DigestMode::Off);
        assert_eq!(DigestMode::Weekly.to_string(), "weekly");
        assert_eq!(DigestMode::from_str("Daily").unwrap(), DigestMode::Daily);
        assert!(DigestMode::from_str("monthly").is_err());
    }

    #[test]
    fn feature_flag_keys_are_distinct() {
        assert_ne!(
            FeatureFlag::Summary.state_key(),
            FeatureFlag::MediaSelection.state_key()
        );
    }
}
