//! Process configuration loaded from the environment.
//!
//! Static values live here. Anything the operator can change at runtime
//! (intervals, digest mode, destinations, flags) is read through the
//! settings repository on every cycle instead.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::settings::{DigestMode, MIN_INTERVAL, SettingsAction};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:starcast.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Gemini endpoint settings. Absent when no API key is configured.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: Option<String>,
}

/// Values applied through the settings controller at startup.
#[derive(Debug, Clone, Default)]
pub struct BootstrapSettings {
    pub github_token: Option<String>,
    pub star_destinations: Vec<String>,
    pub release_destinations: Vec<String>,
    pub tracked_list: Option<String>,
    pub digest_mode: Option<DigestMode>,
}

impl BootstrapSettings {
    /// Settings actions equivalent to this bootstrap block, in apply order.
    pub fn actions(&self) -> Vec<SettingsAction> {
        let mut actions = Vec::new();
        if let Some(token) = &self.github_token {
            actions.push(SettingsAction::SetToken(token.clone()));
        }
        for dest in &self.star_destinations {
            actions.push(SettingsAction::AddStarDestination(dest.clone()));
        }
        for dest in &self.release_destinations {
            actions.push(SettingsAction::AddReleaseDestination(dest.clone()));
        }
        if let Some(slug) = &self.tracked_list {
            actions.push(SettingsAction::SetTrackedCollection(slug.clone()));
        }
        if let Some(mode) = self.digest_mode {
            actions.push(SettingsAction::SetDigestMode(mode));
        }
        actions
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_token: String,
    pub database_url: String,
    pub log_dir: PathBuf,
    pub log_channel_id: Option<String>,
    pub gemini: Option<GeminiConfig>,
    pub github_api_base: Option<String>,
    pub github_graphql_api: Option<String>,
    pub telegram_api_base: Option<String>,
    pub request_timeout: Duration,
    pub default_stars_interval: Duration,
    pub default_release_interval: Duration,
    pub enrichment_max_attempts: u32,
    pub enrichment_backoff_base: f64,
    pub queue_item_delay: Duration,
    pub enrichment_call_gap: Duration,
    /// Timezone the digest cron jobs are evaluated in.
    pub digest_timezone: Tz,
    pub secret_key: Option<String>,
    pub secret_key_file: Option<PathBuf>,
    pub bootstrap: BootstrapSettings,
}

impl AppConfig {
    /// Load from the process environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_token = get("BOT_TOKEN").ok_or_else(|| Error::config("BOT_TOKEN is required"))?;

        let gemini = get("GEMINI_API_KEY").map(|api_key| GeminiConfig {
            api_key,
            model: get("GEMINI_MODEL_NAME").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            api_base: get("GEMINI_API_BASE"),
        });

        let request_timeout = Duration::from_secs(parse_or(&get, "REQUEST_TIMEOUT_SECS", 60u64)?);
        let default_stars_interval = monitor_interval(&get, "DEFAULT_STARS_MONITOR_INTERVAL", 600)?;
        let default_release_interval =
            monitor_interval(&get, "DEFAULT_RELEASE_MONITOR_INTERVAL", 3600)?;

        let enrichment_max_attempts = parse_or(&get, "ENRICHMENT_MAX_ATTEMPTS", 5u32)?;
        if enrichment_max_attempts == 0 {
            return Err(Error::config("ENRICHMENT_MAX_ATTEMPTS must be at least 1"));
        }
        let enrichment_backoff_base = parse_or(&get, "ENRICHMENT_BACKOFF_BASE_SECS", 2.0f64)?;
        if !enrichment_backoff_base.is_finite() || enrichment_backoff_base < 1.0 {
            return Err(Error::config("ENRICHMENT_BACKOFF_BASE_SECS must be >= 1.0"));
        }

        let digest_mode = get("DIGEST_MODE")
            .map(|v| {
                DigestMode::from_str(&v)
                    .map_err(|_| Error::config(format!("Invalid DIGEST_MODE: {v}")))
            })
            .transpose()?;

        let digest_timezone = match get("DIGEST_TIMEZONE") {
            Some(raw) => raw
                .parse::<Tz>()
                .map_err(|_| Error::config(format!("'{raw}' is not a valid IANA timezone")))?,
            None => chrono_tz::UTC,
        };

        Ok(Self {
            bot_token,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: PathBuf::from(get("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
            log_channel_id: get("LOG_CHANNEL_ID"),
            gemini,
            github_api_base: get("GITHUB_API_BASE"),
            github_graphql_api: get("GITHUB_GRAPHQL_API"),
            telegram_api_base: get("TELEGRAM_API_BASE"),
            request_timeout,
            default_stars_interval,
            default_release_interval,
            enrichment_max_attempts,
            enrichment_backoff_base,
            queue_item_delay: Duration::from_secs(parse_or(&get, "QUEUE_ITEM_DELAY_SECS", 5u64)?),
            enrichment_call_gap: Duration::from_secs(parse_or(
                &get,
                "ENRICHMENT_CALL_GAP_SECS",
                2u64,
            )?),
            digest_timezone,
            secret_key: get("SECRET_KEY"),
            secret_key_file: get("SECRET_KEY_FILE").map(PathBuf::from),
            bootstrap: BootstrapSettings {
                github_token: get("GITHUB_TOKEN"),
                star_destinations: split_list(get("STAR_DESTINATIONS")),
                release_destinations: split_list(get("RELEASE_DESTINATIONS")),
                tracked_list: get("TRACKED_LIST"),
                digest_mode,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::config(format!("{key} must be a valid number, got '{raw}'"))),
        None => Ok(default),
    }
}

fn monitor_interval<G>(get: &G, key: &str, default_secs: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let interval = Duration::from_secs(parse_or(get, key, default_secs)?);
    if interval < MIN_INTERVAL {
        return Err(Error::config(format!(
            "{key} must be at least {}s, got {}s",
            MIN_INTERVAL.as_secs(),
            interval.as_secs()
        )));
    }
    Ok(interval)
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
