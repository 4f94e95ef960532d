//! Point-in-time status of the running bot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use github_api::RateLimit;
use tracing::warn;

use crate::Result;
use crate::database::models::{DestinationSet, DigestMode, FeatureFlag, MonitorKind};
use crate::database::repositories::SettingsRepository;
use crate::github::RepoSource;
use crate::utils::text::escape_html;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub uptime: Duration,
    pub paused: bool,
    pub token_present: bool,
    /// Account the token belongs to; `None` without a token or when GitHub
    /// could not be reached.
    pub github_login: Option<String>,
    pub rate_limit: Option<RateLimit>,
    /// Whether an enrichment backend is configured at all.
    pub ai_configured: bool,
    pub summary_enabled: bool,
    pub media_selection_enabled: bool,
    pub stars_interval: Duration,
    pub release_interval: Duration,
    pub digest_mode: DigestMode,
    pub digest_queue_size: u64,
    pub next_digest_run: Option<DateTime<Utc>>,
    pub star_destinations: usize,
    pub release_destinations: usize,
    pub tracked_list: Option<String>,
    pub pending_events: usize,
}

/// Values that live outside the settings store.
#[derive(Debug, Clone)]
pub struct RuntimeFacts {
    pub started_at: DateTime<Utc>,
    pub default_stars_interval: Duration,
    pub default_release_interval: Duration,
    pub next_digest_run: Option<DateTime<Utc>>,
    pub pending_events: usize,
    pub ai_configured: bool,
}

impl StatusReport {
    pub async fn collect(
        settings: &dyn SettingsRepository,
        source: &dyn RepoSource,
        facts: RuntimeFacts,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let digest_mode = settings.digest_mode().await?;
        let token_present = settings.has_token().await?;
        let (github_login, rate_limit) = if token_present {
            github_account(source).await
        } else {
            (None, None)
        };
        Ok(Self {
            uptime: (now - facts.started_at).to_std().unwrap_or_default(),
            paused: settings.is_paused().await?,
            token_present,
            github_login,
            rate_limit,
            ai_configured: facts.ai_configured,
            summary_enabled: settings.feature_enabled(FeatureFlag::Summary).await?,
            media_selection_enabled: settings.feature_enabled(FeatureFlag::MediaSelection).await?,
            stars_interval: settings
                .interval(MonitorKind::Stars)
                .await?
                .unwrap_or(facts.default_stars_interval),
            release_interval: settings
                .interval(MonitorKind::Releases)
                .await?
                .unwrap_or(facts.default_release_interval),
            digest_mode,
            digest_queue_size: settings.digest_count().await?,
            // A schedule is only meaningful while digests are on.
            next_digest_run: facts.next_digest_run.filter(|_| digest_mode != DigestMode::Off),
            star_destinations: settings.destinations(DestinationSet::Star).await?.len(),
            release_destinations: settings.destinations(DestinationSet::Release).await?.len(),
            tracked_list: settings.tracked_list().await?,
            pending_events: facts.pending_events,
        })
    }

    /// Telegram HTML.
    pub fn render_html(&self) -> String {
        let state = if self.paused { "⏸️ Paused" } else { "▶️ Running" };
        let token = match (&self.github_login, self.token_present) {
            (Some(login), _) => format!("✅ {}", escape_html(login)),
            (None, true) => "⚠️ Set, not verified".to_string(),
            (None, false) => "❌ Missing".to_string(),
        };
        let rate_limit = self
            .rate_limit
            .as_ref()
            .map(|r| {
                format!(
                    "{}/{} (resets {})",
                    r.remaining,
                    r.limit,
                    r.reset_at.format("%H:%M UTC")
                )
            })
            .unwrap_or_else(|| "n/a".to_string());
        let ai = if !self.ai_configured {
            "disabled (no API key)".to_string()
        } else {
            format!(
                "summary {}, media selection {}",
                on_off(self.summary_enabled),
                on_off(self.media_selection_enabled)
            )
        };
        let next_digest = self
            .next_digest_run
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let tracked = self
            .tracked_list
            .as_deref()
            .map(escape_html)
            .unwrap_or_else(|| "None".to_string());

        [
            "<b>📊 Bot Status</b>".to_string(),
            String::new(),
            format!("<b>State:</b> {state}"),
            format!("<b>Uptime:</b> {}", human_duration(self.uptime)),
            format!("<b>GitHub token:</b> {token}"),
            format!("<b>API rate limit:</b> {rate_limit}"),
            format!("<b>AI features:</b> {ai}"),
            format!(
                "<b>Intervals:</b> stars {}, releases {}",
                human_duration(self.stars_interval),
                human_duration(self.release_interval)
            ),
            format!(
                "<b>Digest:</b> {} ({} queued, next {next_digest})",
                self.digest_mode, self.digest_queue_size
            ),
            format!(
                "<b>Destinations:</b> {} star, {} release",
                self.star_destinations, self.release_destinations
            ),
            format!("<b>Tracked list:</b> {tracked}"),
            format!("<b>Pending events:</b> {}", self.pending_events),
        ]
        .join("\n")
    }
}

async fn github_account(source: &dyn RepoSource) -> (Option<String>, Option<RateLimit>) {
    let login = source
        .viewer_login()
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to fetch GitHub account for status"))
        .ok();
    let rate_limit = source
        .rate_limit()
        .await
        .inspect_err(|e| warn!(error = %e, "Failed to fetch GitHub rate limit for status"))
        .ok()
        .flatten();
    (login, rate_limit)
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{secs}s"),
        (0, 0, m) => format!("{m}m"),
        (0, h, m) => format!("{h}h {m}m"),
        (d, h, _) => format!("{d}d {h}h"),
    }
}
