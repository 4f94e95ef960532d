//! Operator-facing settings: the closed set of actions, the controller that
//! applies them and the wake signals that restart monitor loops.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::repositories::SettingsRepository;
use crate::github::RepoSource;
use crate::notification::Destination;
use crate::{Error, Result};

pub use crate::database::models::{DestinationSet, DigestMode, FeatureFlag, MonitorKind};

/// Smallest polling interval an operator may set.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

const CALLBACK_PREFIX: &str = "cb";

/// Every runtime change an operator can make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsAction {
    TogglePause,
    ToggleSummary,
    ToggleMediaSelection,
    SetStarInterval(u64),
    SetReleaseInterval(u64),
    SetDigestMode(DigestMode),
    SetTrackedCollection(String),
    AddStarDestination(String),
    RemoveStarDestination(String),
    AddReleaseDestination(String),
    RemoveReleaseDestination(String),
    /// Resumes monitoring once the token is accepted.
    SetToken(String),
    /// Also pauses monitoring.
    RemoveToken,
}

impl SettingsAction {
    /// Decode callback data of the form `cb:<action>` or `cb:<action>:<value>`.
    pub fn parse(data: &str) -> Result<Self> {
        let mut parts = data.splitn(3, ':');
        if parts.next() != Some(CALLBACK_PREFIX) {
            return Err(Error::validation(format!("not a settings callback: {data}")));
        }
        let action = parts
            .next()
            .ok_or_else(|| Error::validation("callback without action"))?;
        let value = parts.next().map(str::trim).filter(|v| !v.is_empty());

        let need = |what: &str| {
            value
                .map(str::to_string)
                .ok_or_else(|| Error::validation(format!("{action} requires a {what}")))
        };
        let secs = || {
            need("number of seconds")?
                .parse::<u64>()
                .map_err(|_| Error::validation(format!("{action} expects whole seconds")))
        };

        Ok(match action {
            "toggle_pause" => Self::TogglePause,
            "toggle_summary" => Self::ToggleSummary,
            "toggle_media_selection" => Self::ToggleMediaSelection,
            "set_stars_interval" => Self::SetStarInterval(secs()?),
            "set_release_interval" => Self::SetReleaseInterval(secs()?),
            "set_digest" => {
                let raw = need("mode")?;
                Self::SetDigestMode(
                    DigestMode::from_str(&raw)
                        .map_err(|_| Error::validation(format!("unknown digest mode: {raw}")))?,
                )
            }
            "set_list" => Self::SetTrackedCollection(need("list slug")?),
            "add_star_dest" => Self::AddStarDestination(need("destination")?),
            "remove_star_dest" => Self::RemoveStarDestination(need("destination")?),
            "add_release_dest" => Self::AddReleaseDestination(need("destination")?),
            "remove_release_dest" => Self::RemoveReleaseDestination(need("destination")?),
            "set_token" => Self::SetToken(need("token")?),
            "remove_token" => Self::RemoveToken,
            other => return Err(Error::validation(format!("unknown settings action: {other}"))),
        })
    }

    /// Monitors whose loop should restart after this action.
    pub fn affected_monitors(&self) -> &'static [MonitorKind] {
        match self {
            Self::TogglePause | Self::SetToken(_) | Self::RemoveToken => {
                &[MonitorKind::Stars, MonitorKind::Releases]
            }
            Self::SetStarInterval(_) | Self::SetDigestMode(_) => &[MonitorKind::Stars],
            Self::SetReleaseInterval(_) | Self::SetTrackedCollection(_) => &[MonitorKind::Releases],
            Self::ToggleSummary
            | Self::ToggleMediaSelection
            | Self::AddStarDestination(_)
            | Self::RemoveStarDestination(_)
            | Self::AddReleaseDestination(_)
            | Self::RemoveReleaseDestination(_) => &[],
        }
    }
}

/// "Settings changed" broadcast for one monitor.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn wake(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> WakeReceiver {
        WakeReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct WakeReceiver {
    rx: watch::Receiver<u64>,
}

impl WakeReceiver {
    /// Resolves on the next wake. Never resolves once every sender is gone.
    pub async fn woken(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One wake signal per monitor.
#[derive(Debug, Clone, Default)]
pub struct MonitorWakers {
    pub stars: WakeSignal,
    pub releases: WakeSignal,
}

impl MonitorWakers {
    pub fn get(&self, monitor: MonitorKind) -> &WakeSignal {
        match monitor {
            MonitorKind::Stars => &self.stars,
            MonitorKind::Releases => &self.releases,
        }
    }
}

/// Checks that the bot can post to a destination before it is stored.
#[async_trait]
pub trait DestinationVerifier: Send + Sync {
    async fn verify(&self, destination: &Destination) -> Result<()>;
}

/// Applies [`SettingsAction`]s through the repository and wakes monitors.
pub struct SettingsController {
    repo: Arc<dyn SettingsRepository>,
    wakers: MonitorWakers,
    verifier: Option<Arc<dyn DestinationVerifier>>,
    token_check: Option<Arc<dyn RepoSource>>,
}

impl SettingsController {
    pub fn new(repo: Arc<dyn SettingsRepository>, wakers: MonitorWakers) -> Self {
        Self {
            repo,
            wakers,
            verifier: None,
            token_check: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DestinationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Check new tokens against GitHub. The source must read its token from
    /// the same repository this controller writes to.
    pub fn with_token_check(mut self, source: Arc<dyn RepoSource>) -> Self {
        self.token_check = Some(source);
        self
    }

    pub fn wakers(&self) -> &MonitorWakers {
        &self.wakers
    }

    pub async fn apply(&self, action: SettingsAction) -> Result<()> {
        debug!(?action, "Applying settings action");
        match &action {
            SettingsAction::TogglePause => {
                let paused = !self.repo.is_paused().await?;
                self.repo.set_paused(paused).await?;
                info!(paused, "Monitoring pause toggled");
            }
            SettingsAction::ToggleSummary => self.toggle_flag(FeatureFlag::Summary).await?,
            SettingsAction::ToggleMediaSelection => {
                self.toggle_flag(FeatureFlag::MediaSelection).await?
            }
            SettingsAction::SetStarInterval(secs) => {
                self.set_interval(MonitorKind::Stars, *secs).await?
            }
            SettingsAction::SetReleaseInterval(secs) => {
                self.set_interval(MonitorKind::Releases, *secs).await?
            }
            SettingsAction::SetDigestMode(mode) => self.repo.set_digest_mode(*mode).await?,
            SettingsAction::SetTrackedCollection(slug) => {
                let slug = slug.trim();
                if slug.is_empty() || slug.contains(['/', ' ']) {
                    return Err(Error::validation(format!("invalid list slug: '{slug}'")));
                }
                self.repo.set_tracked_list(slug).await?;
            }
            SettingsAction::AddStarDestination(raw) => {
                self.add_destination(DestinationSet::Star, raw).await?
            }
            SettingsAction::AddReleaseDestination(raw) => {
                self.add_destination(DestinationSet::Release, raw).await?
            }
            SettingsAction::RemoveStarDestination(raw) => {
                self.remove_destination(DestinationSet::Star, raw).await?
            }
            SettingsAction::RemoveReleaseDestination(raw) => {
                self.remove_destination(DestinationSet::Release, raw).await?
            }
            SettingsAction::SetToken(token) => self.set_token(token).await?,
            SettingsAction::RemoveToken => {
                self.repo.remove_token().await?;
                self.repo.set_paused(true).await?;
            }
        }

        for monitor in action.affected_monitors() {
            self.wakers.get(*monitor).wake();
        }
        Ok(())
    }

    async fn set_token(&self, raw: &str) -> Result<()> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(Error::validation("token must not be empty"));
        }
        self.repo.set_token(token).await?;

        if let Some(source) = &self.token_check {
            match source.viewer_login().await {
                Ok(login) => info!(login = %login, "GitHub token verified"),
                Err(e) => {
                    self.repo.remove_token().await?;
                    warn!(error = %e, "GitHub token rejected, removed");
                    return Err(Error::validation(format!("GitHub token rejected: {e}")));
                }
            }
        }

        self.repo.set_paused(false).await?;
        info!("GitHub token stored, monitoring resumed");
        Ok(())
    }

    async fn toggle_flag(&self, flag: FeatureFlag) -> Result<()> {
        let enabled = !self.repo.feature_enabled(flag).await?;
        self.repo.set_feature_enabled(flag, enabled).await?;
        info!(flag = %flag, enabled, "Feature flag toggled");
        Ok(())
    }

    async fn set_interval(&self, monitor: MonitorKind, secs: u64) -> Result<()> {
        let interval = Duration::from_secs(secs);
        if interval < MIN_INTERVAL {
            return Err(Error::validation(format!(
                "{monitor} interval must be at least {}s, got {secs}s",
                MIN_INTERVAL.as_secs()
            )));
        }
        self.repo.set_interval(monitor, interval).await
    }

    async fn add_destination(&self, set: DestinationSet, raw: &str) -> Result<()> {
        let destination = Destination::parse(raw)?;
        if let Some(verifier) = &self.verifier {
            verifier.verify(&destination).await?;
        }
        let added = self
            .repo
            .add_destination(set, &destination.to_string())
            .await?;
        info!(destination = %destination, set = %set, added, "Destination added");
        Ok(())
    }

    async fn remove_destination(&self, set: DestinationSet, raw: &str) -> Result<()> {
        let destination = Destination::parse(raw)?;
        let removed = self
            .repo
            .remove_destination(set, &destination.to_string())
            .await?;
        if !removed {
            return Err(Error::not_found("destination", destination.to_string()));
        }
        info!(destination = %destination, set = %set, "Destination removed");
        Ok(())
    }
}
