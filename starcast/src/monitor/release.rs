use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{PollCycle, monitoring_enabled};
use crate::Result;
use crate::database::models::MonitorKind;
use crate::database::repositories::SettingsRepository;
use crate::events::Event;
use crate::github::RepoSource;
use crate::queue::DeliveryQueue;

/// Outcome of comparing one repository's latest release with the stored id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Baselined,
    Released,
    Unchanged,
}

/// Watches the tracked star list for newly published releases.
pub struct ReleaseMonitor {
    source: Arc<dyn RepoSource>,
    settings: Arc<dyn SettingsRepository>,
    queue: DeliveryQueue,
}

impl ReleaseMonitor {
    pub fn new(
        source: Arc<dyn RepoSource>,
        settings: Arc<dyn SettingsRepository>,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            source,
            settings,
            queue,
        }
    }

    async fn check_repo(&self, repo: &str, latest: &str) -> Result<Check> {
        match self.settings.release_id(repo).await? {
            None => {
                self.settings.set_release_id(repo, latest).await?;
                debug!(repo = %repo, release_id = %latest, "Release baseline stored");
                Ok(Check::Baselined)
            }
            Some(stored) if stored != latest => {
                info!(repo = %repo, release_id = %latest, "New release detected");
                self.queue.push(Event::release(repo))?;
                self.settings.set_release_id(repo, latest).await?;
                Ok(Check::Released)
            }
            Some(_) => Ok(Check::Unchanged),
        }
    }
}

#[async_trait]
impl PollCycle for ReleaseMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Releases
    }

    async fn run_cycle(&self) -> Result<()> {
        let Some(slug) = self.settings.tracked_list().await? else {
            debug!("No tracked list configured, skipping release cycle");
            return Ok(());
        };
        if !monitoring_enabled(self.settings.as_ref()).await? {
            return Ok(());
        }

        let login = self.source.viewer_login().await?;
        let members = self.source.list_members(&login, &slug).await?;
        if members.is_empty() {
            debug!(list = %slug, "Tracked list is empty");
            return Ok(());
        }

        let latest = self.source.latest_release_ids(&members).await?;
        debug!(
            list = %slug,
            members = members.len(),
            with_releases = latest.len(),
            "Checking releases"
        );

        let checks = latest
            .iter()
            .map(|(repo, id)| async move { (repo, self.check_repo(repo, id).await) });

        let mut released = 0usize;
        for (repo, outcome) in join_all(checks).await {
            match outcome {
                Ok(Check::Released) => released += 1,
                Ok(_) => {}
                Err(e) => warn!(repo = %repo, error = %e, "Release check failed"),
            }
        }
        if released > 0 {
            info!(count = released, "Queued release notifications");
        }
        Ok(())
    }
}
