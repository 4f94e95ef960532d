use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{PollCycle, monitoring_enabled};
use crate::Result;
use crate::database::models::{DigestMode, MonitorKind};
use crate::database::repositories::SettingsRepository;
use crate::events::Event;
use crate::github::RepoSource;
use crate::queue::DeliveryQueue;

/// Detects repositories starred since the last successful cycle.
///
/// The first cycle only records a baseline so existing stars are never
/// announced.
pub struct StarMonitor {
    source: Arc<dyn RepoSource>,
    settings: Arc<dyn SettingsRepository>,
    queue: DeliveryQueue,
}

impl StarMonitor {
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
}

#[async_trait]
impl PollCycle for StarMonitor {
    fn kind(&self) -> MonitorKind {
        MonitorKind::Stars
    }

    async fn run_cycle(&self) -> Result<()> {
        if !monitoring_enabled(self.settings.as_ref()).await? {
            return Ok(());
        }

        let events = self.source.starred_events().await?;
        let Some(newest) = events.iter().map(|e| e.starred_at).max() else {
            debug!("Starred feed is empty");
            return Ok(());
        };

        let Some(marker) = self.settings.star_marker().await? else {
            self.settings.advance_star_marker(newest).await?;
            info!(baseline = %newest, "First run for stars, baseline established");
            return Ok(());
        };

        let mut fresh: Vec<_> = events
            .into_iter()
            .filter(|e| e.starred_at > marker)
            .collect();
        if fresh.is_empty() {
            debug!("No new starred repositories");
            return Ok(());
        }
        fresh.sort_by_key(|e| e.starred_at);
        info!(count = fresh.len(), "Found new starred repositories");

        let mode = self.settings.digest_mode().await?;
        for event in &fresh {
            let repo = event.full_name();
            match mode {
                DigestMode::Off => {
                    info!(repo = %repo, "Queueing star for instant notification");
                    self.queue.push(Event::star(repo))?;
                }
                DigestMode::Daily | DigestMode::Weekly => {
                    let added = self.settings.digest_add(repo).await?;
                    info!(repo = %repo, mode = %mode, added, "Added star to digest queue");
                }
            }
        }

        self.settings.advance_star_marker(newest).await?;
        Ok(())
    }
}
