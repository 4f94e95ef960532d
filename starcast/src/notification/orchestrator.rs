//! Sole consumer of the delivery queue: turns an [`Event`] into a
//! [`NotificationPayload`] and hands it to the fanout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use github_api::RepoSnapshot;
use tracing::{debug, info, warn};

use super::fanout::DestinationFanout;
use super::format;
use super::{ActionLink, NotificationPayload};
use crate::database::models::{DestinationSet, FeatureFlag};
use crate::database::repositories::SettingsRepository;
use crate::enrichment::EnrichmentClient;
use crate::events::{Event, EventKind};
use crate::github::RepoSource;
use crate::media::{MediaItem, MediaSource, extract_media_urls};
use crate::queue::EventHandler;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pause between the summary and media-selection calls.
    pub enrichment_call_gap: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enrichment_call_gap: Duration::from_secs(2),
        }
    }
}

pub struct NotificationOrchestrator {
    source: Arc<dyn RepoSource>,
    settings: Arc<dyn SettingsRepository>,
    enrichment: Option<Arc<dyn EnrichmentClient>>,
    media: Arc<dyn MediaSource>,
    fanout: Arc<DestinationFanout>,
    config: OrchestratorConfig,
}

impl NotificationOrchestrator {
    pub fn new(
        source: Arc<dyn RepoSource>,
        settings: Arc<dyn SettingsRepository>,
        media: Arc<dyn MediaSource>,
        fanout: Arc<DestinationFanout>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            source,
            settings,
            enrichment: None,
            media,
            fanout,
            config,
        }
    }

    pub fn with_enrichment(mut self, enrichment: Arc<dyn EnrichmentClient>) -> Self {
        self.enrichment = Some(enrichment);
        self
    }

    /// `None` when there is nothing to send: no destinations, an unknown
    /// repository, or a release event without a release.
    pub async fn build_payload(&self, event: &Event) -> Result<Option<NotificationPayload>> {
        let set = match event.kind {
            EventKind::Star => DestinationSet::Star,
            EventKind::Release => DestinationSet::Release,
        };
        let destinations = self.settings.destinations(set).await?;
        if destinations.is_empty() {
            debug!(event = %event, "No destinations configured, skipping");
            return Ok(None);
        }

        let (owner, name) = split_repo(&event.repo)?;
        let Some(snapshot) = self.source.repo_snapshot(owner, name).await? else {
            warn!(repo = %event.repo, "Repository not found, dropping event");
            return Ok(None);
        };

        let payload = match event.kind {
            EventKind::Star => Some(self.star_payload(destinations, &snapshot).await?),
            EventKind::Release => self.release_payload(destinations, &snapshot).await,
        };
        Ok(payload)
    }

    async fn star_payload(
        &self,
        destinations: Vec<String>,
        snapshot: &RepoSnapshot,
    ) -> Result<NotificationPayload> {
        let (owner, name) = split_repo(&snapshot.name_with_owner)?;
        let readme = match self.source.readme(owner, name).await {
            Ok(readme) => readme,
            Err(e) => {
                debug!(repo = %snapshot.name_with_owner, error = %e, "README unavailable");
                None
            }
        };

        let mut summary = None;
        let mut selected = Vec::new();
        if let (Some(enrichment), Some(readme)) = (&self.enrichment, readme.as_deref()) {
            let mut called = false;
            if self.settings.feature_enabled(FeatureFlag::Summary).await? {
                summary = enrichment.summarize(readme).await;
                called = true;
            }

            if self.settings.feature_enabled(FeatureFlag::MediaSelection).await? {
                let candidates =
                    extract_media_urls(readme, &snapshot.name_with_owner, &snapshot.default_branch);
                if !candidates.is_empty() {
                    if called && !self.config.enrichment_call_gap.is_zero() {
                        tokio::time::sleep(self.config.enrichment_call_gap).await;
                    }
                    selected = enrichment.select_media(readme, &candidates).await;
                }
            }
        }

        let media = self.media.resolve_or_preview(&selected, &snapshot.url).await;
        Ok(NotificationPayload {
            destinations,
            caption: format::repository_preview(snapshot, summary.as_deref()),
            media,
            action_link: None,
        })
    }

    async fn release_payload(
        &self,
        destinations: Vec<String>,
        snapshot: &RepoSnapshot,
    ) -> Option<NotificationPayload> {
        let Some(release) = snapshot.latest_release() else {
            warn!(repo = %snapshot.name_with_owner, "Release event without a release, dropping");
            return None;
        };

        let media = self
            .media
            .social_preview(&release.url)
            .await
            .map(MediaItem::photo)
            .into_iter()
            .collect();

        Some(NotificationPayload {
            destinations,
            caption: format::release_notification(snapshot, release),
            media,
            action_link: Some(ActionLink {
                label: "View Release".to_string(),
                url: release.url.clone(),
            }),
        })
    }
}

#[async_trait]
impl EventHandler for NotificationOrchestrator {
    async fn handle(&self, event: &Event) -> Result<()> {
        let Some(payload) = self.build_payload(event).await? else {
            return Ok(());
        };

        let report = self.fanout.deliver(&payload).await;
        info!(
            event = %event,
            delivered = report.delivered,
            failed = report.failed,
            removed = report.removed.len(),
            "Notification sent"
        );
        Ok(())
    }
}

fn split_repo(repo: &str) -> Result<(&str, &str)> {
    repo.split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
        .ok_or_else(|| Error::validation(format!("invalid repository name '{repo}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeMessenger, FakeSource, MockSettings};
    use github_api::Release;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeMedia {
        resolved: Mutex<Vec<Vec<String>>>,
        media: Vec<MediaItem>,
        preview: Option<String>,
    }

    #[async_trait]
    impl MediaSource for FakeMedia {
        async fn resolve(&self, candidates: &[String]) -> Vec<MediaItem> {
            self.resolved.lock().await.push(candidates.to_vec());
            if candidates.is_empty() {
                Vec::new()
            } else {
                self.media.clone()
            }
        }

        async fn social_preview(&self, _page_url: &str) -> Option<String> {
            self.preview.clone()
        }
    }

    #[derive(Default)]
    struct FakeEnrichment {
        calls: Mutex<Vec<(&'static str, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl EnrichmentClient for FakeEnrichment {
        async fn summarize(&self, _readme: &str) -> Option<String> {
            self.calls
                .lock()
                .await
                .push(("summarize", tokio::time::Instant::now()));
            Some("An AI summary".into())
        }

        async fn select_media(&self, _readme: &str, candidates: &[String]) -> Vec<String> {
            self.calls
                .lock()
                .await
                .push(("select_media", tokio::time::Instant::now()));
            candidates.iter().take(1).cloned().collect()
        }
    }

    const README: &str = "# Tool\n\nA long enough README to be summarized by the model.\n\n![ui](docs/ui.png)\n";

    struct Harness {
        source: Arc<FakeSource>,
        settings: Arc<MockSettings>,
        messenger: Arc<FakeMessenger>,
        media: Arc<FakeMedia>,
        enrichment: Arc<FakeEnrichment>,
    }

    impl Harness {
        async fn new(media: FakeMedia) -> Self {
            let source = Arc::new(FakeSource::default());
            source
                .add_snapshot(RepoSnapshot {
                    name_with_owner: "acme/tool".into(),
                    url: "https://github.com/acme/tool".into(),
                    default_branch: "main".into(),
                    description: Some("A tool".into()),
                    ..Default::default()
                })
                .await;
            source.set_readme("acme/tool", README).await;

            let settings = Arc::new(MockSettings::default());
            settings.add_destination(DestinationSet::Star, "-1").await.unwrap();
            settings.add_destination(DestinationSet::Release, "-2").await.unwrap();

            Self {
                source,
                settings,
                messenger: Arc::new(FakeMessenger::default()),
                media: Arc::new(media),
                enrichment: Arc::new(FakeEnrichment::default()),
            }
        }

        fn orchestrator(&self, gap: Duration) -> NotificationOrchestrator {
            let fanout = Arc::new(DestinationFanout::new(
                self.messenger.clone(),
                self.settings.clone(),
            ));
            NotificationOrchestrator::new(
                self.source.clone(),
                self.settings.clone(),
                self.media.clone(),
                fanout,
                OrchestratorConfig {
                    enrichment_call_gap: gap,
                },
            )
            .with_enrichment(self.enrichment.clone())
        }
    }

    #[tokio::test]
    async fn star_payload_uses_summary_and_selected_media() {
        let h = Harness::new(FakeMedia {
            media: vec![MediaItem::photo("https://raw.githubusercontent.com/acme/tool/main/docs/ui.png")],
            ..Default::default()
        })
        .await;

        let payload = h
            .orchestrator(Duration::ZERO)
            .build_payload(&Event::star("acme/tool"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(payload.destinations, vec!["-1"]);
        assert!(payload.caption.contains("An AI summary"));
        assert_eq!(payload.media.len(), 1);
        assert!(payload.action_link.is_none());
        assert_eq!(
            h.media.resolved.lock().await[0],
            vec!["https://raw.githubusercontent.com/acme/tool/main/docs/ui.png"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enrichment_calls_are_spaced() {
        let h = Harness::new(FakeMedia::default()).await;
        let gap = Duration::from_secs(2);

        h.orchestrator(gap)
            .build_payload(&Event::star("acme/tool"))
            .await
            .unwrap();

        let calls = h.enrichment.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "summarize");
        assert!(calls[1].1 - calls[0].1 >= gap);
    }

    #[tokio::test]
    async fn disabled_flags_skip_enrichment() {
        let h = Harness::new(FakeMedia {
            preview: Some("https://opengraph.githubassets.com/x".into()),
            ..Default::default()
        })
        .await;
        h.settings.set_feature_enabled(FeatureFlag::Summary, false).await.unwrap();
        h.settings
            .set_feature_enabled(FeatureFlag::MediaSelection, false)
            .await
            .unwrap();

        let payload = h
            .orchestrator(Duration::ZERO)
            .build_payload(&Event::star("acme/tool"))
            .await
            .unwrap()
            .unwrap();

        assert!(h.enrichment.calls.lock().await.is_empty());
        assert!(payload.caption.contains("A tool"));
        assert_eq!(payload.media, vec![MediaItem::photo("https://opengraph.githubassets.com/x")]);
    }

    #[tokio::test]
    async fn no_media_at_all_falls_back_to_text() {
        let h = Harness::new(FakeMedia::default()).await;
        h.orchestrator(Duration::ZERO)
            .handle(&Event::star("acme/tool"))
            .await
            .unwrap();

        let calls = h.messenger.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "send_text");
        assert_eq!(calls[0].dest, "-1");
    }

    #[tokio::test]
    async fn release_payload_has_button_and_preview() {
        let h = Harness::new(FakeMedia {
            preview: Some("https://opengraph.githubassets.com/rel".into()),
            ..Default::default()
        })
        .await;
        h.source
            .add_snapshot(RepoSnapshot {
                name_with_owner: "acme/tool".into(),
                url: "https://github.com/acme/tool".into(),
                releases: vec![Release {
                    id: "rel_2".into(),
                    tag_name: "v2.0.0".into(),
                    url: "https://github.com/acme/tool/releases/tag/v2.0.0".into(),
                    description: None,
                    published_at: None,
                }],
                ..Default::default()
            })
            .await;

        let payload = h
            .orchestrator(Duration::ZERO)
            .build_payload(&Event::release("acme/tool"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(payload.destinations, vec!["-2"]);
        assert!(payload.caption.contains("v2.0.0"));
        assert_eq!(
            payload.action_link,
            Some(ActionLink {
                label: "View Release".into(),
                url: "https://github.com/acme/tool/releases/tag/v2.0.0".into(),
            })
        );
        assert_eq!(payload.media.len(), 1);
    }

    #[tokio::test]
    async fn release_event_without_release_is_dropped() {
        let h = Harness::new(FakeMedia::default()).await;
        let payload = h
            .orchestrator(Duration::ZERO)
            .build_payload(&Event::release("acme/tool"))
            .await
            .unwrap();
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn empty_destinations_skip_all_work() {
        let h = Harness::new(FakeMedia::default()).await;
        h.settings.remove_destination(DestinationSet::Star, "-1").await.unwrap();

        let payload = h
            .orchestrator(Duration::ZERO)
            .build_payload(&Event::star("acme/tool"))
            .await
            .unwrap();

        assert!(payload.is_none());
        assert_eq!(h.source.snapshot_calls().await, 0);
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_only_this_event() {
        let h = Harness::new(FakeMedia::default()).await;
        h.source.fail_repo("acme/tool").await;

        let orchestrator = h.orchestrator(Duration::ZERO);
        assert!(orchestrator.handle(&Event::star("acme/tool")).await.is_err());
        assert!(orchestrator.handle(&Event::star("acme/missing")).await.is_ok());
        assert!(h.messenger.calls().await.is_empty());
    }
}
