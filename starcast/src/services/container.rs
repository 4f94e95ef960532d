//! Service container: builds every component from [`AppConfig`] and owns
//! the lifecycle of the long-running tasks.
//!
//! Tasks run in two tiers with their own cancellation tokens. Producers (the
//! monitors and the digest scheduler) stop first, then the queue is drained,
//! then the consumer stops.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use github_api::{GitHubClient, GitHubClientConfig};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::{RuntimeFacts, StatusReport};
use crate::Result;
use crate::config::AppConfig;
use crate::database::DbPool;
use crate::database::repositories::{SettingsRepository, SqlxSettingsRepository};
use crate::enrichment::{GeminiClient, RetryPolicy};
use crate::github::{RepoSource, SettingsTokenProvider};
use crate::monitor::{ERROR_COOLDOWN, MonitorLoopConfig, PollCycle, ReleaseMonitor, StarMonitor, run_monitor};
use crate::notification::{
    Destination, DestinationFanout, NotificationOrchestrator, OrchestratorConfig,
    TelegramBotClient,
};
use crate::queue::{self, ConsumerConfig, DeliveryQueue, QueueReceiver};
use crate::scheduler::DigestScheduler;
use crate::secret::TokenCipher;
use crate::settings::{DestinationSet, MonitorWakers, SettingsAction, SettingsController};
use crate::utils::http_client::build_client;

/// Lower bound for the drain timeout when few events are pending.
const MIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ServiceContainer {
    pub settings: Arc<dyn SettingsRepository>,
    pub controller: Arc<SettingsController>,
    pub messenger: Arc<TelegramBotClient>,
    queue: DeliveryQueue,
    receiver: QueueReceiver,
    source: Arc<dyn RepoSource>,
    star_monitor: Arc<StarMonitor>,
    release_monitor: Arc<ReleaseMonitor>,
    scheduler: Arc<DigestScheduler>,
    orchestrator: Arc<NotificationOrchestrator>,
    defaults: Defaults,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Defaults {
    stars_interval: Duration,
    release_interval: Duration,
    request_timeout: Duration,
    consumer: ConsumerConfig,
    ai_configured: bool,
}

impl ServiceContainer {
    pub fn new(config: &AppConfig, pool: DbPool, cipher: TokenCipher) -> Result<Self> {
        info!("Initializing service container");

        let http = build_client(config.request_timeout)?;
        let settings: Arc<dyn SettingsRepository> =
            Arc::new(SqlxSettingsRepository::new(pool, cipher));

        let mut github_config = GitHubClientConfig {
            timeout: config.request_timeout,
            ..Default::default()
        };
        if let Some(base) = &config.github_api_base {
            github_config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(graphql) = &config.github_graphql_api {
            github_config.graphql_url = graphql.clone();
        }
        let source: Arc<dyn RepoSource> = Arc::new(GitHubClient::new(
            http.clone(),
            github_config,
            Arc::new(SettingsTokenProvider::new(settings.clone())),
        ));

        let messenger = Arc::new(TelegramBotClient::new(
            http.clone(),
            config.bot_token.clone(),
            config.telegram_api_base.as_deref(),
        ));
        let fanout = Arc::new(DestinationFanout::new(messenger.clone(), settings.clone()));

        let mut orchestrator = NotificationOrchestrator::new(
            source.clone(),
            settings.clone(),
            Arc::new(crate::media::MediaResolver::new(http.clone())),
            fanout.clone(),
            OrchestratorConfig {
                enrichment_call_gap: config.enrichment_call_gap,
            },
        );
        match &config.gemini {
            Some(gemini) => {
                let policy = RetryPolicy {
                    max_attempts: config.enrichment_max_attempts,
                    backoff_base: config.enrichment_backoff_base,
                };
                orchestrator =
                    orchestrator.with_enrichment(Arc::new(GeminiClient::new(http, gemini, policy)));
            }
            None => info!("GEMINI_API_KEY not set, AI enrichment disabled"),
        }

        let (queue, receiver) = queue::channel();
        let controller = Arc::new(
            SettingsController::new(settings.clone(), MonitorWakers::default())
                .with_verifier(fanout)
                .with_token_check(source.clone()),
        );
        let scheduler = DigestScheduler::new(settings.clone(), queue.clone())?
            .with_timezone(config.digest_timezone);

        Ok(Self {
            star_monitor: Arc::new(StarMonitor::new(source.clone(), settings.clone(), queue.clone())),
            release_monitor: Arc::new(ReleaseMonitor::new(
                source.clone(),
                settings.clone(),
                queue.clone(),
            )),
            source,
            scheduler: Arc::new(scheduler),
            orchestrator: Arc::new(orchestrator),
            settings,
            controller,
            messenger,
            queue,
            receiver,
            defaults: Defaults {
                stars_interval: config.default_stars_interval,
                release_interval: config.default_release_interval,
                request_timeout: config.request_timeout,
                consumer: ConsumerConfig {
                    item_delay: config.queue_item_delay,
                    ..Default::default()
                },
                ai_configured: config.gemini.is_some(),
            },
            started_at: Utc::now(),
        })
    }

    /// Apply startup settings. Entries that are already in place are skipped
    /// so restarts neither re-verify destinations nor reset the release
    /// baseline. Failures are logged and do not stop startup.
    pub async fn bootstrap(&self, actions: Vec<SettingsAction>) -> Result<usize> {
        let mut applied = 0;
        for action in actions {
            if self.already_applied(&action).await? {
                debug!(?action, "Bootstrap setting already in place");
                continue;
            }
            match self.controller.apply(action.clone()).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(?action, error = %e, "Failed to apply bootstrap setting"),
            }
        }
        Ok(applied)
    }

    async fn already_applied(&self, action: &SettingsAction) -> Result<bool> {
        let (set, raw) = match action {
            SettingsAction::SetTrackedCollection(slug) => {
                return Ok(self.settings.tracked_list().await?.as_deref() == Some(slug.trim()));
            }
            SettingsAction::SetToken(token) => {
                return Ok(self.settings.token().await?.as_deref() == Some(token.trim()));
            }
            SettingsAction::AddStarDestination(raw) => (DestinationSet::Star, raw),
            SettingsAction::AddReleaseDestination(raw) => (DestinationSet::Release, raw),
            _ => return Ok(false),
        };
        let Ok(dest) = Destination::parse(raw) else {
            return Ok(false);
        };
        let existing = self.settings.destinations(set).await?;
        Ok(existing.contains(&dest.to_string()))
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let facts = RuntimeFacts {
            started_at: self.started_at,
            default_stars_interval: self.defaults.stars_interval,
            default_release_interval: self.defaults.release_interval,
            next_digest_run: self.scheduler.next_fire_time(),
            pending_events: self.queue.pending(),
            ai_configured: self.defaults.ai_configured,
        };
        StatusReport::collect(self.settings.as_ref(), self.source.as_ref(), facts, Utc::now()).await
    }

    /// Spawn every long-running task.
    pub fn start(self) -> RunningServices {
        let producer_token = CancellationToken::new();
        let consumer_token = CancellationToken::new();
        let mut producers = JoinSet::new();
        let mut consumer = JoinSet::new();

        let monitors: [(Arc<dyn PollCycle>, Duration); 2] = [
            (self.star_monitor as Arc<dyn PollCycle>, self.defaults.stars_interval),
            (self.release_monitor as Arc<dyn PollCycle>, self.defaults.release_interval),
        ];
        for (cycle, default_interval) in monitors {
            let wake = self.controller.wakers().get(cycle.kind()).subscribe();
            producers.spawn(run_monitor(
                cycle,
                self.settings.clone(),
                MonitorLoopConfig {
                    default_interval,
                    error_cooldown: ERROR_COOLDOWN,
                },
                wake,
                producer_token.clone(),
            ));
        }
        producers.spawn(self.scheduler.run(producer_token.clone()));

        consumer.spawn(queue::run_consumer(
            self.receiver,
            self.orchestrator,
            self.defaults.consumer.clone(),
            consumer_token.clone(),
        ));

        info!(
            stars_interval_secs = self.defaults.stars_interval.as_secs(),
            release_interval_secs = self.defaults.release_interval.as_secs(),
            "All services started"
        );

        RunningServices {
            producers,
            consumer,
            producer_token,
            consumer_token,
            queue: self.queue,
            request_timeout: self.defaults.request_timeout,
        }
    }
}

pub struct RunningServices {
    producers: JoinSet<()>,
    consumer: JoinSet<()>,
    producer_token: CancellationToken,
    consumer_token: CancellationToken,
    queue: DeliveryQueue,
    request_timeout: Duration,
}

impl RunningServices {
    /// Block until `shutdown` resolves. Tasks that end early are reported.
    pub async fn wait_for(&mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                Some(res) = self.producers.join_next() => report_exit("producer", res),
                Some(res) = self.consumer.join_next() => report_exit("consumer", res),
            }
        }
    }

    /// Stop producers, drain the queue within a bound, then stop the consumer.
    pub async fn shutdown(mut self) {
        info!("Shutting down services");
        self.producer_token.cancel();
        while let Some(res) = self.producers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Producer task failed during shutdown");
            }
        }

        let pending = self.queue.pending();
        if pending > 0 {
            let ceiling = (self.request_timeout * pending as u32).max(MIN_DRAIN_TIMEOUT);
            info!(pending, timeout_secs = ceiling.as_secs(), "Draining delivery queue");
            if tokio::time::timeout(ceiling, self.queue.join()).await.is_err() {
                warn!(remaining = self.queue.pending(), "Queue drain timed out, dropping events");
            }
        }

        self.consumer_token.cancel();
        while let Some(res) = self.consumer.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Consumer task failed during shutdown");
            }
        }
        info!("Services shut down");
    }
}

fn report_exit(tier: &str, res: std::result::Result<(), tokio::task::JoinError>) {
    match res {
        Ok(()) => warn!(tier, "Service task exited early"),
        Err(e) if e.is_panic() => error!(tier, error = %e, "Service task panicked"),
        Err(e) => warn!(tier, error = %e, "Service task was cancelled"),
    }
}
