//! Batched star delivery.
//!
//! Stars collected while the digest mode is `daily` or `weekly` sit in the
//! digest queue until the matching cron job fires. Both jobs always run; each
//! one checks the stored mode and does nothing unless it matches.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::DigestMode;
use crate::database::repositories::SettingsRepository;
use crate::events::Event;
use crate::queue::DeliveryQueue;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
}

impl Cadence {
    pub const ALL: [Cadence; 2] = [Cadence::Daily, Cadence::Weekly];

    /// Six-field cron expression (seconds first).
    pub fn expression(self) -> &'static str {
        match self {
            Self::Daily => "0 0 21 * * *",
            Self::Weekly => "0 0 21 * * Sun",
        }
    }

    fn mode(self) -> DigestMode {
        match self {
            Self::Daily => DigestMode::Daily,
            Self::Weekly => DigestMode::Weekly,
        }
    }
}

struct Job {
    cadence: Cadence,
    schedule: cron::Schedule,
}

pub struct DigestScheduler {
    settings: Arc<dyn SettingsRepository>,
    queue: DeliveryQueue,
    jobs: Vec<Job>,
    timezone: Tz,
}

impl DigestScheduler {
    pub fn new(settings: Arc<dyn SettingsRepository>, queue: DeliveryQueue) -> Result<Self> {
        let jobs = Cadence::ALL
            .into_iter()
            .map(|cadence| {
                cron::Schedule::from_str(cadence.expression())
                    .map(|schedule| Job { cadence, schedule })
                    .map_err(|e| Error::config(format!("invalid {cadence} digest schedule: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            settings,
            queue,
            jobs,
            timezone: chrono_tz::UTC,
        })
    }

    /// Evaluate the schedules in another timezone.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Soonest upcoming fire strictly after `after`, with every cadence due at
    /// that instant.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<Cadence>)> {
        let local = after.with_timezone(&self.timezone);
        let upcoming: Vec<(Cadence, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter_map(|job| {
                job.schedule
                    .after(&local)
                    .next()
                    .map(|t| (job.cadence, t.with_timezone(&Utc)))
            })
            .collect();

        let soonest = upcoming.iter().map(|(_, t)| *t).min()?;
        let due = upcoming
            .into_iter()
            .filter(|(_, t)| *t == soonest)
            .map(|(c, _)| c)
            .collect();
        Some((soonest, due))
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_after(Utc::now()).map(|(t, _)| t)
    }

    /// Run one job. Returns how many star events were queued.
    pub async fn fire(&self, cadence: Cadence) -> Result<usize> {
        let mode = self.settings.digest_mode().await?;
        if mode != cadence.mode() {
            debug!(cadence = %cadence, mode = %mode, "Digest mode does not match, skipping");
            return Ok(0);
        }

        info!(cadence = %cadence, "Running digest job");
        let repos = self.settings.digest_drain().await?;
        if repos.is_empty() {
            info!(cadence = %cadence, "Digest job ran, but the queue was empty");
            return Ok(0);
        }

        info!(count = repos.len(), "Moving digest queue into delivery queue");
        for repo in &repos {
            self.queue.push(Event::star(repo.as_str()))?;
        }
        Ok(repos.len())
    }

    /// Sleep until each fire time and run the due jobs, until `cancel`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            daily = Cadence::Daily.expression(),
            weekly = Cadence::Weekly.expression(),
            timezone = %self.timezone,
            "Digest scheduler started"
        );

        loop {
            let Some((fire_at, due)) = self.next_fire_after(Utc::now()) else {
                warn!("Digest schedules have no upcoming fire time");
                break;
            };
            let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();
            debug!(next_run = %fire_at, "Digest scheduler sleeping");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            for cadence in due {
                if let Err(e) = self.fire(cadence).await {
                    warn!(cadence = %cadence, error = %e, "Digest job failed");
                }
            }
        }

        info!("Digest scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::test_support::MockSettings;
    use chrono::TimeZone;

    async fn scheduler(mode: DigestMode) -> (Arc<MockSettings>, DigestScheduler, queue::QueueReceiver) {
        let settings = Arc::new(MockSettings::default());
        settings.set_digest_mode(mode).await.unwrap();
        let (queue, rx) = queue::channel();
        let scheduler = DigestScheduler::new(settings.clone(), queue).unwrap();
        (settings, scheduler, rx)
    }

    #[tokio::test]
    async fn matching_cadence_drains_in_insertion_order() {
        let (settings, scheduler, mut rx) = scheduler(DigestMode::Daily).await;
        for repo in ["a/one", "b/two", "c/three"] {
            settings.digest_add(repo).await.unwrap();
        }

        assert_eq!(scheduler.fire(Cadence::Daily).await.unwrap(), 3);

        let drained: Vec<String> = std::iter::from_fn(|| rx.try_recv())
            .map(|e| e.repo)
            .collect();
        assert_eq!(drained, vec!["a/one", "b/two", "c/three"]);
        assert_eq!(settings.digest_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mismatched_cadence_leaves_queue_alone() {
        let (settings, scheduler, mut rx) = scheduler(DigestMode::Weekly).await;
        settings.digest_add("a/one").await.unwrap();

        assert_eq!(scheduler.fire(Cadence::Daily).await.unwrap(), 0);
        assert_eq!(rx.try_recv(), None);
        assert_eq!(settings.digest_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let (_settings, scheduler, mut rx) = scheduler(DigestMode::Weekly).await;
        assert_eq!(scheduler.fire(Cadence::Weekly).await.unwrap(), 0);
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn next_fire_is_nine_pm_utc() {
        let (_settings, scheduler, _rx) = scheduler(DigestMode::Off).await;

        // Wednesday morning: only the daily job is due that evening.
        let wednesday = Utc.with_ymd_and_hms(2024, 6, 5, 8, 0, 0).unwrap();
        let (at, due) = scheduler.next_fire_after(wednesday).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 6, 5, 21, 0, 0).unwrap());
        assert_eq!(due, vec![Cadence::Daily]);

        // Sunday afternoon: both jobs share the slot.
        let sunday = Utc.with_ymd_and_hms(2024, 6, 9, 12, 0, 0).unwrap();
        let (at, due) = scheduler.next_fire_after(sunday).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 6, 9, 21, 0, 0).unwrap());
        assert_eq!(due, vec![Cadence::Daily, Cadence::Weekly]);
    }

    #[tokio::test]
    async fn timezone_shifts_fire_time() {
        let (_settings, scheduler, _rx) = scheduler(DigestMode::Off).await;
        let scheduler = scheduler.with_timezone(chrono_tz::Asia::Tokyo);

        let morning = Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap();
        let (at, _) = scheduler.next_fire_after(morning).unwrap();
        // 21:00 JST is 12:00 UTC.
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap());
    }
}
