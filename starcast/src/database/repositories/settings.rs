//! Settings repository: runtime state, dedup markers, destinations and the
//! digest queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::database::models::{DestinationSet, DigestMode, FeatureFlag, MonitorKind};
use crate::secret::TokenCipher;
use crate::{Error, Result};

const PAUSED_KEY: &str = "monitoring_paused";
const DIGEST_MODE_KEY: &str = "digest_mode";
const STAR_MARKER_KEY: &str = "last_check_timestamp";
const TOKEN_KEY: &str = "github_token";

/// Settings repository trait.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    // Monitoring state
    async fn is_paused(&self) -> Result<bool>;
    async fn set_paused(&self, paused: bool) -> Result<()>;
    async fn interval(&self, monitor: MonitorKind) -> Result<Option<Duration>>;
    async fn set_interval(&self, monitor: MonitorKind, interval: Duration) -> Result<()>;
    async fn digest_mode(&self) -> Result<DigestMode>;
    async fn set_digest_mode(&self, mode: DigestMode) -> Result<()>;
    async fn feature_enabled(&self, flag: FeatureFlag) -> Result<bool>;
    async fn set_feature_enabled(&self, flag: FeatureFlag, enabled: bool) -> Result<()>;

    // Dedup markers
    async fn star_marker(&self) -> Result<Option<DateTime<Utc>>>;
    /// Advance the marker. Older values are ignored so the marker never moves back.
    async fn advance_star_marker(&self, at: DateTime<Utc>) -> Result<()>;
    async fn release_id(&self, repo: &str) -> Result<Option<String>>;
    async fn set_release_id(&self, repo: &str, release_id: &str) -> Result<()>;

    // Digest queue
    /// Returns `false` when the repo was already queued.
    async fn digest_add(&self, repo: &str) -> Result<bool>;
    /// Read and clear the queue atomically, in insertion order.
    async fn digest_drain(&self) -> Result<Vec<String>>;
    async fn digest_count(&self) -> Result<u64>;

    // Destinations
    async fn destinations(&self, set: DestinationSet) -> Result<Vec<String>>;
    /// Returns `false` when the destination was already present.
    async fn add_destination(&self, set: DestinationSet, target: &str) -> Result<bool>;
    /// Returns `false` when the destination was not present.
    async fn remove_destination(&self, set: DestinationSet, target: &str) -> Result<bool>;

    // Tracked collection
    async fn tracked_list(&self) -> Result<Option<String>>;
    /// Replace the tracked list and forget all release baselines.
    async fn set_tracked_list(&self, slug: &str) -> Result<()>;

    // Token
    async fn set_token(&self, token: &str) -> Result<()>;
    async fn token(&self) -> Result<Option<String>>;
    async fn remove_token(&self) -> Result<()>;
    async fn has_token(&self) -> Result<bool>;
}

/// SQLx implementation of SettingsRepository.
pub struct SqlxSettingsRepository {
    pool: SqlitePool,
    cipher: TokenCipher,
}

impl SqlxSettingsRepository {
    pub fn new(pool: SqlitePool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM bot_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM bot_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl SettingsRepository for SqlxSettingsRepository {
    async fn is_paused(&self) -> Result<bool> {
        Ok(self.get_state(PAUSED_KEY).await?.as_deref() == Some("1"))
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.set_state(PAUSED_KEY, if paused { "1" } else { "0" }).await
    }

    async fn interval(&self, monitor: MonitorKind) -> Result<Option<Duration>> {
        match self.get_state(monitor.interval_key()).await? {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| {
                    Error::Database(format!("invalid {} value '{raw}'", monitor.interval_key()))
                })?;
                Ok(Some(Duration::from_secs(secs)))
            }
            None => Ok(None),
        }
    }

    async fn set_interval(&self, monitor: MonitorKind, interval: Duration) -> Result<()> {
        self.set_state(monitor.interval_key(), &interval.as_secs().to_string())
            .await?;
        info!(monitor = %monitor, secs = interval.as_secs(), "Monitor interval updated");
        Ok(())
    }

    async fn digest_mode(&self) -> Result<DigestMode> {
        Ok(self
            .get_state(DIGEST_MODE_KEY)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default())
    }

    async fn set_digest_mode(&self, mode: DigestMode) -> Result<()> {
        self.set_state(DIGEST_MODE_KEY, &mode.to_string()).await?;
        info!(mode = %mode, "Digest mode updated");
        Ok(())
    }

    async fn feature_enabled(&self, flag: FeatureFlag) -> Result<bool> {
        Ok(self.get_state(flag.state_key()).await?.as_deref() != Some("0"))
    }

    async fn set_feature_enabled(&self, flag: FeatureFlag, enabled: bool) -> Result<()> {
        self.set_state(flag.state_key(), if enabled { "1" } else { "0" })
            .await
    }

    async fn star_marker(&self) -> Result<Option<DateTime<Utc>>> {
        match self.get_state(STAR_MARKER_KEY).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| Error::Database(format!("invalid star marker '{raw}': {e}"))),
            None => Ok(None),
        }
    }

    async fn advance_star_marker(&self, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT value FROM bot_state WHERE key = ?")
                .bind(STAR_MARKER_KEY)
                .fetch_optional(&mut *tx)
                .await?;

        let is_newer = match current.and_then(|(raw,)| DateTime::parse_from_rfc3339(&raw).ok()) {
            Some(existing) => at > existing.with_timezone(&Utc),
            None => true,
        };

        if is_newer {
            sqlx::query(
                r#"
                INSERT INTO bot_state (key, value) VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(STAR_MARKER_KEY)
            .bind(timestamp(at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn release_id(&self, repo: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT latest_release_id FROM repository_release_state WHERE repo_full_name = ?",
        )
        .bind(repo)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_release_id(&self, repo: &str, release_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_release_state (repo_full_name, latest_release_id, last_checked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(repo_full_name) DO UPDATE SET
                latest_release_id = excluded.latest_release_id,
                last_checked_at = excluded.last_checked_at
            "#,
        )
        .bind(repo)
        .bind(release_id)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn digest_add(&self, repo: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO digest_queue (repo_full_name, added_at) VALUES (?, ?)",
        )
        .bind(repo)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn digest_drain(&self) -> Result<Vec<String>> {
        // One write statement: no read-then-upgrade window under WAL.
        let mut rows: Vec<(i64, String)> =
            sqlx::query_as("DELETE FROM digest_queue RETURNING id, repo_full_name")
                .fetch_all(&self.pool)
                .await?;
        // RETURNING order is unspecified.
        rows.sort_unstable_by_key(|(id, _)| *id);
        Ok(rows.into_iter().map(|(_, repo)| repo).collect())
    }

    async fn digest_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM digest_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn destinations(&self, set: DestinationSet) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT target_id FROM {} ORDER BY rowid",
            set.table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn add_destination(&self, set: DestinationSet, target: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (target_id) VALUES (?)",
            set.table()
        ))
        .bind(target)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_destination(&self, set: DestinationSet, target: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE target_id = ?", set.table()))
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tracked_list(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT list_slug FROM tracked_list LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_tracked_list(&self, slug: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tracked_list")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO tracked_list (list_slug) VALUES (?)")
            .bind(slug)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM repository_release_state")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(list = %slug, "Tracked list updated");
        Ok(())
    }

    async fn set_token(&self, token: &str) -> Result<()> {
        let encrypted = self.cipher.encrypt(token)?;
        self.set_state(TOKEN_KEY, &encrypted).await?;
        info!("GitHub token has been encrypted and stored");
        Ok(())
    }

    async fn token(&self) -> Result<Option<String>> {
        match self.get_state(TOKEN_KEY).await? {
            Some(stored) => self.cipher.decrypt(&stored).map(Some),
            None => Ok(None),
        }
    }

    async fn remove_token(&self) -> Result<()> {
        self.delete_state(TOKEN_KEY).await?;
        info!("GitHub token has been removed");
        Ok(())
    }

    async fn has_token(&self) -> Result<bool> {
        Ok(self.get_state(TOKEN_KEY).await?.is_some())
    }
}
