//! Integration tests for the SQLite settings repository.
//!
//! These run against an in-memory database with the real migrations.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use starcast::database::models::{DestinationSet, DigestMode, FeatureFlag, MonitorKind};
use starcast::database::repositories::{SettingsRepository, SqlxSettingsRepository};
use starcast::database::{DbPool, init_pool, run_migrations};
use starcast::secret::TokenCipher;

async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:")
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

async fn repo() -> (DbPool, SqlxSettingsRepository) {
    let pool = setup_test_db().await;
    let repo = SqlxSettingsRepository::new(pool.clone(), TokenCipher::new(&[42u8; 32]));
    (pool, repo)
}

#[tokio::test]
async fn fresh_database_has_documented_defaults() {
    let (_pool, repo) = repo().await;

    assert!(!repo.is_paused().await.unwrap());
    assert_eq!(repo.digest_mode().await.unwrap(), DigestMode::Off);
    assert!(repo.feature_enabled(FeatureFlag::Summary).await.unwrap());
    assert!(repo.feature_enabled(FeatureFlag::MediaSelection).await.unwrap());
    assert_eq!(repo.interval(MonitorKind::Stars).await.unwrap(), None);
    assert_eq!(repo.star_marker().await.unwrap(), None);
    assert_eq!(repo.tracked_list().await.unwrap(), None);
    assert!(!repo.has_token().await.unwrap());
}

#[tokio::test]
async fn runtime_settings_round_trip() {
    let (_pool, repo) = repo().await;

    repo.set_paused(true).await.unwrap();
    repo.set_digest_mode(DigestMode::Weekly).await.unwrap();
    repo.set_feature_enabled(FeatureFlag::Summary, false).await.unwrap();
    repo.set_interval(MonitorKind::Releases, Duration::from_secs(900))
        .await
        .unwrap();

    assert!(repo.is_paused().await.unwrap());
    assert_eq!(repo.digest_mode().await.unwrap(), DigestMode::Weekly);
    assert!(!repo.feature_enabled(FeatureFlag::Summary).await.unwrap());
    assert!(repo.feature_enabled(FeatureFlag::MediaSelection).await.unwrap());
    assert_eq!(
        repo.interval(MonitorKind::Releases).await.unwrap(),
        Some(Duration::from_secs(900))
    );
    assert_eq!(repo.interval(MonitorKind::Stars).await.unwrap(), None);
}

#[tokio::test]
async fn star_marker_never_moves_backwards() {
    let (_pool, repo) = repo().await;
    let t100 = Utc.timestamp_opt(100, 0).unwrap();
    let t150 = Utc.timestamp_opt(150, 0).unwrap();

    repo.advance_star_marker(t100).await.unwrap();
    repo.advance_star_marker(t150).await.unwrap();
    repo.advance_star_marker(t100).await.unwrap();

    assert_eq!(repo.star_marker().await.unwrap(), Some(t150));
}

#[tokio::test]
async fn digest_insert_is_idempotent_and_drain_keeps_order() {
    let (_pool, repo) = repo().await;

    assert!(repo.digest_add("acme/b").await.unwrap());
    assert!(repo.digest_add("acme/a").await.unwrap());
    assert!(!repo.digest_add("acme/b").await.unwrap());
    assert_eq!(repo.digest_count().await.unwrap(), 2);

    assert_eq!(repo.digest_drain().await.unwrap(), vec!["acme/b", "acme/a"]);
    assert_eq!(repo.digest_count().await.unwrap(), 0);
    assert!(repo.digest_drain().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_races_with_inserts_without_losing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("race.db").display());
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let repo = std::sync::Arc::new(SqlxSettingsRepository::new(
        pool.clone(),
        TokenCipher::new(&[42u8; 32]),
    ));

    let writer = {
        let repo = repo.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                repo.digest_add(&format!("acme/r{i}")).await.unwrap();
            }
        })
    };

    let mut drained = Vec::new();
    while !writer.is_finished() {
        drained.extend(repo.digest_drain().await.unwrap());
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    drained.extend(repo.digest_drain().await.unwrap());

    assert_eq!(drained.len(), 200);
    let mut unique = drained.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 200);
    pool.close().await;
}

#[tokio::test]
async fn destination_sets_are_independent_and_unique() {
    let (_pool, repo) = repo().await;

    assert!(repo.add_destination(DestinationSet::Star, "-100").await.unwrap());
    assert!(!repo.add_destination(DestinationSet::Star, "-100").await.unwrap());
    assert!(repo.add_destination(DestinationSet::Release, "-100/7").await.unwrap());

    assert_eq!(repo.destinations(DestinationSet::Star).await.unwrap(), vec!["-100"]);
    assert_eq!(
        repo.destinations(DestinationSet::Release).await.unwrap(),
        vec!["-100/7"]
    );

    assert!(repo.remove_destination(DestinationSet::Star, "-100").await.unwrap());
    assert!(!repo.remove_destination(DestinationSet::Star, "-100").await.unwrap());
    assert!(repo.destinations(DestinationSet::Star).await.unwrap().is_empty());
}

#[tokio::test]
async fn new_tracked_list_resets_release_baseline() {
    let (_pool, repo) = repo().await;

    repo.set_tracked_list("tools").await.unwrap();
    repo.set_release_id("acme/tool", "rel_1").await.unwrap();
    repo.set_release_id("acme/tool", "rel_2").await.unwrap();
    assert_eq!(
        repo.release_id("acme/tool").await.unwrap().as_deref(),
        Some("rel_2")
    );

    repo.set_tracked_list("libs").await.unwrap();
    assert_eq!(repo.tracked_list().await.unwrap().as_deref(), Some("libs"));
    assert_eq!(repo.release_id("acme/tool").await.unwrap(), None);
}

#[tokio::test]
async fn token_is_encrypted_at_rest() {
    let (pool, repo) = repo().await;

    repo.set_token("ghp_secret").await.unwrap();
    assert_eq!(repo.token().await.unwrap().as_deref(), Some("ghp_secret"));

    let stored: Vec<(String,)> = sqlx::query_as("SELECT value FROM bot_state")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert!(stored.iter().all(|(value,)| !value.contains("ghp_secret")));

    // A different key cannot read it.
    let other = SqlxSettingsRepository::new(pool.clone(), TokenCipher::new(&[1u8; 32]));
    assert!(other.token().await.is_err());

    repo.remove_token().await.unwrap();
    assert!(!repo.has_token().await.unwrap());
}
