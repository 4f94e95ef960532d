//! Shared in-memory doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use github_api::{RateLimit, RepoSnapshot, StarredEvent};
use tokio::sync::Mutex;

use crate::database::models::{DestinationSet, DigestMode, FeatureFlag, MonitorKind};
use crate::database::repositories::SettingsRepository;
use crate::github::RepoSource;
use crate::media::MediaItem;
use crate::notification::{Destination, MessageBody, MessageId, MessagingClient, TelegramError};
use crate::{Error, Result};

/// Unix seconds as a UTC timestamp.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

#[derive(Default)]
struct State {
    paused: bool,
    intervals: HashMap<MonitorKind, Duration>,
    digest_mode: DigestMode,
    disabled_flags: HashSet<FeatureFlag>,
    star_marker: Option<DateTime<Utc>>,
    release_ids: HashMap<String, String>,
    digest: Vec<String>,
    star_destinations: Vec<String>,
    release_destinations: Vec<String>,
    tracked_list: Option<String>,
    token: Option<String>,
    failing_release_repos: HashSet<String>,
}

#[derive(Default)]
pub struct MockSettings {
    state: Mutex<State>,
}

impl MockSettings {
    pub async fn with_token(self, token: &str) -> Self {
        self.state.lock().await.token = Some(token.to_string());
        self
    }

    /// Make release state reads and writes for `repo` fail.
    pub async fn fail_release_state(&self, repo: &str) {
        self.state
            .lock()
            .await
            .failing_release_repos
            .insert(repo.to_string());
    }
}

#[async_trait]
impl SettingsRepository for MockSettings {
    async fn is_paused(&self) -> Result<bool> {
        Ok(self.state.lock().await.paused)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.state.lock().await.paused = paused;
        Ok(())
    }

    async fn interval(&self, monitor: MonitorKind) -> Result<Option<Duration>> {
        Ok(self.state.lock().await.intervals.get(&monitor).copied())
    }

    async fn set_interval(&self, monitor: MonitorKind, interval: Duration) -> Result<()> {
        self.state.lock().await.intervals.insert(monitor, interval);
        Ok(())
    }

    async fn digest_mode(&self) -> Result<DigestMode> {
        Ok(self.state.lock().await.digest_mode)
    }

    async fn set_digest_mode(&self, mode: DigestMode) -> Result<()> {
        self.state.lock().await.digest_mode = mode;
        Ok(())
    }

    async fn feature_enabled(&self, flag: FeatureFlag) -> Result<bool> {
        Ok(!self.state.lock().await.disabled_flags.contains(&flag))
    }

    async fn set_feature_enabled(&self, flag: FeatureFlag, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if enabled {
            state.disabled_flags.remove(&flag);
        } else {
            state.disabled_flags.insert(flag);
        }
        Ok(())
    }

    async fn star_marker(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.star_marker)
    }

    async fn advance_star_marker(&self, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.star_marker.is_none_or(|current| at > current) {
            state.star_marker = Some(at);
        }
        Ok(())
    }

    async fn release_id(&self, repo: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        if state.failing_release_repos.contains(repo) {
            return Err(Error::Other(format!("release state unavailable for {repo}")));
        }
        Ok(state.release_ids.get(repo).cloned())
    }

    async fn set_release_id(&self, repo: &str, release_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_release_repos.contains(repo) {
            return Err(Error::Other(format!("release state unavailable for {repo}")));
        }
        state
            .release_ids
            .insert(repo.to_string(), release_id.to_string());
        Ok(())
    }

    async fn digest_add(&self, repo: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.digest.iter().any(|r| r == repo) {
            return Ok(false);
        }
        state.digest.push(repo.to_string());
        Ok(true)
    }

    async fn digest_drain(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.state.lock().await.digest))
    }

    async fn digest_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.digest.len() as u64)
    }

    async fn destinations(&self, set: DestinationSet) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(match set {
            DestinationSet::Star => state.star_destinations.clone(),
            DestinationSet::Release => state.release_destinations.clone(),
        })
    }

    async fn add_destination(&self, set: DestinationSet, target: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let list = match set {
            DestinationSet::Star => &mut state.star_destinations,
            DestinationSet::Release => &mut state.release_destinations,
        };
        if list.iter().any(|d| d == target) {
            return Ok(false);
        }
        list.push(target.to_string());
        Ok(true)
    }

    async fn remove_destination(&self, set: DestinationSet, target: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let list = match set {
            DestinationSet::Star => &mut state.star_destinations,
            DestinationSet::Release => &mut state.release_destinations,
        };
        let before = list.len();
        list.retain(|d| d != target);
        Ok(list.len() != before)
    }

    async fn tracked_list(&self) -> Result<Option<String>> {
        Ok(self.state.lock().await.tracked_list.clone())
    }

    async fn set_tracked_list(&self, slug: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tracked_list = Some(slug.to_string());
        state.release_ids.clear();
        Ok(())
    }

    async fn set_token(&self, token: &str) -> Result<()> {
        self.state.lock().await.token = Some(token.to_string());
        Ok(())
    }

    async fn token(&self) -> Result<Option<String>> {
        Ok(self.state.lock().await.token.clone())
    }

    async fn remove_token(&self) -> Result<()> {
        self.state.lock().await.token = None;
        Ok(())
    }

    async fn has_token(&self) -> Result<bool> {
        Ok(self.state.lock().await.token.is_some())
    }
}

#[derive(Default)]
struct Feed {
    stars: Vec<StarredEvent>,
    fail_stars: bool,
    snapshots: HashMap<String, RepoSnapshot>,
    readmes: HashMap<String, String>,
    members: Vec<String>,
    release_ids: HashMap<String, String>,
    failing_repos: HashSet<String>,
    fail_viewer: bool,
    rate_limit: Option<RateLimit>,
    snapshot_calls: u32,
}

/// Scriptable [`RepoSource`].
#[derive(Default)]
pub struct FakeSource {
    feed: Mutex<Feed>,
}

impl FakeSource {
    /// `(unix seconds, owner/name)` pairs, newest first.
    pub async fn set_stars(&self, stars: &[(i64, &str)]) {
        self.feed.lock().await.stars = stars
            .iter()
            .map(|(secs, repo)| StarredEvent::new(at(*secs), *repo))
            .collect();
    }

    pub async fn fail_stars(&self, fail: bool) {
        self.feed.lock().await.fail_stars = fail;
    }

    pub async fn add_snapshot(&self, snapshot: RepoSnapshot) {
        self.feed
            .lock()
            .await
            .snapshots
            .insert(snapshot.name_with_owner.clone(), snapshot);
    }

    pub async fn set_readme(&self, repo: &str, readme: &str) {
        self.feed
            .lock()
            .await
            .readmes
            .insert(repo.to_string(), readme.to_string());
    }

    pub async fn set_members(&self, members: &[&str]) {
        self.feed.lock().await.members = members.iter().map(|m| m.to_string()).collect();
    }

    pub async fn set_release(&self, repo: &str, release_id: &str) {
        self.feed
            .lock()
            .await
            .release_ids
            .insert(repo.to_string(), release_id.to_string());
    }

    /// Make snapshot and readme lookups for `repo` fail.
    pub async fn fail_repo(&self, repo: &str) {
        self.feed.lock().await.failing_repos.insert(repo.to_string());
    }

    pub async fn fail_viewer(&self, fail: bool) {
        self.feed.lock().await.fail_viewer = fail;
    }

    pub async fn set_rate_limit(&self, rate_limit: RateLimit) {
        self.feed.lock().await.rate_limit = Some(rate_limit);
    }

    pub async fn snapshot_calls(&self) -> u32 {
        self.feed.lock().await.snapshot_calls
    }
}

#[async_trait]
impl RepoSource for FakeSource {
    async fn starred_events(&self) -> Result<Vec<StarredEvent>> {
        let feed = self.feed.lock().await;
        if feed.fail_stars {
            return Err(Error::Other("starred feed unavailable".into()));
        }
        Ok(feed.stars.clone())
    }

    async fn repo_snapshot(&self, owner: &str, name: &str) -> Result<Option<RepoSnapshot>> {
        let mut feed = self.feed.lock().await;
        feed.snapshot_calls += 1;
        let key = format!("{owner}/{name}");
        if feed.failing_repos.contains(&key) {
            return Err(Error::Other(format!("snapshot failed for {key}")));
        }
        Ok(feed.snapshots.get(&key).cloned())
    }

    async fn latest_release_ids(&self, repos: &[String]) -> Result<HashMap<String, String>> {
        let feed = self.feed.lock().await;
        Ok(repos
            .iter()
            .filter_map(|r| feed.release_ids.get(r).map(|id| (r.clone(), id.clone())))
            .collect())
    }

    async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>> {
        let feed = self.feed.lock().await;
        Ok(feed.readmes.get(&format!("{owner}/{name}")).cloned())
    }

    async fn viewer_login(&self) -> Result<String> {
        if self.feed.lock().await.fail_viewer {
            return Err(Error::Other("Bad credentials".into()));
        }
        Ok("octocat".to_string())
    }

    async fn rate_limit(&self) -> Result<Option<RateLimit>> {
        Ok(self.feed.lock().await.rate_limit.clone())
    }

    async fn list_members(&self, _login: &str, _slug: &str) -> Result<Vec<String>> {
        Ok(self.feed.lock().await.members.clone())
    }
}

/// One call recorded by [`FakeMessenger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCall {
    pub method: &'static str,
    pub dest: String,
    pub text: String,
    pub media: Vec<String>,
}

/// [`MessagingClient`] that records calls and fails on demand.
#[derive(Default)]
pub struct FakeMessenger {
    calls: Mutex<Vec<SentCall>>,
    /// `(destination, method)` -> error description. Method `*` matches all.
    failures: Mutex<HashMap<(String, String), String>>,
}

impl FakeMessenger {
    pub async fn fail(&self, dest: &str, method: &str, description: &str) {
        self.failures
            .lock()
            .await
            .insert((dest.to_string(), method.to_string()), description.to_string());
    }

    pub async fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().await.clone()
    }

    pub async fn methods_for(&self, dest: &str) -> Vec<&'static str> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.dest == dest)
            .map(|c| c.method)
            .collect()
    }

    async fn record(
        &self,
        method: &'static str,
        dest: &Destination,
        text: &str,
        media: Vec<String>,
    ) -> std::result::Result<MessageId, TelegramError> {
        let dest = dest.to_string();
        let mut calls = self.calls.lock().await;
        calls.push(SentCall {
            method,
            dest: dest.clone(),
            text: text.to_string(),
            media,
        });

        let failures = self.failures.lock().await;
        let failure = failures
            .get(&(dest.clone(), method.to_string()))
            .or_else(|| failures.get(&(dest, "*".to_string())));
        match failure {
            Some(description) => Err(TelegramError::Api {
                code: 400,
                description: description.clone(),
                retry_after: None,
            }),
            None => Ok(calls.len() as MessageId),
        }
    }
}

#[async_trait]
impl MessagingClient for FakeMessenger {
    async fn send_text(
        &self,
        dest: &Destination,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        self.record("send_text", dest, &body.text, Vec::new()).await
    }

    async fn send_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        self.record("send_photo", dest, &body.text, vec![url.to_string()]).await
    }

    async fn send_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        self.record("send_video", dest, &body.text, vec![url.to_string()]).await
    }

    async fn send_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        let urls = media.iter().map(|m| m.url.clone()).collect();
        self.record("send_media_group", dest, &body.text, urls).await
    }

    async fn delete_message(
        &self,
        dest: &Destination,
        _message_id: MessageId,
    ) -> std::result::Result<(), TelegramError> {
        self.record("delete_message", dest, "", Vec::new()).await.map(|_| ())
    }

    async fn upload_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        self.record("upload_photo", dest, &body.text, vec![url.to_string()]).await
    }

    async fn upload_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        self.record("upload_video", dest, &body.text, vec![url.to_string()]).await
    }

    async fn upload_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError> {
        let urls = media.iter().map(|m| m.url.clone()).collect();
        self.record("upload_media_group", dest, &body.text, urls).await
    }
}
