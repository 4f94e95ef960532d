//! Seam between the pipeline and the GitHub client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use github_api::{GitHubClient, RateLimit, RepoSnapshot, StarredEvent, TokenProvider};
use tracing::warn;

use crate::Result;
use crate::database::repositories::SettingsRepository;

/// Remote repository API used by the monitors and the orchestrator.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Newest page of starred events, newest first.
    async fn starred_events(&self) -> Result<Vec<StarredEvent>>;
    /// `None` when the repository does not exist.
    async fn repo_snapshot(&self, owner: &str, name: &str) -> Result<Option<RepoSnapshot>>;
    /// Newest release id per repo; repos without releases are absent.
    async fn latest_release_ids(&self, repos: &[String]) -> Result<HashMap<String, String>>;
    async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>>;
    async fn viewer_login(&self) -> Result<String>;
    async fn rate_limit(&self) -> Result<Option<RateLimit>>;
    async fn list_members(&self, login: &str, slug: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl RepoSource for GitHubClient {
    async fn starred_events(&self) -> Result<Vec<StarredEvent>> {
        Ok(GitHubClient::starred_events(self).await?)
    }

    async fn repo_snapshot(&self, owner: &str, name: &str) -> Result<Option<RepoSnapshot>> {
        Ok(GitHubClient::repo_snapshot(self, owner, name).await?)
    }

    async fn latest_release_ids(&self, repos: &[String]) -> Result<HashMap<String, String>> {
        Ok(GitHubClient::latest_release_ids(self, repos).await?)
    }

    async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>> {
        Ok(GitHubClient::readme(self, owner, name).await?)
    }

    async fn viewer_login(&self) -> Result<String> {
        Ok(GitHubClient::viewer_login(self).await?)
    }

    async fn rate_limit(&self) -> Result<Option<RateLimit>> {
        Ok(GitHubClient::rate_limit(self).await?)
    }

    async fn list_members(&self, login: &str, slug: &str) -> Result<Vec<String>> {
        Ok(GitHubClient::list_members(self, login, slug).await?)
    }
}

/// Reads the encrypted token from settings on every request, so a token
/// change takes effect without restarting.
pub struct SettingsTokenProvider {
    repo: Arc<dyn SettingsRepository>,
}

impl SettingsTokenProvider {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl TokenProvider for SettingsTokenProvider {
    async fn token(&self) -> Option<String> {
        match self.repo.token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to load GitHub token");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockSettings;

    #[tokio::test]
    async fn token_provider_follows_settings() {
        let repo = Arc::new(MockSettings::default());
        let provider = SettingsTokenProvider::new(repo.clone());
        assert_eq!(provider.token().await, None);

        repo.set_token("ghp_new").await.unwrap();
        assert_eq!(provider.token().await.as_deref(), Some("ghp_new"));
    }
}
