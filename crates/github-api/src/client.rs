use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    RateLimit, RateLimitData, ReadmeResponse, RepoSnapshot, RepositoryData, StarredEvent,
    ViewerLoginData, split_full_name,
};
use crate::queries;

/// Maximum number of aliased repositories per batched release query.
pub const RELEASE_BATCH_SIZE: usize = 50;

static LIST_MEMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<h3[^>]*>\s*<a[^>]*href="/([A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+)""#).expect("list member regex")
});

/// Supplies the current GitHub token on every call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// A fixed token, mostly useful in tests and one-off tools.
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub api_base: String,
    pub graphql_url: String,
    pub web_base: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            graphql_url: "https://api.github.com/graphql".to_string(),
            web_base: "https://github.com".to_string(),
            timeout: Duration::from_secs(60),
            user_agent: concat!("starcast/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    path: Vec<serde_json::Value>,
}

impl GraphQlError {
    fn is_not_found(&self) -> bool {
        self.kind.as_deref() == Some("NOT_FOUND")
    }

    /// First path segment, i.e. the top-level field or alias the error belongs to.
    fn field(&self) -> Option<&str> {
        self.path.first().and_then(|p| p.as_str())
    }
}

fn graphql_error(errors: Vec<GraphQlError>) -> Error {
    Error::GraphQl(errors.into_iter().map(|e| e.message).collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRepoNode {
    latest_release: Option<crate::models::Nodes<ReleaseIdNode>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseIdNode {
    id: String,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    config: Arc<GitHubClientConfig>,
    tokens: Arc<dyn TokenProvider>,
}

impl GitHubClient {
    pub fn new(client: Client, config: GitHubClientConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            config: Arc::new(config),
            tokens,
        }
    }

    pub fn config(&self) -> &GitHubClientConfig {
        &self.config
    }

    async fn bearer(&self) -> Result<HeaderValue> {
        let token = self
            .tokens
            .token()
            .await
            .filter(|t| !t.is_empty())
            .ok_or(Error::Unauthorized)?;
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::Decode("token contains invalid header characters".to_string()))
    }

    async fn rest_get(&self, path: &str, accept: &'static str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.bearer().await?)
            .header(ACCEPT, accept)
            .header(USER_AGENT, &self.config.user_agent)
            .timeout(self.config.timeout)
            .send()
            .await?;
        Ok(response)
    }

    /// Sends a GraphQL document and returns the raw envelope, so callers can
    /// decide which field-level errors are fatal.
    async fn post_gql_envelope<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GraphQlResponse<T>> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.config.graphql_url)
            .header(AUTHORIZATION, self.bearer().await?)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, &self.config.user_agent)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(serde_json::from_str(&text)?)
    }

    async fn post_gql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let parsed: GraphQlResponse<T> = self.post_gql_envelope(query, variables).await?;
        if !parsed.errors.is_empty() {
            return Err(graphql_error(parsed.errors));
        }
        parsed
            .data
            .ok_or_else(|| Error::Decode("graphql response without data".to_string()))
    }

    /// Newest page of the viewer's stars, newest first.
    pub async fn starred_events(&self) -> Result<Vec<StarredEvent>> {
        let response = self
            .rest_get(
                "/user/starred?sort=created&direction=desc&per_page=30",
                "application/vnd.github.star+json",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let events = response.json::<Vec<StarredEvent>>().await?;
        debug!(count = events.len(), "fetched starred events");
        Ok(events)
    }

    /// `Ok(None)` when the repository does not exist or is not visible.
    pub async fn repo_snapshot(&self, owner: &str, name: &str) -> Result<Option<RepoSnapshot>> {
        let parsed: GraphQlResponse<RepositoryData> = self
            .post_gql_envelope(
                queries::REPOSITORY_SNAPSHOT,
                serde_json::json!({ "owner": owner, "name": name }),
            )
            .await?;
        if parsed.errors.iter().any(GraphQlError::is_not_found) {
            debug!(%owner, %name, "repository not found");
            return Ok(None);
        }
        if !parsed.errors.is_empty() {
            return Err(graphql_error(parsed.errors));
        }
        let data = parsed
            .data
            .ok_or_else(|| Error::Decode("graphql response without data".to_string()))?;
        Ok(data.repository.map(RepoSnapshot::from))
    }

    /// Decoded README text, `None` when the repository has none.
    pub async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>> {
        let response = self
            .rest_get(
                &format!("/repos/{owner}/{name}/readme"),
                "application/vnd.github+json",
            )
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let readme: ReadmeResponse = response.json().await?;
        if readme.encoding.as_deref().is_some_and(|e| e != "base64") {
            return Ok(Some(readme.content));
        }
        // GitHub wraps base64 content at 60 columns.
        let compact: String = readme
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|e| Error::Decode(format!("readme base64: {e}")))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn viewer_login(&self) -> Result<String> {
        let data: ViewerLoginData = self
            .post_gql(queries::VIEWER_LOGIN, serde_json::Value::Null)
            .await?;
        Ok(data.viewer.login)
    }

    pub async fn rate_limit(&self) -> Result<Option<RateLimit>> {
        let data: RateLimitData = self
            .post_gql(queries::RATE_LIMIT, serde_json::Value::Null)
            .await?;
        Ok(data.rate_limit)
    }

    /// Repositories on a public star list, scraped from its web page since the
    /// API does not expose list contents.
    pub async fn list_members(&self, login: &str, slug: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/stars/{login}/lists/{slug}",
            self.config.web_base.trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .header(USER_AGENT, &self.config.user_agent)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let status = response.status();
        let html = response.text().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: html,
            });
        }

        let mut members: Vec<String> = Vec::new();
        for caps in LIST_MEMBER_REGEX.captures_iter(&html) {
            let full_name = caps[1].to_string();
            if !members.contains(&full_name) {
                members.push(full_name);
            }
        }
        if members.is_empty() {
            warn!(%url, "no repositories found on list page");
        } else {
            info!(list = %slug, count = members.len(), "scraped list members");
        }
        Ok(members)
    }

    /// Newest release id per repository. Repositories without any release, or
    /// that could not be resolved, are absent from the map.
    pub async fn latest_release_ids(&self, repos: &[String]) -> Result<HashMap<String, String>> {
        let mut ids = HashMap::new();

        for chunk in repos.chunks(RELEASE_BATCH_SIZE) {
            let mut pairs = Vec::with_capacity(chunk.len());
            let mut names = Vec::with_capacity(chunk.len());
            for full_name in chunk {
                match split_full_name(full_name) {
                    Ok(pair) => {
                        pairs.push(pair);
                        names.push(full_name.as_str());
                    }
                    Err(e) => warn!(error = %e, "skipping malformed repository name"),
                }
            }
            if pairs.is_empty() {
                continue;
            }

            let (query, variables) = queries::batch_latest_release(&pairs);
            let parsed: GraphQlResponse<HashMap<String, Option<BatchRepoNode>>> =
                self.post_gql_envelope(&query, variables).await?;
            // Unresolvable repos come back as `repoN: null` plus an error
            // scoped to that alias; only a missing `data` fails the chunk.
            let Some(data) = parsed.data else {
                return Err(graphql_error(parsed.errors));
            };
            for error in &parsed.errors {
                let repo = error
                    .field()
                    .and_then(|alias| alias.strip_prefix("repo"))
                    .and_then(|i| i.parse::<usize>().ok())
                    .and_then(|i| names.get(i).copied());
                match repo {
                    Some(repo) => warn!(
                        %repo,
                        kind = error.kind.as_deref().unwrap_or("unknown"),
                        message = %error.message,
                        "skipping repository in release batch"
                    ),
                    None => warn!(message = %error.message, "partial error in release batch"),
                }
            }

            for (i, full_name) in names.iter().enumerate() {
                let id = data
                    .get(&format!("repo{i}"))
                    .and_then(|node| node.as_ref())
                    .and_then(|node| node.latest_release.as_ref())
                    .and_then(|r| r.nodes.first())
                    .map(|n| n.id.clone());
                if let Some(id) = id {
                    ids.insert((*full_name).to_string(), id);
                }
            }
        }

        debug!(requested = repos.len(), with_release = ids.len(), "fetched latest release ids");
        Ok(ids)
    }
}
