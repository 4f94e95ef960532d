//! Typed views over GitHub REST and GraphQL payloads.
//!
//! Raw GraphQL nodes are private and get flattened into the public types,
//! so callers never walk `nodes`/`edges` wrappers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Split an `owner/name` identifier.
pub fn split_full_name(full_name: &str) -> Result<(&str, &str)> {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((owner, name))
        }
        _ => Err(Error::InvalidRepo(full_name.to_string())),
    }
}

/// A star from the authenticated user's `starred` feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarredEvent {
    pub starred_at: DateTime<Utc>,
    pub repo: StarredRepo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarredRepo {
    #[serde(default)]
    pub id: u64,
    pub full_name: String,
}

impl StarredEvent {
    pub fn new(starred_at: DateTime<Utc>, full_name: impl Into<String>) -> Self {
        Self {
            starred_at,
            repo: StarredRepo {
                id: 0,
                full_name: full_name.into(),
            },
        }
    }

    pub fn full_name(&self) -> &str {
        &self.repo.full_name
    }
}

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,
    pub tag_name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub name: String,
    pub size: u64,
}

/// Point-in-time repository metadata used to build a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub name_with_owner: String,
    pub description: Option<String>,
    pub url: String,
    pub stargazer_count: u64,
    pub fork_count: u64,
    pub open_issues: u64,
    pub pushed_at: Option<DateTime<Utc>>,
    pub default_branch: String,
    pub owner_login: String,
    pub owner_avatar_url: Option<String>,
    pub license: Option<String>,
    pub topics: Vec<String>,
    /// Newest first.
    pub releases: Vec<Release>,
    /// Largest first.
    pub languages: Vec<LanguageShare>,
    pub languages_total_size: u64,
}

impl RepoSnapshot {
    pub fn latest_release(&self) -> Option<&Release> {
        self.releases.first()
    }

    /// Repository name without the owner.
    pub fn name(&self) -> &str {
        self.name_with_owner
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.name_with_owner)
    }
}

/// GraphQL `rateLimit` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub limit: u32,
    pub cost: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

// --- raw GraphQL shapes ---

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryData {
    pub repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RepositoryNode {
    name_with_owner: String,
    description: Option<String>,
    url: String,
    stargazer_count: u64,
    fork_count: u64,
    pushed_at: Option<DateTime<Utc>>,
    default_branch_ref: Option<NameNode>,
    owner: OwnerNode,
    license_info: Option<NameNode>,
    issues: Option<CountNode>,
    repository_topics: Option<Nodes<TopicNode>>,
    latest_release: Option<Nodes<Release>>,
    languages: Option<LanguagesNode>,
}

#[derive(Debug, Deserialize)]
struct NameNode {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerNode {
    login: String,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountNode {
    total_count: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Nodes<T> {
    pub nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TopicNode {
    topic: NameNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LanguagesNode {
    total_size: u64,
    edges: Vec<LanguageEdge>,
}

#[derive(Debug, Deserialize)]
struct LanguageEdge {
    size: u64,
    node: NameNode,
}

impl From<RepositoryNode> for RepoSnapshot {
    fn from(node: RepositoryNode) -> Self {
        let (languages, languages_total_size) = match node.languages {
            Some(l) => (
                l.edges
                    .into_iter()
                    .map(|e| LanguageShare {
                        name: e.node.name,
                        size: e.size,
                    })
                    .collect(),
                l.total_size,
            ),
            None => (Vec::new(), 0),
        };

        Self {
            name_with_owner: node.name_with_owner,
            description: node.description.filter(|d| !d.trim().is_empty()),
            url: node.url,
            stargazer_count: node.stargazer_count,
            fork_count: node.fork_count,
            open_issues: node.issues.map(|i| i.total_count).unwrap_or(0),
            pushed_at: node.pushed_at,
            default_branch: node
                .default_branch_ref
                .map(|b| b.name)
                .unwrap_or_else(|| "main".to_string()),
            owner_login: node.owner.login,
            owner_avatar_url: node.owner.avatar_url,
            license: node.license_info.map(|l| l.name),
            topics: node
                .repository_topics
                .map(|t| t.nodes.into_iter().map(|n| n.topic.name).collect())
                .unwrap_or_default(),
            releases: node.latest_release.map(|r| r.nodes).unwrap_or_default(),
            languages,
            languages_total_size,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ViewerLoginData {
    pub viewer: LoginNode,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginNode {
    pub login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RateLimitData {
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadmeResponse {
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_full_name_accepts_owner_and_name() {
        assert_eq!(split_full_name("rust-lang/rust").unwrap(), ("rust-lang", "rust"));
        assert!(split_full_name("no-slash").is_err());
        assert!(split_full_name("/name").is_err());
        assert!(split_full_name("a/b/c").is_err());
    }

    #[test]
    fn repository_node_flattens_into_snapshot() {
        let json = serde_json::json!({
            "repository": {
                "nameWithOwner": "octo/widget",
                "description": "  ",
                "url": "https://github.com/octo/widget",
                "stargazerCount": 1200,
                "forkCount": 30,
                "pushedAt": "2024-05-01T10:00:00Z",
                "defaultBranchRef": { "name": "trunk" },
                "owner": { "login": "octo", "avatarUrl": "https://avatars/octo" },
                "licenseInfo": { "name": "MIT License" },
                "issues": { "totalCount": 4 },
                "repositoryTopics": { "nodes": [ { "topic": { "name": "cli-tool" } } ] },
                "latestRelease": { "nodes": [ {
                    "id": "RE_1",
                    "tagName": "v1.0.0",
                    "url": "https://github.com/octo/widget/releases/tag/v1.0.0",
                    "description": null,
                    "publishedAt": "2024-04-30T08:00:00Z"
                } ] },
                "languages": { "totalSize": 100, "edges": [ { "size": 75, "node": { "name": "Rust" } } ] }
            }
        });

        let data: RepositoryData = serde_json::from_value(json).unwrap();
        let snapshot = RepoSnapshot::from(data.repository.unwrap());

        assert_eq!(snapshot.name(), "widget");
        assert_eq!(snapshot.description, None);
        assert_eq!(snapshot.default_branch, "trunk");
        assert_eq!(snapshot.open_issues, 4);
        assert_eq!(snapshot.topics, vec!["cli-tool".to_string()]);
        assert_eq!(snapshot.latest_release().unwrap().tag_name, "v1.0.0");
        assert_eq!(snapshot.languages[0].name, "Rust");
        assert_eq!(snapshot.languages_total_size, 100);
    }

    #[test]
    fn starred_event_reads_star_json_media_type() {
        let json = r#"[{"starred_at":"2024-01-02T03:04:05Z","repo":{"id":42,"full_name":"a/b"}}]"#;
        let events: Vec<StarredEvent> = serde_json::from_str(json).unwrap();
        assert_eq!(events[0].full_name(), "a/b");
        assert_eq!(events[0].repo.id, 42);
    }
}
