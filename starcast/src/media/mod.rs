//! Preview media: pulling candidate URLs out of a README and turning them
//! into something Telegram can send.
//!
//! Resolution order:
//! 1. drop anything matching [`EXCLUDED_KEYWORDS`]
//! 2. accept first-party GitHub asset hosts as-is, classified by extension
//! 3. HEAD-probe everything else and keep 200 responses with an image or
//!    video content type
//!
//! When nothing survives, callers fall back to the page's `og:image`.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Substrings that mark a URL as decoration rather than a preview.
pub const EXCLUDED_KEYWORDS: &[&str] = &[
    "badge",
    "sponsor",
    "donate",
    "logo",
    "gif",
    ".svg",
    "extension",
    "contributor",
    "shields.io",
    "badgen.net",
    "vercel.svg",
    "netlify.com/img/deploy",
    "app.codacy.com",
    "lgtm.com",
];

const TRUSTED_HOSTS: &[&str] = &[
    "raw.githubusercontent.com",
    "user-images.githubusercontent.com",
    "private-user-images.githubusercontent.com",
    "camo.githubusercontent.com",
];

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "m4v"];

static MEDIA_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"!\[[^\]]*\]\(\s*([^)\s]+)").expect("markdown image regex"),
        Regex::new(r#"(?i)<img[^>]*?\ssrc\s*=\s*['"]([^'"]+)['"]"#).expect("img regex"),
        Regex::new(r#"(?i)<video[^>]*?\ssrc\s*=\s*['"]([^'"]+)['"]"#).expect("video regex"),
    ]
});

static OG_IMAGE_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r#"(?i)<meta[^>]*?property\s*=\s*["']og:image["'][^>]*?content\s*=\s*["']([^"']+)["']"#)
            .expect("og:image regex"),
        Regex::new(r#"(?i)<meta[^>]*?content\s*=\s*["']([^"']+)["'][^>]*?property\s*=\s*["']og:image["']"#)
            .expect("og:image reversed regex"),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: String,
}

impl MediaItem {
    pub fn photo(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Photo,
            url: url.into(),
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            url: url.into(),
        }
    }
}

pub fn is_excluded(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    EXCLUDED_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// First-party GitHub asset hosts that never need a probe.
pub fn is_trusted(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    match parsed.host_str() {
        Some("github.com") => parsed.path().starts_with("/user-attachments/assets"),
        Some(host) => TRUSTED_HOSTS.contains(&host),
        None => false,
    }
}

/// Classify by file extension; anything unknown is a photo.
pub fn kind_from_extension(url: &str) -> MediaKind {
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    let is_video = path
        .rsplit_once('.')
        .is_some_and(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext));
    if is_video {
        MediaKind::Video
    } else {
        MediaKind::Photo
    }
}

/// Absolute, de-duplicated media URLs referenced by a README, in document
/// order. Blob links become raw links and relative paths are resolved
/// against the default branch.
pub fn extract_media_urls(readme: &str, repo_full_name: &str, default_branch: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = MEDIA_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(readme))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str()))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, raw)| absolutize(raw, repo_full_name, default_branch))
        .filter(|url| !is_excluded(url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn absolutize(raw: &str, repo_full_name: &str, default_branch: &str) -> Option<String> {
    let url = raw.split('#').next().unwrap_or_default().trim();
    if url.is_empty() || url.starts_with("data:") {
        return None;
    }
    if url.contains("github.com") && url.contains("/blob/") {
        return Some(
            url.replacen("github.com", "raw.githubusercontent.com", 1)
                .replacen("/blob/", "/", 1),
        );
    }
    if let Some(rest) = url.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(url.to_string());
    }
    let path = url.trim_start_matches(['.', '/']);
    Some(format!(
        "https://raw.githubusercontent.com/{repo_full_name}/{default_branch}/{path}"
    ))
}

/// Turns candidate URLs into sendable media.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Surviving candidates, in input order.
    async fn resolve(&self, candidates: &[String]) -> Vec<MediaItem>;

    /// `og:image` of an HTML page.
    async fn social_preview(&self, page_url: &str) -> Option<String>;

    /// [`resolve`](Self::resolve), falling back to the page's preview image.
    async fn resolve_or_preview(&self, candidates: &[String], page_url: &str) -> Vec<MediaItem> {
        let media = self.resolve(candidates).await;
        if !media.is_empty() {
            return media;
        }
        match self.social_preview(page_url).await {
            Some(image) => vec![MediaItem::photo(image)],
            None => Vec::new(),
        }
    }
}

pub struct MediaResolver {
    client: Client,
    probe_timeout: Duration,
}

impl MediaResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// HEAD the URL, following redirects. Only a 200 with an image or video
    /// content type yields media, pointing at the final URL.
    pub async fn probe(&self, url: &str) -> Option<MediaItem> {
        let response = match self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Media probe failed");
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!(url = %url, status = %response.status(), "Media probe rejected");
            return None;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let final_url = response.url().to_string();

        if content_type.starts_with("video/") {
            Some(MediaItem::video(final_url))
        } else if content_type.starts_with("image/") {
            Some(MediaItem::photo(final_url))
        } else {
            debug!(url = %url, content_type = %content_type, "Not a media content type");
            None
        }
    }
}

#[async_trait]
impl MediaSource for MediaResolver {
    async fn resolve(&self, candidates: &[String]) -> Vec<MediaItem> {
        let checks = candidates
            .iter()
            .filter(|url| !is_excluded(url))
            .map(|url| async move {
                if is_trusted(url) {
                    Some(MediaItem {
                        kind: kind_from_extension(url),
                        url: url.clone(),
                    })
                } else {
                    self.probe(url).await
                }
            });

        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn social_preview(&self, page_url: &str) -> Option<String> {
        let response = self
            .client
            .get(page_url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .inspect_err(|e| debug!(url = %page_url, error = %e, "Preview scrape failed"))
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let html = response.text().await.ok()?;

        OG_IMAGE_PATTERNS
            .iter()
            .find_map(|re| re.captures(&html))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().replace("&amp;", "&"))
    }
}
