//! Gemini `generateContent` client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    EnrichmentClient, EnrichmentError, MAX_SELECTED_MEDIA, MIN_README_LEN, README_PROMPT_LIMIT,
    RetryPolicy, retry_on_quota,
};
use crate::config::GeminiConfig;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

const SUMMARY_PROMPT: &str = "\
You are an expert technical writer, skilled at creating clear and concise software summaries. \
Analyze the following README and write a summary for a preview card in a messaging app.

Rules:
1. Start with the project's main purpose in one sentence, then list 2-4 key features.
2. Ignore installation, configuration, donation, licensing and usage-example sections.
3. Keep the original tone. No marketing language.
4. Plain text only, with line breaks for readability. No Markdown or HTML.
5. The output must not exceed 680 characters.

README:
---
";

const MEDIA_PROMPT: &str = "\
You are a UI/UX analyst. Select the 1 to 3 media files from the list below that best show \
what this software project looks like or does, based on its README.

Priorities:
1. Media under headings such as Preview, Demo, Screenshots, Showcase, Features or How it works.
2. Prefer videos (.mp4, .webm) over images.
3. Ignore media from Sponsors, Contributors, License or Badges sections.
4. Avoid file-hosting sites (MediaFire, Dropbox, Google Drive, Mega). Prefer direct media links.

Respond with a single JSON object matching {\"selected_media\": [{\"url\": \"string\"}]} \
and nothing else.

README:
---
";

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaSelection {
    selected_media: Vec<SelectedMedia>,
}

#[derive(Debug, Deserialize)]
struct SelectedMedia {
    url: String,
}

pub struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
    policy: RetryPolicy,
}

impl GeminiClient {
    pub fn new(client: Client, config: &GeminiConfig, policy: RetryPolicy) -> Self {
        let base = config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        info!(model = %config.model, "Initializing Gemini enrichment client");
        Self {
            client,
            endpoint: format!("{base}/v1beta/models/{}:generateContent", config.model),
            api_key: config.api_key.clone(),
            policy,
        }
    }

    async fn generate(&self, prompt: &str, json_output: bool) -> Result<String, EnrichmentError> {
        let safety: Vec<Value> = SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect();
        let mut body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "safetySettings": safety,
        });
        if json_output {
            body["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || body.contains("RESOURCE_EXHAUSTED") {
                return Err(EnrichmentError::QuotaExceeded(body));
            }
            return Err(EnrichmentError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(EnrichmentError::Malformed("empty candidate".into()));
        }
        Ok(text)
    }
}

fn readme_excerpt(readme: &str) -> String {
    readme.chars().take(README_PROMPT_LIMIT).collect()
}

#[async_trait]
impl EnrichmentClient for GeminiClient {
    async fn summarize(&self, readme: &str) -> Option<String> {
        if readme.chars().count() < MIN_README_LEN {
            debug!("README too short to summarize");
            return None;
        }

        let prompt = format!("{SUMMARY_PROMPT}{}\n---\n", readme_excerpt(readme));
        match retry_on_quota(&self.policy, "summarize", || self.generate(&prompt, false)).await {
            Ok(text) => {
                let summary = text.trim().trim_matches('"').trim();
                (!summary.is_empty()).then(|| summary.to_string())
            }
            Err(e) => {
                warn!(error = %e, "README summarization failed");
                None
            }
        }
    }

    async fn select_media(&self, readme: &str, candidates: &[String]) -> Vec<String> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let list: Vec<String> = candidates.iter().map(|url| format!("- {url}")).collect();
        let prompt = format!(
            "{MEDIA_PROMPT}{}\n---\n\nAvailable media URLs:\n---\n{}\n---\n",
            readme_excerpt(readme),
            list.join("\n")
        );

        let prompt = prompt.as_str();
        let outcome = retry_on_quota(&self.policy, "select_media", move || async move {
            let text = self.generate(prompt, true).await?;
            serde_json::from_str::<MediaSelection>(text.trim())
                .map_err(|e| EnrichmentError::Malformed(e.to_string()))
        })
        .await;

        match outcome {
            Ok(selection) => {
                let urls: Vec<String> = selection
                    .selected_media
                    .into_iter()
                    .map(|m| m.url)
                    .take(MAX_SELECTED_MEDIA)
                    .collect();
                info!(count = urls.len(), "Enrichment selected preview media");
                urls
            }
            Err(e) => {
                warn!(error = %e, "Media selection failed");
                Vec::new()
            }
        }
    }
}
