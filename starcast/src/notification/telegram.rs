//! Telegram Bot API client.
//!
//! Every call goes through one request helper that honours
//! `parameters.retry_after` on 429 responses. Error descriptions are kept
//! verbatim so [`TelegramError::class`] can tell permanent destination
//! failures from media that Telegram could not fetch.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Destination, MessageBody, MessageId, MessagingClient};
use crate::media::{MediaItem, MediaKind};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Descriptions meaning the destination will never accept messages again.
const PERMANENT_ERRORS: &[&str] = &[
    "chat not found",
    "bot was kicked",
    "bot was blocked by the user",
    "user is deactivated",
    "chat was deleted",
    "bot is not a member",
];

/// Descriptions meaning Telegram could not fetch or accept media by URL.
const CONTENT_FETCH_ERRORS: &[&str] = &[
    "failed to get http url content",
    "wrong file identifier/http url specified",
    "wrong type of the web page content",
    "webpage_media_empty",
    "webpage_curl_failed",
    "failed to send message #",
    "wrong remote file identifier",
    "photo_invalid_dimensions",
    "image_process_failed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// Remove the destination.
    Permanent,
    /// Retry with an upload.
    ContentFetch,
    RateLimited,
    Other,
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram API error {code}: {description}")]
    Api {
        code: u16,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("Telegram request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("media download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("unexpected Telegram response: {0}")]
    Decode(String),
}

impl TelegramError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Api {
                code, description, ..
            } => {
                let description = description.to_ascii_lowercase();
                if PERMANENT_ERRORS.iter().any(|p| description.contains(p)) {
                    FailureClass::Permanent
                } else if *code == 429 {
                    FailureClass::RateLimited
                } else if CONTENT_FETCH_ERRORS.iter().any(|p| description.contains(p)) {
                    FailureClass::ContentFetch
                } else {
                    FailureClass::Other
                }
            }
            Self::Request(_) | Self::Download { .. } | Self::Decode(_) => FailureClass::Other,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Permanent
    }
}

type TgResult<T> = std::result::Result<T, TelegramError>;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// `message_id` of a single message, or of the first message of a group.
fn message_id(result: Option<Value>) -> TgResult<MessageId> {
    let result = result.ok_or_else(|| TelegramError::Decode("missing result".into()))?;
    let first = match &result {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    first
        .and_then(|m| m.get("message_id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| TelegramError::Decode("missing message_id".into()))
}

enum Request<'a> {
    Json(&'a Value),
    /// Rebuilt on every attempt since forms are consumed by sending.
    Multipart(&'a (dyn Fn() -> Form + Send + Sync)),
}

pub struct TelegramBotClient {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl TelegramBotClient {
    pub fn new(client: Client, bot_token: impl Into<String>, api_base: Option<&str>) -> Self {
        Self {
            client,
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            bot_token: bot_token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Send request with rate limit handling.
    async fn call(&self, method: &str, request: Request<'_>) -> TgResult<Option<Value>> {
        let url = self.method_url(method);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let builder = self.client.post(&url);
            let builder = match &request {
                Request::Json(payload) => builder.json(payload),
                Request::Multipart(build) => builder.multipart(build()),
            };
            let response = builder.send().await?;
            let status = response.status();
            let body: ApiResponse = response.json().await.map_err(|e| {
                TelegramError::Decode(format!("{method} returned {status} with unreadable body: {e}"))
            })?;

            if body.ok {
                return Ok(body.result);
            }

            let error = TelegramError::Api {
                code: body.error_code.unwrap_or(status.as_u16()),
                description: body.description.unwrap_or_default(),
                retry_after: body.parameters.and_then(|p| p.retry_after),
            };

            if let TelegramError::Api {
                code: 429,
                retry_after,
                ..
            } = &error
            {
                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Telegram rate limit: max retries ({}) exceeded for {}, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES, method, retry_after
                    );
                    return Err(error);
                }
                let wait = Duration::from_secs(retry_after.unwrap_or(1));
                debug!(
                    "Telegram rate limited (429) on {}, waiting {:?} before retry (attempt {}/{})",
                    method, wait, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            return Err(error);
        }
    }

    async fn download(&self, url: &str) -> TgResult<Bytes> {
        let fail = |reason: String| TelegramError::Download {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }
        response.bytes().await.map_err(|e| fail(e.to_string()))
    }

    fn base_fields(dest: &Destination, body: &MessageBody) -> serde_json::Map<String, Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("chat_id".into(), json!(dest.chat_id));
        if let Some(thread) = dest.thread_id {
            fields.insert("message_thread_id".into(), json!(thread));
        }
        fields.insert("parse_mode".into(), json!("HTML"));
        if let Some(link) = &body.action_link {
            fields.insert(
                "reply_markup".into(),
                json!({ "inline_keyboard": [[{ "text": link.label, "url": link.url }]] }),
            );
        }
        fields
    }

    async fn send_single(
        &self,
        method: &str,
        field: &str,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        let mut payload = Self::base_fields(dest, body);
        payload.insert(field.into(), json!(url));
        payload.insert("caption".into(), json!(body.text));
        let payload = Value::Object(payload);
        message_id(self.call(method, Request::Json(&payload)).await?)
    }

    async fn upload_single(
        &self,
        method: &str,
        field: &'static str,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        let bytes = self.download(url).await?;
        let fields = Self::base_fields(dest, body);
        let caption = body.text.clone();
        let file_name = file_name_for(url, field);

        let build = move || {
            let form = text_fields(Form::new(), &fields).text("caption", caption.clone());
            form.part(field, Part::stream(bytes.clone()).file_name(file_name.clone()))
        };
        message_id(self.call(method, Request::Multipart(&build)).await?)
    }
}

fn text_fields(mut form: Form, fields: &serde_json::Map<String, Value>) -> Form {
    for (key, value) in fields {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        form = form.text(key.clone(), text);
    }
    form
}

fn file_name_for(url: &str, field: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| name.contains('.'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{field}.bin"))
}

fn group_entry(item: &MediaItem, media: String, caption: Option<&str>) -> Value {
    let kind = match item.kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
    };
    let mut entry = json!({ "type": kind, "media": media });
    if let Some(caption) = caption {
        entry["caption"] = json!(caption);
        entry["parse_mode"] = json!("HTML");
    }
    entry
}

#[async_trait]
impl MessagingClient for TelegramBotClient {
    async fn send_text(&self, dest: &Destination, body: &MessageBody) -> TgResult<MessageId> {
        let mut payload = Self::base_fields(dest, body);
        payload.insert("text".into(), json!(body.text));
        payload.insert(
            "link_preview_options".into(),
            json!({ "is_disabled": false }),
        );
        let payload = Value::Object(payload);
        message_id(self.call("sendMessage", Request::Json(&payload)).await?)
    }

    async fn send_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        self.send_single("sendPhoto", "photo", dest, url, body).await
    }

    async fn send_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        self.send_single("sendVideo", "video", dest, url, body).await
    }

    async fn send_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        let entries: Vec<Value> = media
            .iter()
            .enumerate()
            .map(|(i, item)| group_entry(item, item.url.clone(), (i == 0).then_some(body.text.as_str())))
            .collect();
        let mut payload = serde_json::Map::new();
        payload.insert("chat_id".into(), json!(dest.chat_id));
        if let Some(thread) = dest.thread_id {
            payload.insert("message_thread_id".into(), json!(thread));
        }
        payload.insert("media".into(), Value::Array(entries));
        let payload = Value::Object(payload);
        message_id(self.call("sendMediaGroup", Request::Json(&payload)).await?)
    }

    async fn delete_message(&self, dest: &Destination, message_id: MessageId) -> TgResult<()> {
        let payload = json!({ "chat_id": dest.chat_id, "message_id": message_id });
        self.call("deleteMessage", Request::Json(&payload)).await?;
        Ok(())
    }

    async fn upload_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        self.upload_single("sendPhoto", "photo", dest, url, body).await
    }

    async fn upload_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        self.upload_single("sendVideo", "video", dest, url, body).await
    }

    async fn upload_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> TgResult<MessageId> {
        let mut files = Vec::with_capacity(media.len());
        for (i, item) in media.iter().enumerate() {
            let bytes = self.download(&item.url).await?;
            files.push((format!("file{i}"), file_name_for(&item.url, "media"), bytes));
        }

        let entries: Vec<Value> = media
            .iter()
            .zip(&files)
            .enumerate()
            .map(|(i, (item, (key, _, _)))| {
                group_entry(item, format!("attach://{key}"), (i == 0).then_some(body.text.as_str()))
            })
            .collect();
        let media_json = Value::Array(entries).to_string();
        let chat_id = dest.chat_id.clone();
        let thread_id = dest.thread_id;

        let build = move || {
            let mut form = Form::new()
                .text("chat_id", chat_id.clone())
                .text("media", media_json.clone());
            if let Some(thread) = thread_id {
                form = form.text("message_thread_id", thread.to_string());
            }
            for (key, name, bytes) in &files {
                form = form.part(key.clone(), Part::stream(bytes.clone()).file_name(name.clone()));
            }
            form
        };
        message_id(self.call("sendMediaGroup", Request::Multipart(&build)).await?)
    }
}
