//! Turning events into Telegram messages and getting them delivered.

pub mod fanout;
pub mod format;
pub mod orchestrator;
pub mod telegram;

pub use fanout::{DestinationFanout, FanoutReport};
pub use orchestrator::{NotificationOrchestrator, OrchestratorConfig};
pub use telegram::{FailureClass, TelegramBotClient, TelegramError};

use std::fmt;

use async_trait::async_trait;

use crate::media::MediaItem;
use crate::{Error, Result};

/// Telegram caption limit for photos, videos and media groups.
pub const CAPTION_LIMIT: usize = 1024;
/// Telegram `sendMessage` text limit.
pub const MESSAGE_LIMIT: usize = 4096;

/// A chat, optionally narrowed to a forum topic. Written `chat` or
/// `chat/thread`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: String,
    pub thread_id: Option<i64>,
}

impl Destination {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (chat, thread) = match raw.split_once('/') {
            Some((chat, thread)) => (chat.trim(), Some(thread.trim())),
            None => (raw, None),
        };

        let valid_chat = chat.parse::<i64>().is_ok()
            || (chat.len() > 1
                && chat.starts_with('@')
                && chat[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        if !valid_chat {
            return Err(Error::validation(format!("invalid chat id in destination '{raw}'")));
        }

        let thread_id = thread
            .map(|t| {
                t.parse::<i64>()
                    .ok()
                    .filter(|id| *id > 0)
                    .ok_or_else(|| Error::validation(format!("invalid thread id in destination '{raw}'")))
            })
            .transpose()?;

        Ok(Self {
            chat_id: chat.to_string(),
            thread_id,
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "{}/{thread}", self.chat_id),
            None => f.write_str(&self.chat_id),
        }
    }
}

/// Inline button under a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLink {
    pub label: String,
    pub url: String,
}

/// Caption plus optional button, shared by every send method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    /// Telegram HTML.
    pub text: String,
    pub action_link: Option<ActionLink>,
}

/// Everything needed to deliver one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// Stored destination strings, exactly as persisted.
    pub destinations: Vec<String>,
    pub caption: String,
    pub media: Vec<MediaItem>,
    pub action_link: Option<ActionLink>,
}

impl NotificationPayload {
    pub fn body(&self) -> MessageBody {
        MessageBody {
            text: self.caption.clone(),
            action_link: self.action_link.clone(),
        }
    }
}

pub type MessageId = i64;

/// Outbound messaging API.
///
/// `send_*` methods pass media by URL and let Telegram fetch it; `upload_*`
/// methods download the bytes first and send them as multipart.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn send_text(
        &self,
        dest: &Destination,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    async fn send_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    async fn send_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    /// Caption goes on the first item. Buttons are not supported on groups.
    async fn send_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    async fn delete_message(
        &self,
        dest: &Destination,
        message_id: MessageId,
    ) -> std::result::Result<(), TelegramError>;

    async fn upload_photo(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    async fn upload_video(
        &self,
        dest: &Destination,
        url: &str,
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;

    async fn upload_media_group(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> std::result::Result<MessageId, TelegramError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_threaded_destinations() {
        let plain = Destination::parse("-1001234").unwrap();
        assert_eq!(plain.chat_id, "-1001234");
        assert_eq!(plain.thread_id, None);

        let threaded = Destination::parse(" -1001234/42 ").unwrap();
        assert_eq!(threaded.thread_id, Some(42));
        assert_eq!(threaded.to_string(), "-1001234/42");

        assert_eq!(Destination::parse("@my_channel").unwrap().to_string(), "@my_channel");
    }

    #[test]
    fn rejects_malformed_destinations() {
        for raw in ["", "abc", "@", "-100/0", "-100/x", "-100/", "@bad name"] {
            assert!(Destination::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }
}
