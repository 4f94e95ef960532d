//! Per-destination delivery with layered fallback and self-healing.
//!
//! For each destination:
//! 1. media by URL (photo, video or group)
//! 2. on a content-fetch error, the same media uploaded as bytes
//! 3. plain text with link preview, when media failed or there is none
//!
//! A permanent rejection removes the destination from both sets.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{
    CAPTION_LIMIT, Destination, FailureClass, MessageBody, MessageId, MessagingClient,
    NotificationPayload, TelegramError,
};
use crate::database::models::DestinationSet;
use crate::database::repositories::SettingsRepository;
use crate::media::{MediaItem, MediaKind};
use crate::settings::DestinationVerifier;
use crate::{Error, Result};

const VERIFY_TEXT: &str = "✅ This chat will now receive starcast notifications.";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
    /// Destinations dropped after a permanent error.
    pub removed: Vec<String>,
}

enum Outcome {
    Delivered,
    Failed,
    Removed(String),
}

pub struct DestinationFanout {
    client: Arc<dyn MessagingClient>,
    settings: Arc<dyn SettingsRepository>,
}

impl DestinationFanout {
    pub fn new(client: Arc<dyn MessagingClient>, settings: Arc<dyn SettingsRepository>) -> Self {
        Self { client, settings }
    }

    /// Deliver to every destination concurrently. Never fails as a whole.
    pub async fn deliver(&self, payload: &NotificationPayload) -> FanoutReport {
        let body = payload.body();
        let sends = payload
            .destinations
            .iter()
            .map(|raw| self.deliver_to(raw, payload, &body));

        let mut report = FanoutReport::default();
        for outcome in join_all(sends).await {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Removed(dest) => report.removed.push(dest),
            }
        }
        report
    }

    async fn deliver_to(&self, raw: &str, payload: &NotificationPayload, body: &MessageBody) -> Outcome {
        let dest = match Destination::parse(raw) {
            Ok(dest) => dest,
            Err(e) => {
                warn!(destination = %raw, error = %e, "Skipping unparseable destination");
                return Outcome::Failed;
            }
        };

        match self.send_layered(&dest, &payload.media, body).await {
            Ok(()) => {
                debug!(destination = %raw, "Notification delivered");
                Outcome::Delivered
            }
            Err(e) if e.is_permanent() => {
                warn!(destination = %raw, error = %e, "Permanent error for destination, removing");
                self.remove_everywhere(raw).await;
                Outcome::Removed(raw.to_string())
            }
            Err(e) => {
                warn!(destination = %raw, error = %e, "Failed to deliver notification");
                Outcome::Failed
            }
        }
    }

    async fn send_layered(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
    ) -> std::result::Result<(), TelegramError> {
        let caption_fits = body.text.chars().count() <= CAPTION_LIMIT;
        if !media.is_empty() && !caption_fits {
            debug!(destination = %dest, "Caption too long for media, sending text only");
        }

        if !media.is_empty() && caption_fits {
            match self.send_media(dest, media, body, false).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) if e.class() == FailureClass::ContentFetch => {
                    debug!(destination = %dest, error = %e, "Telegram could not fetch media, uploading");
                    match self.send_media(dest, media, body, true).await {
                        Ok(_) => return Ok(()),
                        Err(e) if e.is_permanent() => return Err(e),
                        Err(e) => {
                            warn!(destination = %dest, error = %e, "Media upload failed, falling back to text")
                        }
                    }
                }
                Err(e) => {
                    warn!(destination = %dest, error = %e, "Media send failed, falling back to text")
                }
            }
        }

        self.client.send_text(dest, body).await.map(|_| ())
    }

    async fn send_media(
        &self,
        dest: &Destination,
        media: &[MediaItem],
        body: &MessageBody,
        upload: bool,
    ) -> std::result::Result<MessageId, TelegramError> {
        match (media, upload) {
            ([single], false) => match single.kind {
                MediaKind::Photo => self.client.send_photo(dest, &single.url, body).await,
                MediaKind::Video => self.client.send_video(dest, &single.url, body).await,
            },
            ([single], true) => match single.kind {
                MediaKind::Photo => self.client.upload_photo(dest, &single.url, body).await,
                MediaKind::Video => self.client.upload_video(dest, &single.url, body).await,
            },
            (many, false) => self.client.send_media_group(dest, many, body).await,
            (many, true) => self.client.upload_media_group(dest, many, body).await,
        }
    }

    async fn remove_everywhere(&self, raw: &str) {
        for set in [DestinationSet::Star, DestinationSet::Release] {
            match self.settings.remove_destination(set, raw).await {
                Ok(true) => info!(destination = %raw, set = %set, "Destination removed"),
                Ok(false) => {}
                Err(e) => warn!(destination = %raw, set = %set, error = %e, "Failed to remove destination"),
            }
        }
    }
}

#[async_trait]
impl DestinationVerifier for DestinationFanout {
    /// Post a short message and delete it again.
    async fn verify(&self, destination: &Destination) -> Result<()> {
        let body = MessageBody {
            text: VERIFY_TEXT.to_string(),
            action_link: None,
        };
        let message_id = self
            .client
            .send_text(destination, &body)
            .await
            .map_err(|e| Error::validation(format!("cannot post to {destination}: {e}")))?;
        if let Err(e) = self.client.delete_message(destination, message_id).await {
            debug!(destination = %destination, error = %e, "Failed to delete verification message");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeMessenger, MockSettings};

    async fn setup(dests: &[&str]) -> (Arc<FakeMessenger>, Arc<MockSettings>, DestinationFanout) {
        let messenger = Arc::new(FakeMessenger::default());
        let settings = Arc::new(MockSettings::default());
        for dest in dests {
            settings.add_destination(DestinationSet::Star, dest).await.unwrap();
            settings.add_destination(DestinationSet::Release, dest).await.unwrap();
        }
        let fanout = DestinationFanout::new(messenger.clone(), settings.clone());
        (messenger, settings, fanout)
    }

    fn payload(dests: &[&str], media: Vec<MediaItem>) -> NotificationPayload {
        NotificationPayload {
            destinations: dests.iter().map(|d| d.to_string()).collect(),
            caption: "caption".into(),
            media,
            action_link: None,
        }
    }

    #[tokio::test]
    async fn single_photo_goes_by_url() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        let report = fanout
            .deliver(&payload(&["-1"], vec![MediaItem::photo("https://x/p.png")]))
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(messenger.methods_for("-1").await, vec!["send_photo"]);
    }

    #[tokio::test]
    async fn several_items_go_as_a_group() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        let media = vec![MediaItem::photo("https://x/1.png"), MediaItem::video("https://x/2.mp4")];
        fanout.deliver(&payload(&["-1"], media)).await;

        assert_eq!(messenger.methods_for("-1").await, vec!["send_media_group"]);
    }

    #[tokio::test]
    async fn content_fetch_error_retries_as_upload() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        messenger
            .fail("-1", "send_video", "Bad Request: failed to get HTTP URL content")
            .await;

        let report = fanout
            .deliver(&payload(&["-1"], vec![MediaItem::video("https://x/v.mp4")]))
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(messenger.methods_for("-1").await, vec!["send_video", "upload_video"]);
    }

    #[tokio::test]
    async fn failed_upload_falls_back_to_text() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        messenger
            .fail("-1", "send_photo", "Bad Request: wrong type of the web page content")
            .await;
        messenger
            .fail("-1", "upload_photo", "Bad Request: IMAGE_TOO_BIG")
            .await;

        let report = fanout
            .deliver(&payload(&["-1"], vec![MediaItem::photo("https://x/p.png")]))
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(
            messenger.methods_for("-1").await,
            vec!["send_photo", "upload_photo", "send_text"]
        );
    }

    #[tokio::test]
    async fn no_media_sends_text_only() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        fanout.deliver(&payload(&["-1"], Vec::new())).await;

        let calls = messenger.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "send_text");
        assert_eq!(calls[0].text, "caption");
    }

    #[tokio::test]
    async fn long_caption_skips_media() {
        let (messenger, _settings, fanout) = setup(&["-1"]).await;
        let mut p = payload(&["-1"], vec![MediaItem::photo("https://x/p.png")]);
        p.caption = "x".repeat(CAPTION_LIMIT + 1);

        fanout.deliver(&p).await;
        assert_eq!(messenger.methods_for("-1").await, vec!["send_text"]);
    }

    #[tokio::test]
    async fn permanent_error_removes_destination_from_both_sets() {
        let (messenger, settings, fanout) = setup(&["-1", "-2/5"]).await;
        messenger.fail("-2/5", "*", "Forbidden: bot was kicked from the group chat").await;

        let report = fanout
            .deliver(&payload(&["-1", "-2/5"], vec![MediaItem::photo("https://x/p.png")]))
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, vec!["-2/5"]);
        // No text fallback after a permanent rejection.
        assert_eq!(messenger.methods_for("-2/5").await, vec!["send_photo"]);
        assert_eq!(settings.destinations(DestinationSet::Star).await.unwrap(), vec!["-1"]);
        assert_eq!(settings.destinations(DestinationSet::Release).await.unwrap(), vec!["-1"]);
    }

    #[tokio::test]
    async fn transient_error_keeps_destination() {
        let (messenger, settings, fanout) = setup(&["-1"]).await;
        messenger.fail("-1", "*", "Bad Request: message is too long").await;

        let report = fanout.deliver(&payload(&["-1"], Vec::new())).await;

        assert_eq!(report.failed, 1);
        assert!(report.removed.is_empty());
        assert_eq!(settings.destinations(DestinationSet::Star).await.unwrap(), vec!["-1"]);
    }

    #[tokio::test]
    async fn verification_posts_then_deletes() {
        let (messenger, _settings, fanout) = setup(&[]).await;
        let dest = Destination::parse("-100/3").unwrap();

        fanout.verify(&dest).await.unwrap();
        assert_eq!(messenger.methods_for("-100/3").await, vec!["send_text", "delete_message"]);

        messenger.fail("-9", "send_text", "Bad Request: chat not found").await;
        let err = fanout.verify(&Destination::parse("-9").unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
