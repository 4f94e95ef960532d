//! Tracing setup: reloadable filter, console and daily-rolling file output,
//! and an in-process broadcast of every event.
//!
//! The broadcast feeds the optional Telegram log channel forwarder, which
//! posts WARN and ERROR events to a chat.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Event, Subscriber, debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::notification::{Destination, MESSAGE_LIMIT, MessageBody, MessagingClient};
use crate::utils::text::escape_html;

pub const DEFAULT_LOG_FILTER: &str = "starcast=info,github_api=info,sqlx=warn,reqwest=warn";

const LOG_FILE_PREFIX: &str = "starcast.log";
const LOG_RETENTION_DAYS: i64 = 7;
const LOG_BROADCAST_CAPACITY: usize = 1024;
const FORWARD_HEADER: &str = "<b>⭕ ERROR ⭕</b>\n\n";

/// Events from these targets are never forwarded, so a failing send cannot
/// feed itself.
const FORWARD_EXCLUDED_TARGETS: &[&str] = &["starcast::logging", "starcast::notification::telegram"];

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// One log line as seen by broadcast subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    /// Message followed by `key=value` pairs of the other fields.
    pub message: String,
}

impl LogEvent {
    fn is_forwardable(&self) -> bool {
        matches!(self.level.as_str(), "WARN" | "ERROR")
            && !FORWARD_EXCLUDED_TARGETS
                .iter()
                .any(|t| self.target.starts_with(t))
    }
}

pub struct LoggingConfig {
    handle: FilterHandle,
    log_tx: broadcast::Sender<LogEvent>,
    log_dir: PathBuf,
}

impl LoggingConfig {
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    /// Delete rotated log files older than a week, once a day.
    pub fn start_retention_cleanup(&self, cancel: CancellationToken) {
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            let every = Duration::from_secs(24 * 60 * 60);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS, Utc::now()).await {
                            warn!(error = %e, "Failed to clean up old logs");
                        }
                    }
                }
            }
        });
    }

    /// Forward WARN+ events to a Telegram chat until cancelled.
    pub fn start_channel_forwarder(
        &self,
        client: Arc<dyn MessagingClient>,
        channel: Destination,
        cancel: CancellationToken,
    ) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            info!(channel = %channel, "Log channel forwarder started");
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Log forwarder lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !event.is_forwardable() {
                    continue;
                }

                let body = MessageBody {
                    text: forward_text(&event),
                    action_link: None,
                };
                if let Err(e) = client.send_text(&channel, &body).await {
                    debug!(error = %e, "Failed to forward log event");
                }
            }
        });
    }
}

/// Telegram text for a forwarded event, within the message limit.
fn forward_text(event: &LogEvent) -> String {
    let line = format!("{} {}: {}", event.level, event.target, event.message);
    let overhead = FORWARD_HEADER.chars().count() + "<pre></pre>".len();
    let budget = MESSAGE_LIMIT.saturating_sub(overhead);

    let escaped = escape_html(&line);
    if escaped.chars().count() <= budget {
        return format!("{FORWARD_HEADER}<pre>{escaped}</pre>");
    }

    // Escape char by char so an entity is never split.
    let mut out = String::new();
    let mut used = 0;
    let mut buf = [0u8; 4];
    for c in line.chars() {
        let piece = escape_html(c.encode_utf8(&mut buf));
        let len = piece.chars().count();
        if used + len > budget - 3 {
            break;
        }
        out.push_str(&piece);
        used += len;
    }
    format!("{FORWARD_HEADER}<pre>{out}...</pre>")
}

async fn cleanup_old_logs(
    log_dir: &Path,
    retention_days: i64,
    now: DateTime<Utc>,
) -> std::io::Result<usize> {
    let cutoff = (now - chrono::Duration::days(retention_days)).date_naive();
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

pub(crate) struct BroadcastLayer {
    tx: broadcast::Sender<LogEvent>,
}

impl BroadcastLayer {
    pub(crate) fn new(tx: broadcast::Sender<LogEvent>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for BroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.send(LogEvent {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl FieldVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), value);
        }
    }
}

/// Install the global subscriber. Keep the guard alive for the whole run.
pub fn init_logging(log_dir: &Path) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(BroadcastLayer::new(log_tx.clone()))
        .try_init()
        .map_err(|e| crate::Error::Other(format!("failed to install tracing subscriber: {e}")))?;

    let config = Arc::new(LoggingConfig {
        handle,
        log_tx,
        log_dir: log_dir.to_path_buf(),
    });
    Ok((config, guard))
}
