//! Polling monitors for new stars and new releases.
//!
//! Both monitors share one loop driver:
//! - run a cycle
//! - sleep the runtime interval, or the error cool-down after a failure
//! - restart early on a settings wake, stop on cancellation

mod release;
mod star;

pub use release::ReleaseMonitor;
pub use star::StarMonitor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::MonitorKind;
use crate::database::repositories::SettingsRepository;
use crate::settings::WakeReceiver;

/// Wait after a failed cycle before trying again.
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(120);

/// One poll of a monitor.
#[async_trait]
pub trait PollCycle: Send + Sync {
    fn kind(&self) -> MonitorKind;
    async fn run_cycle(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MonitorLoopConfig {
    /// Used when no interval is stored in settings.
    pub default_interval: Duration,
    pub error_cooldown: Duration,
}

/// Drive `cycle` until `cancel` fires.
pub async fn run_monitor(
    cycle: Arc<dyn PollCycle>,
    settings: Arc<dyn SettingsRepository>,
    config: MonitorLoopConfig,
    mut wake: WakeReceiver,
    cancel: CancellationToken,
) {
    let kind = cycle.kind();
    info!(monitor = %kind, "Monitor loop started");

    while !cancel.is_cancelled() {
        let wait = match cycle.run_cycle().await {
            Ok(()) => match settings.interval(kind).await {
                Ok(stored) => stored.unwrap_or(config.default_interval),
                Err(e) => {
                    warn!(monitor = %kind, error = %e, "Failed to read interval, using default");
                    config.default_interval
                }
            },
            Err(e) => {
                warn!(
                    monitor = %kind,
                    error = %e,
                    cooldown_secs = config.error_cooldown.as_secs(),
                    "Monitor cycle failed"
                );
                config.error_cooldown
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = wake.woken() => {
                debug!(monitor = %kind, "Settings changed, restarting cycle");
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!(monitor = %kind, "Monitor loop stopped");
}

/// Shared precondition: monitoring is not paused and a token is stored.
pub(crate) async fn monitoring_enabled(settings: &dyn SettingsRepository) -> Result<bool> {
    if settings.is_paused().await? {
        debug!("Monitoring is paused, skipping cycle");
        return Ok(false);
    }
    if !settings.has_token().await? {
        debug!("No GitHub token stored, skipping cycle");
        return Ok(false);
    }
    Ok(true)
}
