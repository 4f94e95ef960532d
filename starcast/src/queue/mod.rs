//! Delivery queue: unbounded FIFO of [`Event`]s with many producers and one
//! paced consumer.
//!
//! Every pushed item bumps a pending counter that is only decremented once
//! the consumer has finished with it (success, error or panic), so
//! [`DeliveryQueue::join`] resolves exactly when the queue is drained.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::Event;
use crate::{Error, Result};

/// Consumer poll timeout. Short so shutdown is noticed promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles one event. Implemented by the notification orchestrator.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Event>,
    pending: Arc<watch::Sender<usize>>,
}

/// The single receiving end, handed to [`run_consumer`].
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
    pending: Arc<watch::Sender<usize>>,
}

pub fn channel() -> (DeliveryQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (pending, _) = watch::channel(0usize);
    let pending = Arc::new(pending);
    (
        DeliveryQueue {
            tx,
            pending: pending.clone(),
        },
        QueueReceiver { rx, pending },
    )
}

impl DeliveryQueue {
    pub fn push(&self, event: Event) -> Result<()> {
        self.pending.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(Error::Other(format!(
                "delivery queue closed, dropped {event}"
            )));
        }
        Ok(())
    }

    /// Items pushed but not yet fully processed.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every pushed item has been processed.
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this only fails if it is dropped.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl QueueReceiver {
    /// Take the next item without acking it.
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Decrements the pending count when dropped.
struct AckGuard<'a> {
    pending: &'a watch::Sender<usize>,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_timeout: Duration,
    /// Pause before every item except the first of a burst.
    pub item_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: POLL_TIMEOUT,
            item_delay: Duration::from_secs(5),
        }
    }
}

/// Consume events until `cancel` fires or every producer is gone.
pub async fn run_consumer(
    mut receiver: QueueReceiver,
    handler: Arc<dyn EventHandler>,
    config: ConsumerConfig,
    cancel: CancellationToken,
) {
    info!("Delivery consumer started");
    let mut in_burst = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(config.poll_timeout, receiver.rx.recv()) => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("All producers dropped");
                break;
            }
            Err(_) => {
                in_burst = false;
                continue;
            }
        };

        let _ack = AckGuard {
            pending: &receiver.pending,
        };

        if in_burst && !config.item_delay.is_zero() {
            tokio::time::sleep(config.item_delay).await;
        }
        in_burst = true;

        debug!(event = %event, "Processing event");
        match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event = %event, error = %e, "Failed to process event"),
            Err(_) => error!(event = %event, "Event handler panicked"),
        }
    }

    info!("Delivery consumer stopped");
}
