//! Long-poll workers for the chunk queue and the dead-letter queue.
//!
//! Each poll receives a batch, handles every message on its own task, and joins them all before
//! polling again. Acknowledgement is decided per message by the handler's [`Delivery`].

mod chunk_worker;
mod dead_letter;

pub use chunk_worker::ChunkWorker;
pub use dead_letter::DeadLetterProcessor;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{QueueClient, QueueError, QueueMessage, ReceiveOptions};
use crate::server::monitoring::INGEST_METRICS;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub chunk_queue: String,
    pub dead_letter_queue: String,
    /// Deliveries beyond this count are dead-lettered without processing.
    pub max_receive_count: u32,
    pub receive: ReceiveOptions,
    /// Concurrent poll loops on the chunk queue.
    pub pollers: usize,
    /// Pause after a failed receive call.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            chunk_queue: "csv-ingest".to_string(),
            dead_letter_queue: "csv-ingest-dlq".to_string(),
            max_receive_count: 3,
            receive: ReceiveOptions::default(),
            pollers: 2,
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handled; the message is deleted.
    Acknowledged,
    /// Left on the queue for redelivery after the visibility timeout.
    Retained,
    /// Forwarded to the dead-letter queue; the original is deleted.
    DeadLettered,
    /// Unusable payload; deleted without processing.
    Dropped,
}

impl Delivery {
    pub fn acknowledges(self) -> bool {
        !matches!(self, Delivery::Retained)
    }
}

/// Per-message handling for a poll loop.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, message: &'a QueueMessage) -> BoxFuture<'a, Delivery>;
}

/// Receives one batch from `queue`, handles it concurrently and acknowledges per delivery.
pub async fn poll_once<H: MessageHandler>(
    handler: &Arc<H>,
    client: &QueueClient,
    queue: &str,
    options: ReceiveOptions,
) -> Result<Vec<Delivery>, QueueError> {
    let messages = client.receive(queue, options).await?;
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let mut tasks = JoinSet::new();
    for message in messages {
        let handler = Arc::clone(handler);
        let client = client.clone();
        let queue = queue.to_string();
        if let Some(metrics) = INGEST_METRICS.get() {
            metrics.messages_received_total.inc();
            metrics.messages_in_flight.inc();
        }
        tasks.spawn(async move {
            let delivery = handler.handle(&message).await;
            if delivery.acknowledges() {
                if let Err(err) = client.delete(&queue, &message).await {
                    warn!(
                        event = "message_ack_failed",
                        queue = %queue,
                        message_id = %message.message_id,
                        error = %err,
                        "failed to delete handled message; it will be redelivered"
                    );
                }
            }
            if let Some(metrics) = INGEST_METRICS.get() {
                metrics.messages_in_flight.dec();
            }
            delivery
        });
    }

    let mut deliveries = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(delivery) => deliveries.push(delivery),
            Err(err) => {
                error!(
                    event = "message_task_failed",
                    queue,
                    error = %err,
                    "message handler panicked; delivery left for redelivery"
                );
                deliveries.push(Delivery::Retained);
            }
        }
    }
    Ok(deliveries)
}

/// Polls `queue` until `cancel` fires. In-flight batches finish before the loop exits.
pub async fn run_poll_loop<H: MessageHandler>(
    name: &'static str,
    handler: Arc<H>,
    client: QueueClient,
    queue: String,
    options: ReceiveOptions,
    error_backoff: Duration,
    cancel: CancellationToken,
) {
    info!(event = "poller_started", poller = name, queue = %queue);
    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = poll_once(&handler, &client, &queue, options) => polled,
        };

        if let Err(err) = polled {
            error!(
                event = "poll_failed",
                poller = name,
                queue = %queue,
                error = %err,
                backoff_ms = error_backoff.as_millis() as u64,
                "receive failed; backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(error_backoff) => {}
            }
        }
    }
    info!(event = "poller_stopped", poller = name, queue = %queue);
}
