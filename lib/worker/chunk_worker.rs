use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{poll_once, run_poll_loop, Delivery, MessageHandler, WorkerConfig};
use crate::ingest::{
    ChunkOutcome, DeadLetterMessage, IngestError, IngestionService, PipelineMessage,
};
use crate::queue::{parse_body, receive_count, QueueClient, QueueError, QueueMessage};
use crate::retry::{default_is_transient, with_retry};
use crate::server::monitoring::INGEST_METRICS;

/// Consumer of the main queue: splits uploads and processes chunks.
pub struct ChunkWorker {
    service: Arc<IngestionService>,
    queue: QueueClient,
    config: WorkerConfig,
}

impl ChunkWorker {
    pub fn new(service: Arc<IngestionService>, queue: QueueClient, config: WorkerConfig) -> Self {
        Self {
            service,
            queue,
            config,
        }
    }

    pub async fn poll_once(self: &Arc<Self>) -> Result<Vec<Delivery>, QueueError> {
        poll_once(
            self,
            &self.queue,
            &self.config.chunk_queue,
            self.config.receive,
        )
        .await
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let client = self.queue.clone();
        let queue = self.config.chunk_queue.clone();
        let options = self.config.receive;
        let backoff = self.config.error_backoff;
        run_poll_loop("chunk", self, client, queue, options, backoff, cancel).await;
    }

    async fn dispatch(&self, message: &QueueMessage) -> Delivery {
        let parsed = match parse_body::<PipelineMessage>(message) {
            Ok(parsed) => parsed,
            Err(err) => return dropped(message, &err.to_string()),
        };

        let attempts = receive_count(message);
        if attempts > self.config.max_receive_count
            && matches!(
                parsed,
                PipelineMessage::Chunk(_) | PipelineMessage::FileUploaded(_)
            )
        {
            return self.forward_to_dead_letter(parsed, attempts).await;
        }

        match parsed {
            PipelineMessage::FileUploaded(upload) => {
                match self.service.split_and_enqueue(&upload).await {
                    Ok(outcome) => {
                        info!(
                            event = "upload_handled",
                            job_id = %upload.job_id,
                            outcome = ?outcome,
                        );
                        Delivery::Acknowledged
                    }
                    Err(err) => retained(message, "csv_file_uploaded", &err),
                }
            }
            PipelineMessage::Chunk(chunk) => match self.service.process_chunk(&chunk).await {
                Ok(ChunkOutcome::Skipped(disposition)) => {
                    info!(
                        event = "chunk_dropped",
                        job_id = %chunk.job_id,
                        chunk_index = chunk.chunk_index,
                        disposition = ?disposition,
                    );
                    Delivery::Acknowledged
                }
                Ok(ChunkOutcome::Recorded { .. }) => Delivery::Acknowledged,
                Err(err) => retained(message, "csv_chunk", &err),
            },
            PipelineMessage::DeadLetter(_) => {
                dropped(message, "dead-letter envelope on the main queue")
            }
            PipelineMessage::Unknown => dropped(message, "unknown message type"),
        }
    }

    async fn forward_to_dead_letter(&self, original: PipelineMessage, attempts: u32) -> Delivery {
        let kind = original.kind();
        let job_id = original.job_id();
        let envelope = PipelineMessage::DeadLetter(DeadLetterMessage {
            original: Box::new(original),
            error: format!(
                "exceeded maximum receive count of {}",
                self.config.max_receive_count
            ),
            receive_count: attempts,
            failed_at: Utc::now(),
        });

        let sent = with_retry(
            &self.service.config().retry_policy,
            |_| self.queue.send(&self.config.dead_letter_queue, &envelope),
            |err: &QueueError| matches!(err, QueueError::Pool(_)) || default_is_transient(err),
        )
        .await;

        match sent {
            Ok(()) => {
                if let Some(metrics) = INGEST_METRICS.get() {
                    metrics.messages_dead_lettered_total.inc();
                }
                warn!(
                    event = "message_dead_lettered",
                    kind,
                    job_id = ?job_id,
                    receive_count = attempts,
                    "receive budget exhausted; forwarded without processing"
                );
                Delivery::DeadLettered
            }
            Err(err) => {
                warn!(
                    event = "dead_letter_forward_failed",
                    kind,
                    job_id = ?job_id,
                    error = %err,
                    "could not forward exhausted message; leaving it for queue redrive"
                );
                Delivery::Retained
            }
        }
    }
}

impl MessageHandler for ChunkWorker {
    fn handle<'a>(&'a self, message: &'a QueueMessage) -> BoxFuture<'a, Delivery> {
        Box::pin(self.dispatch(message))
    }
}

pub(super) fn dropped(message: &QueueMessage, reason: &str) -> Delivery {
    if let Some(metrics) = INGEST_METRICS.get() {
        metrics.messages_dropped_total.inc();
    }
    warn!(
        event = "message_dropped",
        message_id = %message.message_id,
        reason,
        "dropping message"
    );
    Delivery::Dropped
}

pub(super) fn retained(message: &QueueMessage, kind: &str, err: &IngestError) -> Delivery {
    warn!(
        event = "message_retained",
        message_id = %message.message_id,
        kind,
        receive_count = message.receive_count,
        transient = err.is_transient(),
        error = %err,
        "handler failed; message left for redelivery"
    );
    Delivery::Retained
}
