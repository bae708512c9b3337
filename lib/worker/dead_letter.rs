use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::chunk_worker::{dropped, retained};
use super::{poll_once, run_poll_loop, Delivery, MessageHandler, WorkerConfig};
use crate::ingest::{DeadLetterOutcome, IngestError, IngestionService, PipelineMessage};
use crate::queue::{parse_body, QueueClient, QueueError, QueueMessage};

/// Consumer of the dead-letter queue.
///
/// Accepts both envelopes forwarded by [`super::ChunkWorker`] and raw messages moved by the
/// queue's redrive policy.
pub struct DeadLetterProcessor {
    service: Arc<IngestionService>,
    queue: QueueClient,
    config: WorkerConfig,
}

impl DeadLetterProcessor {
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
            &self.config.dead_letter_queue,
            self.config.receive,
        )
        .await
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let client = self.queue.clone();
        let queue = self.config.dead_letter_queue.clone();
        let options = self.config.receive;
        let backoff = self.config.error_backoff;
        run_poll_loop("dead_letter", self, client, queue, options, backoff, cancel).await;
    }

    async fn settle(&self, message: &PipelineMessage) -> Result<DeadLetterOutcome, IngestError> {
        let exhausted = format!(
            "exceeded maximum receive count of {}",
            self.config.max_receive_count
        );
        match message {
            PipelineMessage::DeadLetter(envelope) => self.service.handle_dead_letter(envelope).await,
            PipelineMessage::Chunk(chunk) => {
                self.service
                    .dead_letter_chunk(chunk, &exhausted, self.config.max_receive_count)
                    .await
            }
            PipelineMessage::FileUploaded(upload) => {
                if self.service.fail_upload(upload, &exhausted).await? {
                    Ok(DeadLetterOutcome::UploadFailed)
                } else {
                    Ok(DeadLetterOutcome::Ignored)
                }
            }
            PipelineMessage::Unknown => Ok(DeadLetterOutcome::Ignored),
        }
    }

    async fn dispatch(&self, message: &QueueMessage) -> Delivery {
        let parsed = match parse_body::<PipelineMessage>(message) {
            Ok(PipelineMessage::Unknown) => return dropped(message, "unknown message type"),
            Ok(parsed) => parsed,
            Err(err) => return dropped(message, &err.to_string()),
        };

        match self.settle(&parsed).await {
            Ok(outcome) => {
                info!(
                    event = "dead_letter_handled",
                    kind = parsed.kind(),
                    job_id = ?parsed.job_id(),
                    outcome = ?outcome,
                );
                Delivery::Acknowledged
            }
            Err(err) => retained(message, parsed.kind(), &err),
        }
    }
}

impl MessageHandler for DeadLetterProcessor {
    fn handle<'a>(&'a self, message: &'a QueueMessage) -> BoxFuture<'a, Delivery> {
        Box::pin(self.dispatch(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ChunkMessage, DeadLetterMessage};
    use crate::jobs::{JobStatus, RowError};
    use crate::notify::NotificationKind;
    use crate::test_support::{
        sample_job, test_config, worker_config, Pipeline, CHUNK_QUEUE, DEAD_LETTER_QUEUE,
    };
    use crate::worker::ChunkWorker;

    fn processor(pipeline: &Pipeline) -> Arc<DeadLetterProcessor> {
        Arc::new(DeadLetterProcessor::new(
            pipeline.service.clone(),
            pipeline.client.clone(),
            worker_config(3),
        ))
    }

    #[tokio::test]
    async fn unacknowledged_chunk_ends_as_a_failed_row_range() {
        let pipeline = Pipeline::new(test_config(1_000));
        let chunk_worker = Arc::new(ChunkWorker::new(
            pipeline.service.clone(),
            pipeline.client.clone(),
            worker_config(3),
        ));
        let job_id = pipeline
            .submit(
                "seller-1",
                "name,description,price,category,stock\nA,d,1,c,1\nB,d,2,c,1\nC,d,3,c,1\n",
            )
            .await;
        chunk_worker.poll_once().await.expect("split poll");

        // Three deliveries whose handlers never acknowledge.
        for _ in 0..3 {
            assert_eq!(pipeline.receive_all(CHUNK_QUEUE).await.len(), 1);
            pipeline.queue.expire_visibility();
        }
        assert!(chunk_worker
            .poll_once()
            .await
            .expect("poll should succeed")
            .is_empty());
        assert_eq!(pipeline.queue.len(DEAD_LETTER_QUEUE), 1);

        let deliveries = processor(&pipeline)
            .poll_once()
            .await
            .expect("poll should succeed");
        assert_eq!(deliveries, vec![Delivery::Acknowledged]);
        assert_eq!(pipeline.queue.len(DEAD_LETTER_QUEUE), 0);
        assert_eq!(pipeline.persister.calls(), 0);

        let job = pipeline.jobs.job(job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_rows, 3);
        assert_eq!(job.error_count, 3);
        assert_eq!(job.chunks_failed, 1);
        assert_eq!(job.created_count, 0);

        let notifications = pipeline.notifier.notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[1].metadata["startRow"], 1);
        assert_eq!(notifications[1].metadata["endRow"], 3);
    }

    #[tokio::test]
    async fn envelope_for_a_partially_imported_job_completes_it_with_errors() {
        let pipeline = Pipeline::new(test_config(1_000));
        let job_id = uuid::Uuid::new_v4();
        let mut job = sample_job(job_id, JobStatus::Processing);
        job.total_rows = 1_500;
        job.total_chunks = 2;
        job.chunks_completed = 1;
        job.processed_rows = 1_000;
        job.created_count = 1_000;
        pipeline.jobs.insert(job);

        let envelope = PipelineMessage::DeadLetter(DeadLetterMessage {
            original: Box::new(PipelineMessage::Chunk(ChunkMessage {
                job_id,
                seller_id: "seller-1".to_string(),
                object_key: format!("uploads/seller-1/{job_id}/catalog.csv"),
                generation: 0,
                chunk_index: 1,
                total_chunks: 2,
                start_row: 1_001,
                end_row: 1_500,
                header_line: "name,price".to_string(),
                rows: Vec::new(),
            })),
            error: "exceeded maximum receive count of 3".to_string(),
            receive_count: 4,
            failed_at: chrono::Utc::now(),
        });
        pipeline.queue.push_with_receive_count(
            DEAD_LETTER_QUEUE,
            serde_json::to_string(&envelope).expect("envelope encodes"),
            0,
        );

        let deliveries = processor(&pipeline)
            .poll_once()
            .await
            .expect("poll should succeed");
        assert_eq!(deliveries, vec![Delivery::Acknowledged]);

        let job = pipeline.jobs.job(job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_rows, 1_500);
        assert_eq!(job.error_count, 500);
        assert_eq!((job.chunks_completed, job.chunks_failed), (1, 1));
        assert_eq!(job.object_key, None);

        let kinds: Vec<NotificationKind> = pipeline
            .notifier
            .notifications()
            .iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::BatchCompletedWithErrors,
                NotificationKind::BatchFailed
            ]
        );
    }

    #[tokio::test]
    async fn redriven_upload_fails_its_job() {
        let pipeline = Pipeline::new(test_config(1_000));
        let job_id = pipeline
            .submit("seller-1", "name,description,price,category,stock\nA,d,1,c,1\n")
            .await;
        for _ in 0..3 {
            pipeline.receive_all(CHUNK_QUEUE).await;
            pipeline.queue.expire_visibility();
        }
        pipeline.receive_all(CHUNK_QUEUE).await;

        let deliveries = processor(&pipeline)
            .poll_once()
            .await
            .expect("poll should succeed");
        assert_eq!(deliveries, vec![Delivery::Acknowledged]);

        let job = pipeline.jobs.job(job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.errors,
            vec![RowError::new(
                0,
                "File could not be processed: exceeded maximum receive count of 3"
            )]
        );
    }
}
