use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::csv::{split_lines, validate_row, HeaderMap, RowOutcome};
use super::error::{IngestError, RetryRejection};
use super::messages::{ChunkMessage, DeadLetterMessage, FileUploadedMessage, PipelineMessage};
use super::persister::{PersistError, ProductPersister};
use crate::db::models::NewProduct;
use crate::jobs::{
    BatchJob, ChunkDisposition, ChunkRecordOutcome, ChunkReport, ChunkStatus, JobStatus,
    JobStore, JobStoreError, NewBatchJob, RowError,
};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::queue::{QueueClient, QueueError, MAX_BATCH_ENTRIES};
use crate::retry::{default_is_transient, with_retry, RetryPolicy};
use crate::server::monitoring::{JobOutcomeLabels, INGEST_METRICS};
use crate::storage::{BlobStore, StorageError};

/// Pipeline limits and queue routing.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub chunk_queue: String,
    pub dead_letter_queue: String,
    /// Upper bound on data rows per file.
    pub max_rows: i64,
    /// Data rows per chunk message.
    pub chunk_size: usize,
    /// Row errors kept per chunk; the count is still exact.
    pub max_errors_per_chunk: usize,
    /// Rows per insert statement inside one insert transaction.
    pub insert_statement_rows: usize,
    pub max_job_retries: i32,
    pub upload_url_ttl: Duration,
    /// Local retries for inserts, sends and job-store writes.
    pub retry_policy: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_queue: "csv-ingest".to_string(),
            dead_letter_queue: "csv-ingest-dlq".to_string(),
            max_rows: 200_000,
            chunk_size: 1_000,
            max_errors_per_chunk: 50,
            insert_statement_rows: 1_000,
            max_job_retries: 3,
            upload_url_ttl: Duration::from_secs(900),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Parameters of an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartUpload {
    pub seller_id: String,
    pub job_id: Uuid,
    pub object_key: String,
    pub file_name: String,
    pub total_rows: i64,
}

/// Where a seller should PUT a file before calling `start_upload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub job_id: Uuid,
    pub object_key: String,
    pub upload_url: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Dispatched { total_chunks: i32, total_rows: i32 },
    /// The file had a header and no data rows.
    Finalized(Option<JobStatus>),
    /// The file itself was unusable; the job is now `failed`.
    Rejected(String),
    /// The job is missing, terminal, or on another generation.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Dropped before any row was touched.
    Skipped(ChunkDisposition),
    Recorded {
        report: ChunkReport,
        disposition: ChunkDisposition,
        finalized: Option<JobStatus>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    ChunkFailed { finalized: Option<JobStatus> },
    UploadFailed,
    Ignored,
}

/// Orchestrates job creation, splitting, chunk processing, finalization and retries.
pub struct IngestionService {
    jobs: Arc<dyn JobStore>,
    queue: QueueClient,
    blobs: Arc<dyn BlobStore>,
    persister: Arc<dyn ProductPersister>,
    notifier: Arc<dyn Notifier>,
    config: IngestConfig,
}

fn queue_is_transient(err: &QueueError) -> bool {
    matches!(err, QueueError::Pool(_)) || default_is_transient(err)
}

fn store_is_transient(err: &JobStoreError) -> bool {
    matches!(err, JobStoreError::Pool(_)) || default_is_transient(err)
}

fn to_i32(value: impl TryInto<i32>) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}

impl IngestionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: QueueClient,
        blobs: Arc<dyn BlobStore>,
        persister: Arc<dyn ProductPersister>,
        notifier: Arc<dyn Notifier>,
        config: IngestConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            blobs,
            persister,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Persists a `pending` job and enqueues its upload message.
    ///
    /// On any failure no job row remains.
    pub async fn start_upload(&self, request: StartUpload) -> Result<Uuid, IngestError> {
        if request.total_rows <= 0 || request.total_rows > self.config.max_rows {
            return Err(IngestError::Validation(format!(
                "totalRows must be between 1 and {}",
                self.config.max_rows
            )));
        }
        if request.seller_id.trim().is_empty() {
            return Err(IngestError::Validation("sellerId is required".to_string()));
        }
        if request.object_key.trim().is_empty() {
            return Err(IngestError::Validation("objectKey is required".to_string()));
        }

        let job = self
            .jobs
            .create_job(&NewBatchJob {
                id: request.job_id,
                seller_id: request.seller_id.clone(),
                file_name: request.file_name.clone(),
                object_key: request.object_key.clone(),
                total_rows: to_i32(request.total_rows),
                max_retries: self.config.max_job_retries,
            })
            .await?;

        let message = PipelineMessage::FileUploaded(FileUploadedMessage {
            job_id: job.id,
            seller_id: request.seller_id,
            object_key: request.object_key,
            file_name: request.file_name,
            total_rows: request.total_rows,
            generation: job.retry_count,
        });
        if let Err(err) = self.send(&message).await {
            warn!(
                event = "job_enqueue_failed",
                job_id = %job.id,
                error = %err,
                "could not enqueue upload message; removing job"
            );
            if let Err(cleanup_err) = self.jobs.delete_job(job.id).await {
                error!(
                    event = "job_cleanup_failed",
                    job_id = %job.id,
                    error = %cleanup_err,
                    "failed to remove job after enqueue failure"
                );
            }
            return Err(err.into());
        }

        info!(
            event = "job_created",
            job_id = %job.id,
            seller_id = %job.seller_id,
            total_rows = job.total_rows,
            "accepted batch upload"
        );
        Ok(job.id)
    }

    /// Handles a `csv_file_uploaded` message: validates the header and fans out chunk messages.
    pub async fn split_and_enqueue(
        &self,
        message: &FileUploadedMessage,
    ) -> Result<SplitOutcome, IngestError> {
        let Some(job) = self
            .jobs
            .mark_processing(message.job_id, message.generation)
            .await?
        else {
            info!(
                event = "split_skipped",
                job_id = %message.job_id,
                generation = message.generation,
                "job is not splittable for this generation"
            );
            return Ok(SplitOutcome::Skipped);
        };

        info!(event = "split_started", job_id = %job.id, generation = message.generation);

        let bytes = match with_retry(
            &self.config.retry_policy,
            |_| self.blobs.get_full_object(&message.object_key),
            default_is_transient,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                return self
                    .reject_upload(&job, message.generation, "Source file not found")
                    .await;
            }
            Err(err) => return Err(err.into()),
        };

        let text = String::from_utf8_lossy(&bytes);
        let mut lines = split_lines(&text);
        let header_line = if lines.is_empty() {
            String::new()
        } else {
            lines.remove(0)
        };
        if let Err(err) = HeaderMap::parse(&header_line) {
            return self
                .reject_upload(&job, message.generation, &err.to_string())
                .await;
        }

        let data_rows = lines.len();
        if i64::try_from(data_rows).unwrap_or(i64::MAX) > self.config.max_rows {
            let reason = format!(
                "File has {data_rows} data rows; the maximum is {}",
                self.config.max_rows
            );
            return self.reject_upload(&job, message.generation, &reason).await;
        }

        let chunk_size = self.config.chunk_size.max(1);
        let total_chunks = to_i32(data_rows.div_ceil(chunk_size));
        let total_rows = to_i32(data_rows);

        // Persisted before any chunk is sent so workers never see a partial plan.
        if !self
            .jobs
            .set_chunk_plan(job.id, message.generation, total_rows, total_chunks)
            .await?
        {
            return Ok(SplitOutcome::Skipped);
        }

        if total_chunks == 0 {
            let finalized = self.finalize_batch_job(job.id).await?;
            return Ok(SplitOutcome::Finalized(finalized.map(|job| job.status)));
        }

        let chunks: Vec<PipelineMessage> = lines
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, rows)| {
                let start_row = i64::try_from(index * chunk_size).unwrap_or(i64::MAX) + 1;
                PipelineMessage::Chunk(ChunkMessage {
                    job_id: job.id,
                    seller_id: job.seller_id.clone(),
                    object_key: message.object_key.clone(),
                    generation: message.generation,
                    chunk_index: to_i32(index),
                    total_chunks,
                    start_row,
                    end_row: start_row + i64::try_from(rows.len()).unwrap_or(i64::MAX) - 1,
                    header_line: header_line.clone(),
                    rows: rows.to_vec(),
                })
            })
            .collect();

        // Retried per provider call, so a transient failure never resends a group that landed.
        let mut calls = 0usize;
        for group in chunks.chunks(MAX_BATCH_ENTRIES) {
            calls += with_retry(
                &self.config.retry_policy,
                |_| self.queue.send_batch(&self.config.chunk_queue, group),
                queue_is_transient,
            )
            .await?;
        }

        info!(
            event = "split_finished",
            job_id = %job.id,
            total_rows,
            total_chunks,
            send_calls = calls,
            "dispatched chunk messages"
        );
        Ok(SplitOutcome::Dispatched {
            total_chunks,
            total_rows,
        })
    }

    /// Validates and persists one chunk, records its outcome, and finalizes when it was the last.
    ///
    /// A failed insert is recorded as a failed chunk and then returned as an error so the
    /// delivery is not acknowledged.
    pub async fn process_chunk(&self, message: &ChunkMessage) -> Result<ChunkOutcome, IngestError> {
        let job = match self.current_job(message.job_id, message.generation).await? {
            Ok(job) => job,
            Err(disposition) => {
                info!(
                    event = "chunk_skipped",
                    job_id = %message.job_id,
                    chunk_index = message.chunk_index,
                    disposition = ?disposition,
                    "dropping chunk for inactive job"
                );
                return Ok(ChunkOutcome::Skipped(disposition));
            }
        };

        // A duplicate delivery of a completed chunk must not insert its rows again.
        let recorded_status = self
            .jobs
            .chunk_status(job.id, message.generation, message.chunk_index)
            .await?;
        if recorded_status == Some(ChunkStatus::Completed) {
            info!(
                event = "chunk_skipped",
                job_id = %job.id,
                chunk_index = message.chunk_index,
                disposition = ?ChunkDisposition::AlreadyCompleted,
                "chunk already completed"
            );
            return Ok(ChunkOutcome::Skipped(ChunkDisposition::AlreadyCompleted));
        }

        let mut report = ChunkReport {
            generation: message.generation,
            chunk_index: message.chunk_index,
            status: ChunkStatus::Completed,
            processed_rows: 0,
            created_count: 0,
            error_count: 0,
            errors: Vec::new(),
        };

        let mut products = Vec::new();
        match HeaderMap::parse(&message.header_line) {
            Ok(header) => {
                for (offset, line) in message.rows.iter().enumerate() {
                    report.processed_rows += 1;
                    match validate_row(&header, line) {
                        RowOutcome::Blank => {}
                        RowOutcome::Valid(candidate) => products.push(NewProduct {
                            id: Uuid::new_v4(),
                            seller_id: message.seller_id.clone(),
                            batch_job_id: job.id,
                            name: candidate.name,
                            description: candidate.description,
                            price: candidate.price,
                            category: candidate.category,
                            stock: candidate.stock,
                            image_url: candidate.image_url,
                        }),
                        RowOutcome::Invalid(reason) => {
                            report.error_count += 1;
                            if report.errors.len() < self.config.max_errors_per_chunk {
                                let row = message.start_row
                                    + i64::try_from(offset).unwrap_or(i64::MAX);
                                report.errors.push(RowError::new(row, reason));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                report.status = ChunkStatus::Failed;
                report.processed_rows = to_i32(message.rows.len());
                report.error_count = report.processed_rows;
                report.errors.push(RowError::new(message.start_row, err.to_string()));
            }
        }

        let insert_error = match self.insert_with_retry(&products).await {
            Ok(inserted) => {
                report.created_count = to_i32(inserted);
                None
            }
            Err(err) => {
                report.status = ChunkStatus::Failed;
                report.error_count += to_i32(products.len());
                // The insert failure always gets a slot within the per-chunk cap.
                report
                    .errors
                    .truncate(self.config.max_errors_per_chunk.saturating_sub(1));
                report.errors.push(RowError::new(
                    message.start_row,
                    format!(
                        "Failed to insert rows {}-{}: {err}",
                        message.start_row, message.end_row
                    ),
                ));
                Some(err)
            }
        };

        let recorded = self.record(job.id, &report).await?;
        if recorded.applied() {
            if let Some(metrics) = INGEST_METRICS.get() {
                match report.status {
                    ChunkStatus::Completed => metrics.chunks_completed_total.inc(),
                    ChunkStatus::Failed => metrics.chunks_failed_total.inc(),
                };
                metrics
                    .rows_created_total
                    .inc_by(u64::try_from(report.created_count).unwrap_or(0));
                metrics
                    .rows_invalid_total
                    .inc_by(u64::try_from(report.error_count).unwrap_or(0));
            }
        }
        let finalized = self.finalize_if_done(job.id, &recorded).await?;

        info!(
            event = "chunk_processed",
            job_id = %job.id,
            chunk_index = report.chunk_index,
            status = report.status.as_db_str(),
            processed_rows = report.processed_rows,
            created_count = report.created_count,
            error_count = report.error_count,
            disposition = ?recorded.disposition,
            "recorded chunk outcome"
        );

        if let Some(err) = insert_error {
            warn!(
                event = "chunk_insert_failed",
                job_id = %job.id,
                chunk_index = report.chunk_index,
                error = %err,
                "product insert failed; leaving message for redelivery"
            );
            return Err(err.into());
        }
        Ok(ChunkOutcome::Recorded {
            report,
            disposition: recorded.disposition,
            finalized,
        })
    }

    /// Terminal decision for a job whose chunks all have an outcome.
    ///
    /// Returns the job when this call performed the transition; `None` means not ready or
    /// already finalized elsewhere.
    pub async fn finalize_batch_job(&self, job_id: Uuid) -> Result<Option<BatchJob>, IngestError> {
        let Some(job) = self.jobs.get_job(job_id).await? else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || !job.progress().all_chunks_done() {
            return Ok(None);
        }

        let status = if job.chunks_failed > 0 && job.created_count == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        let Some(finalized) = self.jobs.finish_job(job_id, status).await? else {
            return Ok(None);
        };
        let job = finalized.job;

        if let Some(key) = finalized.released_object_key.as_deref() {
            if let Err(err) = self.blobs.delete_object(key).await {
                warn!(
                    event = "source_cleanup_failed",
                    job_id = %job.id,
                    object_key = key,
                    error = %err,
                    "failed to delete source object after finalization"
                );
            }
        }

        if let Some(metrics) = INGEST_METRICS.get() {
            metrics
                .jobs_finalized_total
                .get_or_create(&JobOutcomeLabels {
                    status: job.status.as_db_str(),
                })
                .inc();
        }
        info!(
            event = "job_finalized",
            job_id = %job.id,
            status = job.status.as_db_str(),
            processed_rows = job.processed_rows,
            created_count = job.created_count,
            error_count = job.error_count,
            chunks_failed = job.chunks_failed,
            "batch job reached terminal status"
        );

        self.emit(&completion_notification(&job)).await;
        Ok(Some(job))
    }

    /// Dead-letter entry point for wrapped messages.
    pub async fn handle_dead_letter(
        &self,
        message: &DeadLetterMessage,
    ) -> Result<DeadLetterOutcome, IngestError> {
        match message.original.as_ref() {
            PipelineMessage::Chunk(chunk) => {
                self.dead_letter_chunk(chunk, &message.error, message.receive_count)
                    .await
            }
            PipelineMessage::FileUploaded(upload) => {
                if self.fail_upload(upload, &message.error).await? {
                    Ok(DeadLetterOutcome::UploadFailed)
                } else {
                    Ok(DeadLetterOutcome::Ignored)
                }
            }
            other => {
                warn!(
                    event = "dead_letter_dropped",
                    kind = other.kind(),
                    "dead-letter message wraps an unsupported payload"
                );
                Ok(DeadLetterOutcome::Ignored)
            }
        }
    }

    /// Records a chunk as permanently failed: every row in its range counts as an error.
    pub async fn dead_letter_chunk(
        &self,
        message: &ChunkMessage,
        error: &str,
        receive_count: u32,
    ) -> Result<DeadLetterOutcome, IngestError> {
        let job = match self.current_job(message.job_id, message.generation).await? {
            Ok(job) => job,
            Err(disposition) => {
                info!(
                    event = "dead_letter_skipped",
                    job_id = %message.job_id,
                    chunk_index = message.chunk_index,
                    disposition = ?disposition,
                    "dead-lettered chunk belongs to an inactive job"
                );
                return Ok(DeadLetterOutcome::Ignored);
            }
        };

        let row_count = to_i32(message.row_count());
        let detail = format!(
            "Rows {}-{} failed permanently after {receive_count} attempts: {error}",
            message.start_row, message.end_row
        );
        let report = ChunkReport {
            generation: message.generation,
            chunk_index: message.chunk_index,
            status: ChunkStatus::Failed,
            processed_rows: row_count,
            created_count: 0,
            error_count: row_count,
            errors: vec![RowError::new(message.start_row, detail)],
        };

        let recorded = self.record(job.id, &report).await?;
        let finalized = self.finalize_if_done(job.id, &recorded).await?;
        if !recorded.applied() {
            info!(
                event = "dead_letter_not_applied",
                job_id = %job.id,
                chunk_index = message.chunk_index,
                disposition = ?recorded.disposition,
                "chunk outcome already settled"
            );
            return Ok(DeadLetterOutcome::Ignored);
        }

        if let Some(metrics) = INGEST_METRICS.get() {
            metrics.chunks_failed_total.inc();
            metrics
                .rows_invalid_total
                .inc_by(u64::try_from(row_count).unwrap_or(0));
        }
        warn!(
            event = "chunk_dead_lettered",
            job_id = %job.id,
            chunk_index = message.chunk_index,
            start_row = message.start_row,
            end_row = message.end_row,
            receive_count,
            error,
            "chunk permanently failed"
        );

        self.emit(&Notification {
            seller_id: job.seller_id.clone(),
            kind: NotificationKind::BatchFailed,
            title: "Batch upload rows failed".to_string(),
            message: format!(
                "Rows {}-{} of {} could not be imported: {error}",
                message.start_row, message.end_row, job.file_name
            ),
            metadata: serde_json::json!({
                "jobId": job.id,
                "fileName": job.file_name,
                "chunkIndex": message.chunk_index,
                "startRow": message.start_row,
                "endRow": message.end_row,
                "rowCount": row_count,
                "error": error,
            }),
        })
        .await;

        Ok(DeadLetterOutcome::ChunkFailed { finalized })
    }

    /// Fails a job whose upload message could not be processed.
    ///
    /// Returns `false` without changes once chunks were dispatched, since their outcomes decide
    /// the job.
    pub async fn fail_upload(
        &self,
        message: &FileUploadedMessage,
        reason: &str,
    ) -> Result<bool, IngestError> {
        let Some(job) = self.jobs.get_job(message.job_id).await? else {
            return Ok(false);
        };
        if job.retry_count != message.generation || job.status.is_terminal() || job.total_chunks > 0
        {
            return Ok(false);
        }

        let rejected = self
            .reject_upload(
                &job,
                message.generation,
                &format!("File could not be processed: {reason}"),
            )
            .await?;
        Ok(matches!(rejected, SplitOutcome::Rejected(_)))
    }

    /// Status projection for the owning seller. Other sellers see `NotFound`.
    pub async fn job_status(&self, seller_id: &str, job_id: Uuid) -> Result<BatchJob, IngestError> {
        match self.jobs.get_job(job_id).await? {
            Some(job) if job.seller_id == seller_id => Ok(job),
            _ => Err(IngestError::NotFound(job_id)),
        }
    }

    /// Re-runs a failed job from its source file as a new generation.
    pub async fn retry_job(&self, seller_id: &str, job_id: Uuid) -> Result<BatchJob, IngestError> {
        let job = self.job_status(seller_id, job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(IngestError::RetryRejected(RetryRejection::NotFailed));
        }
        if job.retry_count >= job.max_retries {
            return Err(IngestError::RetryRejected(RetryRejection::MaxRetriesReached));
        }
        let Some(object_key) = job.object_key.clone() else {
            return Err(IngestError::RetryRejected(RetryRejection::SourceMissing));
        };
        if !self.blobs.object_exists(&object_key).await? {
            return Err(IngestError::RetryRejected(RetryRejection::SourceMissing));
        }

        let Some(reset) = self.jobs.reset_for_retry(job_id).await? else {
            return Err(IngestError::RetryRejected(RetryRejection::NotFailed));
        };

        let message = PipelineMessage::FileUploaded(FileUploadedMessage {
            job_id,
            seller_id: reset.seller_id.clone(),
            object_key,
            file_name: reset.file_name.clone(),
            total_rows: i64::from(reset.total_rows),
            generation: reset.retry_count,
        });
        if let Err(err) = self.send(&message).await {
            let note = RowError::new(0, format!("Retry could not be scheduled: {err}"));
            if let Err(mark_err) = self.jobs.fail_job(job_id, reset.retry_count, &note).await {
                error!(
                    event = "retry_rollback_failed",
                    job_id = %job_id,
                    error = %mark_err,
                    "job left pending after failed retry enqueue"
                );
            }
            return Err(err.into());
        }

        info!(
            event = "job_retried",
            job_id = %job_id,
            retry_count = reset.retry_count,
            max_retries = reset.max_retries,
            "re-dispatched failed job"
        );
        Ok(reset)
    }

    /// Allocates a job id and a presigned PUT URL for the seller's file.
    pub async fn prepare_upload(
        &self,
        seller_id: &str,
        file_name: &str,
    ) -> Result<UploadTicket, IngestError> {
        if seller_id.trim().is_empty() {
            return Err(IngestError::Validation("sellerId is required".to_string()));
        }
        if file_name.trim().is_empty() || file_name.contains(['/', '\\']) {
            return Err(IngestError::Validation(
                "fileName must be a plain file name".to_string(),
            ));
        }

        let job_id = Uuid::new_v4();
        let object_key = format!("uploads/{seller_id}/{job_id}/{file_name}");
        let upload_url = self
            .blobs
            .upload_url(&object_key, self.config.upload_url_ttl)
            .await?;
        Ok(UploadTicket {
            job_id,
            object_key,
            upload_url,
            expires_in: self.config.upload_url_ttl,
        })
    }

    /// Loads the job and checks that a message of `generation` may still act on it.
    async fn current_job(
        &self,
        job_id: Uuid,
        generation: i32,
    ) -> Result<Result<BatchJob, ChunkDisposition>, IngestError> {
        let Some(job) = self.jobs.get_job(job_id).await? else {
            return Ok(Err(ChunkDisposition::JobMissing));
        };
        if job.retry_count != generation {
            return Ok(Err(ChunkDisposition::StaleGeneration {
                current: job.retry_count,
            }));
        }
        if job.status != JobStatus::Processing {
            return Ok(Err(ChunkDisposition::JobNotProcessing(job.status)));
        }
        Ok(Ok(job))
    }

    async fn reject_upload(
        &self,
        job: &BatchJob,
        generation: i32,
        reason: &str,
    ) -> Result<SplitOutcome, IngestError> {
        let error = RowError::new(0, reason);
        let Some(failed) = self.jobs.fail_job(job.id, generation, &error).await? else {
            return Ok(SplitOutcome::Skipped);
        };

        if let Some(metrics) = INGEST_METRICS.get() {
            metrics
                .jobs_finalized_total
                .get_or_create(&JobOutcomeLabels {
                    status: JobStatus::Failed.as_db_str(),
                })
                .inc();
        }
        warn!(
            event = "upload_rejected",
            job_id = %failed.id,
            reason,
            "batch job failed before any chunk was dispatched"
        );

        self.emit(&Notification {
            seller_id: failed.seller_id.clone(),
            kind: NotificationKind::BatchFailed,
            title: "Batch upload failed".to_string(),
            message: format!("{} could not be processed: {reason}", failed.file_name),
            metadata: serde_json::json!({
                "jobId": failed.id,
                "fileName": failed.file_name,
                "error": reason,
            }),
        })
        .await;
        Ok(SplitOutcome::Rejected(reason.to_string()))
    }

    async fn finalize_if_done(
        &self,
        job_id: Uuid,
        recorded: &ChunkRecordOutcome,
    ) -> Result<Option<JobStatus>, IngestError> {
        let ready = recorded.progress.is_some_and(|progress| {
            progress.status == JobStatus::Processing && progress.all_chunks_done()
        });
        if !ready {
            return Ok(None);
        }
        Ok(self.finalize_batch_job(job_id).await?.map(|job| job.status))
    }

    async fn insert_with_retry(&self, products: &[NewProduct]) -> Result<usize, PersistError> {
        if products.is_empty() {
            return Ok(0);
        }
        with_retry(
            &self.config.retry_policy,
            |_| self.persister.insert_products(products),
            |err: &PersistError| err.is_retryable() || default_is_transient(err),
        )
        .await
    }

    async fn record(
        &self,
        job_id: Uuid,
        report: &ChunkReport,
    ) -> Result<ChunkRecordOutcome, IngestError> {
        Ok(with_retry(
            &self.config.retry_policy,
            |_| self.jobs.record_chunk(job_id, report),
            store_is_transient,
        )
        .await?)
    }

    async fn send(&self, message: &PipelineMessage) -> Result<(), QueueError> {
        with_retry(
            &self.config.retry_policy,
            |_| self.queue.send(&self.config.chunk_queue, message),
            queue_is_transient,
        )
        .await
    }

    /// Notification failures are logged; the job state is already durable.
    async fn emit(&self, notification: &Notification) {
        let result = with_retry(
            &self.config.retry_policy,
            |_| self.notifier.notify(notification),
            default_is_transient,
        )
        .await;

        match result {
            Ok(()) => info!(
                event = "notification_emitted",
                seller_id = %notification.seller_id,
                kind = notification.kind.as_str(),
            ),
            Err(err) => {
                if let Some(metrics) = INGEST_METRICS.get() {
                    metrics.notifications_failed_total.inc();
                }
                error!(
                    event = "notification_failed",
                    seller_id = %notification.seller_id,
                    kind = notification.kind.as_str(),
                    error = %err,
                    "failed to emit seller notification"
                );
            }
        }
    }
}

/// Summary notification for a finalized job.
pub fn completion_notification(job: &BatchJob) -> Notification {
    let (kind, title, message) = if job.status == JobStatus::Failed {
        (
            NotificationKind::BatchFailed,
            "Batch upload failed",
            format!(
                "No products from {} were imported. {} of {} rows failed.",
                job.file_name, job.error_count, job.processed_rows
            ),
        )
    } else if job.error_count == 0 && job.chunks_failed == 0 {
        (
            NotificationKind::BatchCompleted,
            "Batch upload completed",
            format!(
                "{} products from {} were imported.",
                job.created_count, job.file_name
            ),
        )
    } else {
        (
            NotificationKind::BatchCompletedWithErrors,
            "Batch upload completed with errors",
            format!(
                "{} of {} rows from {} were imported; {} rows had errors.",
                job.created_count, job.processed_rows, job.file_name, job.error_count
            ),
        )
    };

    Notification {
        seller_id: job.seller_id.clone(),
        kind,
        title: title.to_string(),
        message,
        metadata: serde_json::json!({
            "jobId": job.id,
            "fileName": job.file_name,
            "totalRows": job.total_rows,
            "processedRows": job.processed_rows,
            "createdCount": job.created_count,
            "errorCount": job.error_count,
            "chunksFailed": job.chunks_failed,
        }),
    }
}
