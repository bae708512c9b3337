//! In-memory stand-ins for the pipeline's external collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use diesel_async::pooled_connection::deadpool::PoolError;
use futures::future::BoxFuture;
use object_store::memory::InMemory;
use uuid::Uuid;

use crate::db::models::NewProduct;
use crate::ingest::{IngestConfig, IngestionService, PersistError, ProductPersister, StartUpload};
use crate::jobs::{
    plan_chunk_transition, replace_chunk_errors, BatchJob, ChunkDisposition, ChunkRecordOutcome,
    ChunkReport, ChunkStatus, ChunkTally, ChunkTransition, FinalizedJob, JobSnapshot, JobStatus,
    JobStore, JobStoreError, NewBatchJob, RowError,
};
use crate::notify::{Notification, Notifier, NotifyError};
use crate::queue::{
    MessageQueue, QueueClient, QueueError, QueueMessage, ReceiveOptions, RedrivePolicy,
    MAX_BATCH_ENTRIES,
};
use crate::retry::RetryPolicy;
use crate::storage::{BlobStore, ObjectStoreBlobs};
use crate::worker::WorkerConfig;

pub const CHUNK_QUEUE: &str = "csv-ingest";
pub const DEAD_LETTER_QUEUE: &str = "csv-ingest-dlq";

pub fn sample_job(id: Uuid, status: JobStatus) -> BatchJob {
    let now = Utc::now();
    BatchJob {
        id,
        seller_id: "seller-1".to_string(),
        status,
        file_name: "catalog.csv".to_string(),
        object_key: Some(format!("uploads/seller-1/{id}/catalog.csv")),
        total_rows: 0,
        processed_rows: 0,
        created_count: 0,
        error_count: 0,
        total_chunks: 0,
        chunks_completed: 0,
        chunks_failed: 0,
        retry_count: 0,
        max_retries: 3,
        errors: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
struct JobsState {
    jobs: HashMap<Uuid, BatchJob>,
    ledger: HashMap<(Uuid, i32, i32), (ChunkTally, Vec<RowError>)>,
}

/// Job store with the same transition rules as the Postgres store.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<JobsState>,
}

impl MemoryJobStore {
    pub fn insert(&self, job: BatchJob) {
        self.state
            .lock()
            .expect("jobs mutex poisoned")
            .jobs
            .insert(job.id, job);
    }

    pub fn job(&self, job_id: Uuid) -> Option<BatchJob> {
        self.state
            .lock()
            .expect("jobs mutex poisoned")
            .jobs
            .get(&job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("jobs mutex poisoned").jobs.len()
    }
}

impl JobStore for MemoryJobStore {
    fn create_job<'a>(
        &'a self,
        job: &'a NewBatchJob,
    ) -> BoxFuture<'a, Result<BatchJob, JobStoreError>> {
        Box::pin(async move {
            let mut created = sample_job(job.id, JobStatus::Pending);
            created.seller_id = job.seller_id.clone();
            created.file_name = job.file_name.clone();
            created.object_key = Some(job.object_key.clone());
            created.total_rows = job.total_rows;
            created.max_retries = job.max_retries;
            self.insert(created.clone());
            Ok(created)
        })
    }

    fn get_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move { Ok(self.job(job_id)) })
    }

    fn delete_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            state.ledger.retain(|(id, _, _), _| *id != job_id);
            Ok(state.jobs.remove(&job_id).is_some())
        })
    }

    fn mark_processing(
        &self,
        job_id: Uuid,
        generation: i32,
    ) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if job.status.is_terminal() || job.retry_count != generation {
                return Ok(None);
            }
            job.status = JobStatus::Processing;
            job.updated_at = Utc::now();
            Ok(Some(job.clone()))
        })
    }

    fn set_chunk_plan(
        &self,
        job_id: Uuid,
        generation: i32,
        total_rows: i32,
        total_chunks: i32,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            match state.jobs.get_mut(&job_id) {
                Some(job) if job.status == JobStatus::Processing && job.retry_count == generation => {
                    job.total_rows = total_rows;
                    job.total_chunks = total_chunks;
                    job.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn record_chunk<'a>(
        &'a self,
        job_id: Uuid,
        report: &'a ChunkReport,
    ) -> BoxFuture<'a, Result<ChunkRecordOutcome, JobStoreError>> {
        Box::pin(async move {
            let mut guard = self.state.lock().expect("jobs mutex poisoned");
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(ChunkRecordOutcome {
                    disposition: ChunkDisposition::JobMissing,
                    progress: None,
                });
            };
            let snapshot = JobSnapshot {
                status: job.status,
                generation: job.retry_count,
                total_chunks: job.total_chunks,
            };
            let key = (job_id, report.generation, report.chunk_index);

            let existing = state.ledger.get(&key);
            match plan_chunk_transition(&snapshot, existing.map(|(tally, _)| tally), report) {
                ChunkTransition::Skip(disposition) => Ok(ChunkRecordOutcome {
                    disposition,
                    progress: Some(job.progress()),
                }),
                ChunkTransition::Apply {
                    delta,
                    entry,
                    previous,
                } => {
                    let previous_errors = state
                        .ledger
                        .insert(key, (entry, report.errors.clone()))
                        .map(|(_, errors)| errors)
                        .unwrap_or_default();
                    job.processed_rows += delta.processed_rows;
                    job.created_count += delta.created_count;
                    job.error_count += delta.error_count;
                    job.chunks_completed += delta.chunks_completed;
                    job.chunks_failed += delta.chunks_failed;
                    job.errors = replace_chunk_errors(
                        std::mem::take(&mut job.errors),
                        &previous_errors,
                        &report.errors,
                    );
                    job.updated_at = Utc::now();
                    Ok(ChunkRecordOutcome {
                        disposition: ChunkDisposition::Recorded { previous },
                        progress: Some(job.progress()),
                    })
                }
            }
        })
    }

    fn chunk_status(
        &self,
        job_id: Uuid,
        generation: i32,
        chunk_index: i32,
    ) -> BoxFuture<'_, Result<Option<ChunkStatus>, JobStoreError>> {
        Box::pin(async move {
            let state = self.state.lock().expect("jobs mutex poisoned");
            Ok(state
                .ledger
                .get(&(job_id, generation, chunk_index))
                .map(|(tally, _)| tally.status))
        })
    }

    fn fail_job<'a>(
        &'a self,
        job_id: Uuid,
        generation: i32,
        error: &'a RowError,
    ) -> BoxFuture<'a, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if job.status.is_terminal() || job.retry_count != generation {
                return Ok(None);
            }
            job.status = JobStatus::Failed;
            job.errors.push(error.clone());
            job.updated_at = Utc::now();
            Ok(Some(job.clone()))
        })
    }

    fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> BoxFuture<'_, Result<Option<FinalizedJob>, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if job.status != JobStatus::Processing {
                return Ok(None);
            }
            job.status = status;
            job.updated_at = Utc::now();
            let released_object_key = match status {
                JobStatus::Completed => job.object_key.take(),
                _ => None,
            };
            Ok(Some(FinalizedJob {
                job: job.clone(),
                released_object_key,
            }))
        })
    }

    fn reset_for_retry(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().expect("jobs mutex poisoned");
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(None);
            };
            if job.status != JobStatus::Failed || job.retry_count >= job.max_retries {
                return Ok(None);
            }
            job.status = JobStatus::Pending;
            job.processed_rows = 0;
            job.created_count = 0;
            job.error_count = 0;
            job.total_chunks = 0;
            job.chunks_completed = 0;
            job.chunks_failed = 0;
            job.errors.clear();
            job.retry_count += 1;
            job.updated_at = Utc::now();
            let reset = job.clone();
            state.ledger.retain(|(id, _, _), _| *id != job_id);
            Ok(Some(reset))
        })
    }
}

struct StoredMessage {
    id: u64,
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, Vec<StoredMessage>>,
    next_id: u64,
    send_calls: usize,
    failing_sends: usize,
    fail_after_sends: Option<usize>,
    redrive: HashMap<String, RedrivePolicy>,
}

/// Queue with visibility timeouts, receive counts and redrive. `wait_time` is not honored.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn with_redrive(self, source: &str, policy: RedrivePolicy) -> Self {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .redrive
            .insert(source.to_string(), policy);
        self
    }

    /// The next `count` provider send calls fail with a pool error.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().expect("queue mutex poisoned").failing_sends = count;
    }

    /// After `successes` more successful send calls, the next one fails once.
    pub fn fail_send_after(&self, successes: usize) {
        self.state.lock().expect("queue mutex poisoned").fail_after_sends = Some(successes);
    }

    /// Successful provider send calls so far.
    pub fn send_calls(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").send_calls
    }

    pub fn len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .queues
            .get(queue)
            .map_or(0, Vec::len)
    }

    pub fn visible_len(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .queues
            .get(queue)
            .map_or(0, |messages| {
                messages.iter().filter(|m| m.visible_at <= now).count()
            })
    }

    /// Expires every visibility timeout, as if the handlers had crashed.
    pub fn expire_visibility(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("queue mutex poisoned");
        for message in state.queues.values_mut().flatten() {
            message.visible_at = now;
        }
    }

    /// Enqueues a body that has already been received `receive_count` times.
    pub fn push_with_receive_count(&self, queue: &str, body: String, receive_count: u32) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.next_id += 1;
        let id = state.next_id;
        state.queues.entry(queue.to_string()).or_default().push(StoredMessage {
            id,
            body,
            receive_count,
            visible_at: Instant::now(),
        });
    }
}

fn parse_memory_receipt(receipt_handle: &str) -> Result<(u64, u32), QueueError> {
    let invalid = || QueueError::InvalidReceipt(receipt_handle.to_string());
    let (id, count) = receipt_handle.split_once(':').ok_or_else(invalid)?;
    Ok((
        id.parse().map_err(|_| invalid())?,
        count.parse().map_err(|_| invalid())?,
    ))
}

impl MessageQueue for MemoryQueue {
    fn send_entries<'a>(
        &'a self,
        queue: &'a str,
        bodies: &'a [String],
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            if bodies.len() > MAX_BATCH_ENTRIES {
                return Err(QueueError::BatchTooLarge(bodies.len()));
            }
            let mut state = self.state.lock().expect("queue mutex poisoned");
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(QueueError::Pool(PoolError::Closed));
            }
            match state.fail_after_sends {
                Some(0) => {
                    state.fail_after_sends = None;
                    return Err(QueueError::Pool(PoolError::Closed));
                }
                Some(remaining) => state.fail_after_sends = Some(remaining - 1),
                None => {}
            }
            state.send_calls += 1;
            let now = Instant::now();
            for body in bodies {
                state.next_id += 1;
                let id = state.next_id;
                state
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push(StoredMessage {
                        id,
                        body: body.clone(),
                        receive_count: 0,
                        visible_at: now,
                    });
            }
            Ok(())
        })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        options: ReceiveOptions,
    ) -> BoxFuture<'a, Result<Vec<QueueMessage>, QueueError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut state = self.state.lock().expect("queue mutex poisoned");

            if let Some(policy) = state.redrive.get(queue).cloned() {
                let messages = state.queues.entry(queue.to_string()).or_default();
                let (exhausted, kept): (Vec<_>, Vec<_>) =
                    messages.drain(..).partition(|message| {
                        message.visible_at <= now
                            && message.receive_count >= policy.max_receive_count
                    });
                *messages = kept;
                state
                    .queues
                    .entry(policy.dead_letter_queue.clone())
                    .or_default()
                    .extend(exhausted);
            }

            let visibility = options.visibility_timeout;
            let limit = options.max_messages.clamp(1, MAX_BATCH_ENTRIES);
            let received = state
                .queues
                .entry(queue.to_string())
                .or_default()
                .iter_mut()
                .filter(|message| message.visible_at <= now)
                .take(limit)
                .map(|message| {
                    message.receive_count += 1;
                    message.visible_at = now + visibility;
                    QueueMessage {
                        message_id: message.id.to_string(),
                        receipt_handle: format!("{}:{}", message.id, message.receive_count),
                        body: message.body.clone(),
                        receive_count: message.receive_count,
                    }
                })
                .collect();
            Ok(received)
        })
    }

    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt_handle: &'a str,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let (id, receive_count) = parse_memory_receipt(receipt_handle)?;
            let mut state = self.state.lock().expect("queue mutex poisoned");
            if let Some(messages) = state.queues.get_mut(queue) {
                messages.retain(|m| !(m.id == id && m.receive_count == receive_count));
            }
            Ok(())
        })
    }
}

/// Notifier that keeps everything it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::Database(
                    diesel::result::Error::BrokenTransactionManager,
                ));
            }
            self.sent
                .lock()
                .expect("notifier mutex poisoned")
                .push(notification.clone());
            Ok(())
        })
    }
}

/// Persister that replays scripted failures before succeeding.
#[derive(Default)]
pub struct MockPersister {
    script: Mutex<VecDeque<PersistError>>,
    inserted: Mutex<Vec<NewProduct>>,
    calls: AtomicUsize,
}

impl MockPersister {
    /// Each listed error is returned by one call, in order; later calls succeed.
    pub fn failing_with(errors: Vec<PersistError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inserted(&self) -> Vec<NewProduct> {
        self.inserted.lock().expect("persister mutex poisoned").clone()
    }
}

impl ProductPersister for MockPersister {
    fn insert_products<'a>(
        &'a self,
        rows: &'a [NewProduct],
    ) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.lock().expect("persister mutex poisoned").pop_front() {
                return Err(err);
            }
            self.inserted
                .lock()
                .expect("persister mutex poisoned")
                .extend_from_slice(rows);
            Ok(rows.len())
        })
    }
}

pub fn test_config(chunk_size: usize) -> IngestConfig {
    IngestConfig {
        chunk_queue: CHUNK_QUEUE.to_string(),
        dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
        chunk_size,
        retry_policy: RetryPolicy::immediate(3),
        ..IngestConfig::default()
    }
}

pub fn drain_options() -> ReceiveOptions {
    ReceiveOptions {
        max_messages: MAX_BATCH_ENTRIES,
        wait_time: Duration::ZERO,
        visibility_timeout: Duration::from_secs(300),
    }
}

pub fn worker_config(max_receive_count: u32) -> WorkerConfig {
    WorkerConfig {
        chunk_queue: CHUNK_QUEUE.to_string(),
        dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
        max_receive_count,
        receive: drain_options(),
        pollers: 1,
        error_backoff: Duration::from_millis(10),
    }
}

/// A fully wired service over in-memory collaborators.
pub struct Pipeline {
    pub service: Arc<IngestionService>,
    pub jobs: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryQueue>,
    pub client: QueueClient,
    pub blobs: Arc<ObjectStoreBlobs>,
    pub persister: Arc<MockPersister>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Pipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self::with_persister(config, MockPersister::default())
    }

    pub fn with_persister(config: IngestConfig, persister: MockPersister) -> Self {
        let jobs = Arc::new(MemoryJobStore::default());
        let queue = Arc::new(MemoryQueue::default().with_redrive(
            &config.chunk_queue,
            RedrivePolicy {
                dead_letter_queue: config.dead_letter_queue.clone(),
                max_receive_count: 3,
            },
        ));
        let client = QueueClient::new(queue.clone());
        let blobs = Arc::new(ObjectStoreBlobs::new(Arc::new(InMemory::new())));
        let persister = Arc::new(persister);
        let notifier = Arc::new(RecordingNotifier::default());
        let service = Arc::new(IngestionService::new(
            jobs.clone(),
            client.clone(),
            blobs.clone(),
            persister.clone(),
            notifier.clone(),
            config,
        ));
        Self {
            service,
            jobs,
            queue,
            client,
            blobs,
            persister,
            notifier,
        }
    }

    /// Stores `csv` and starts an upload for it.
    pub async fn submit(&self, seller_id: &str, csv: &str) -> Uuid {
        let job_id = Uuid::new_v4();
        let object_key = format!("uploads/{seller_id}/{job_id}/catalog.csv");
        self.blobs
            .put_object(&object_key, Bytes::from(csv.to_string()))
            .await
            .expect("put should succeed");
        let data_rows = crate::ingest::csv::split_lines(csv).len().saturating_sub(1);
        self.service
            .start_upload(StartUpload {
                seller_id: seller_id.to_string(),
                job_id,
                object_key,
                file_name: "catalog.csv".to_string(),
                total_rows: i64::try_from(data_rows.max(1)).expect("row count fits"),
            })
            .await
            .expect("upload should be accepted")
    }

    /// Receives everything currently visible on `queue`.
    pub async fn receive_all(&self, queue: &str) -> Vec<QueueMessage> {
        let mut all = Vec::new();
        loop {
            let batch = self
                .client
                .receive(queue, drain_options())
                .await
                .expect("receive should succeed");
            if batch.is_empty() {
                return all;
            }
            all.extend(batch);
        }
    }
}
