//! Durable `BatchJob` state.
//!
//! Counter mutations go through `record_chunk`, which folds one chunk outcome into the job
//! under the job row lock and returns the post-update chunk totals. Terminal transitions are
//! conditional on the job still being `processing`, so at most one caller finalizes a
//! generation.

mod ledger;
mod postgres;
mod types;

pub use ledger::{
    plan_chunk_transition, replace_chunk_errors, ChunkTransition, CounterDelta, JobSnapshot,
};
pub use postgres::PgJobStore;
pub use types::{
    BatchJob, ChunkDisposition, ChunkRecordOutcome, ChunkReport, ChunkStatus, ChunkTally,
    FinalizedJob, JobProgress, JobStatus, JobStoreError, NewBatchJob, RowError,
};

use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

pub trait JobStore: Send + Sync {
    /// Inserts a `pending` job.
    fn create_job<'a>(
        &'a self,
        job: &'a NewBatchJob,
    ) -> BoxFuture<'a, Result<BatchJob, JobStoreError>>;

    fn get_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>>;

    /// Removes a job and its ledger. Returns whether a row existed.
    fn delete_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool, JobStoreError>>;

    /// `pending | processing -> processing` for the given generation.
    ///
    /// Returns `None` when the job is missing, terminal, or on another generation.
    fn mark_processing(
        &self,
        job_id: Uuid,
        generation: i32,
    ) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>>;

    /// Persists the split result on a `processing` job of the given generation.
    fn set_chunk_plan(
        &self,
        job_id: Uuid,
        generation: i32,
        total_rows: i32,
        total_chunks: i32,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>>;

    /// Records one chunk outcome and returns the resulting chunk counters.
    fn record_chunk<'a>(
        &'a self,
        job_id: Uuid,
        report: &'a ChunkReport,
    ) -> BoxFuture<'a, Result<ChunkRecordOutcome, JobStoreError>>;

    /// Latest recorded outcome of one chunk, if any.
    fn chunk_status(
        &self,
        job_id: Uuid,
        generation: i32,
        chunk_index: i32,
    ) -> BoxFuture<'_, Result<Option<ChunkStatus>, JobStoreError>>;

    /// `pending | processing -> failed` before any chunk was dispatched, appending `error`.
    ///
    /// Keeps `object_key` so the job stays retryable.
    fn fail_job<'a>(
        &'a self,
        job_id: Uuid,
        generation: i32,
        error: &'a RowError,
    ) -> BoxFuture<'a, Result<Option<BatchJob>, JobStoreError>>;

    /// `processing -> status`. Only one caller per generation gets `Some`.
    ///
    /// A `completed` job releases its `object_key`; a `failed` one keeps it for retries.
    fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> BoxFuture<'_, Result<Option<FinalizedJob>, JobStoreError>>;

    /// `failed -> pending` while `retry_count < max_retries`.
    ///
    /// Zeroes progress, chunk counters and errors, bumps `retry_count`, and drops the ledger.
    fn reset_for_retry(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>>;
}

impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn create_job<'a>(
        &'a self,
        job: &'a NewBatchJob,
    ) -> BoxFuture<'a, Result<BatchJob, JobStoreError>> {
        (**self).create_job(job)
    }

    fn get_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        (**self).get_job(job_id)
    }

    fn delete_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        (**self).delete_job(job_id)
    }

    fn mark_processing(
        &self,
        job_id: Uuid,
        generation: i32,
    ) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        (**self).mark_processing(job_id, generation)
    }

    fn set_chunk_plan(
        &self,
        job_id: Uuid,
        generation: i32,
        total_rows: i32,
        total_chunks: i32,
    ) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        (**self).set_chunk_plan(job_id, generation, total_rows, total_chunks)
    }

    fn record_chunk<'a>(
        &'a self,
        job_id: Uuid,
        report: &'a ChunkReport,
    ) -> BoxFuture<'a, Result<ChunkRecordOutcome, JobStoreError>> {
        (**self).record_chunk(job_id, report)
    }

    fn chunk_status(
        &self,
        job_id: Uuid,
        generation: i32,
        chunk_index: i32,
    ) -> BoxFuture<'_, Result<Option<ChunkStatus>, JobStoreError>> {
        (**self).chunk_status(job_id, generation, chunk_index)
    }

    fn fail_job<'a>(
        &'a self,
        job_id: Uuid,
        generation: i32,
        error: &'a RowError,
    ) -> BoxFuture<'a, Result<Option<BatchJob>, JobStoreError>> {
        (**self).fail_job(job_id, generation, error)
    }

    fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> BoxFuture<'_, Result<Option<FinalizedJob>, JobStoreError>> {
        (**self).finish_job(job_id, status)
    }

    fn reset_for_retry(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        (**self).reset_for_retry(job_id)
    }
}
