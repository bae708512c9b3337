use chrono::Utc;
use diesel::insert_into;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use uuid::Uuid;

use super::ledger::{plan_chunk_transition, replace_chunk_errors, ChunkTransition, JobSnapshot};
use super::types::{
    BatchJob, ChunkDisposition, ChunkRecordOutcome, ChunkReport, ChunkStatus, ChunkTally,
    FinalizedJob, JobStatus, JobStoreError, NewBatchJob, RowError,
};
use super::JobStore;
use crate::db::models::{BatchJobRow, ChunkLedgerRow, NewBatchJobRow};
use crate::db::schema::{batch_job_chunks, batch_jobs};
use crate::db::DbPool;

pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn map_job_row(row: BatchJobRow) -> Result<BatchJob, JobStoreError> {
    Ok(BatchJob {
        id: row.id,
        seller_id: row.seller_id,
        status: JobStatus::from_db_str(&row.status)?,
        file_name: row.file_name,
        object_key: row.object_key,
        total_rows: row.total_rows,
        processed_rows: row.processed_rows,
        created_count: row.created_count,
        error_count: row.error_count,
        total_chunks: row.total_chunks,
        chunks_completed: row.chunks_completed,
        chunks_failed: row.chunks_failed,
        retry_count: row.retry_count,
        max_retries: row.max_retries,
        errors: serde_json::from_value(row.errors)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn map_ledger_row(row: &ChunkLedgerRow) -> Result<ChunkTally, JobStoreError> {
    Ok(ChunkTally {
        status: ChunkStatus::from_db_str(&row.status)?,
        processed_rows: row.processed_rows,
        created_count: row.created_count,
        error_count: row.error_count,
    })
}

/// Reads the job row under `FOR UPDATE`; callers must be inside a transaction.
async fn lock_job(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
) -> Result<Option<BatchJobRow>, diesel::result::Error> {
    batch_jobs::table
        .find(job_id)
        .select(BatchJobRow::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()
}

async fn record_chunk_locked(
    conn: &mut AsyncPgConnection,
    job_id: Uuid,
    report: &ChunkReport,
) -> Result<ChunkRecordOutcome, JobStoreError> {
    let Some(row) = lock_job(conn, job_id).await? else {
        return Ok(ChunkRecordOutcome {
            disposition: ChunkDisposition::JobMissing,
            progress: None,
        });
    };
    let job = map_job_row(row)?;
    let snapshot = JobSnapshot {
        status: job.status,
        generation: job.retry_count,
        total_chunks: job.total_chunks,
    };

    let existing_row = batch_job_chunks::table
        .find((job_id, report.generation, report.chunk_index))
        .select(ChunkLedgerRow::as_select())
        .first(conn)
        .await
        .optional()?;
    let existing = existing_row.as_ref().map(map_ledger_row).transpose()?;

    match plan_chunk_transition(&snapshot, existing.as_ref(), report) {
        ChunkTransition::Skip(disposition) => Ok(ChunkRecordOutcome {
            disposition,
            progress: Some(job.progress()),
        }),
        ChunkTransition::Apply {
            delta,
            entry,
            previous,
        } => {
            let now = Utc::now();
            let ledger = ChunkLedgerRow {
                job_id,
                generation: report.generation,
                chunk_index: report.chunk_index,
                status: entry.status.as_db_str().to_string(),
                processed_rows: entry.processed_rows,
                created_count: entry.created_count,
                error_count: entry.error_count,
                errors: serde_json::to_value(&report.errors)?,
                updated_at: now,
            };
            insert_into(batch_job_chunks::table)
                .values(&ledger)
                .on_conflict((
                    batch_job_chunks::job_id,
                    batch_job_chunks::generation,
                    batch_job_chunks::chunk_index,
                ))
                .do_update()
                .set(&ledger)
                .execute(conn)
                .await?;

            let previous_errors: Vec<RowError> = match existing_row {
                Some(row) => serde_json::from_value(row.errors)?,
                None => Vec::new(),
            };
            let errors = replace_chunk_errors(job.errors, &previous_errors, &report.errors);

            let updated = diesel::update(batch_jobs::table.find(job_id))
                .set((
                    batch_jobs::processed_rows
                        .eq(batch_jobs::processed_rows + delta.processed_rows),
                    batch_jobs::created_count.eq(batch_jobs::created_count + delta.created_count),
                    batch_jobs::error_count.eq(batch_jobs::error_count + delta.error_count),
                    batch_jobs::chunks_completed
                        .eq(batch_jobs::chunks_completed + delta.chunks_completed),
                    batch_jobs::chunks_failed.eq(batch_jobs::chunks_failed + delta.chunks_failed),
                    batch_jobs::errors.eq(serde_json::to_value(&errors)?),
                    batch_jobs::updated_at.eq(now),
                ))
                .returning(BatchJobRow::as_returning())
                .get_result(conn)
                .await?;

            Ok(ChunkRecordOutcome {
                disposition: ChunkDisposition::Recorded { previous },
                progress: Some(map_job_row(updated)?.progress()),
            })
        }
    }
}

impl JobStore for PgJobStore {
    fn create_job<'a>(
        &'a self,
        job: &'a NewBatchJob,
    ) -> BoxFuture<'a, Result<BatchJob, JobStoreError>> {
        Box::pin(async move {
            let row = NewBatchJobRow {
                id: job.id,
                seller_id: &job.seller_id,
                status: JobStatus::Pending.as_db_str(),
                file_name: &job.file_name,
                object_key: Some(job.object_key.as_str()),
                total_rows: job.total_rows,
                max_retries: job.max_retries,
            };

            let mut conn = self.pool.get().await?;
            let inserted = insert_into(batch_jobs::table)
                .values(&row)
                .returning(BatchJobRow::as_returning())
                .get_result(&mut conn)
                .await?;
            map_job_row(inserted)
        })
    }

    fn get_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            batch_jobs::table
                .find(job_id)
                .select(BatchJobRow::as_select())
                .first(&mut conn)
                .await
                .optional()?
                .map(map_job_row)
                .transpose()
        })
    }

    fn delete_job(&self, job_id: Uuid) -> BoxFuture<'_, Result<bool, JobStoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let deleted = diesel::delete(batch_jobs::table.find(job_id))
                .execute(&mut conn)
                .await?;
            Ok(deleted > 0)
        })
    }

    fn mark_processing(
        &self,
        job_id: Uuid,
        generation: i32,
    ) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            diesel::update(
                batch_jobs::table
                    .filter(batch_jobs::id.eq(job_id))
                    .filter(batch_jobs::status.eq_any([
                        JobStatus::Pending.as_db_str(),
                        JobStatus::Processing.as_db_str(),
                    ]))
                    .filter(batch_jobs::retry_count.eq(generation)),
            )
            .set((
                batch_jobs::status.eq(JobStatus::Processing.as_db_str()),
                batch_jobs::updated_at.eq(Utc::now()),
            ))
            .returning(BatchJobRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?
            .map(map_job_row)
            .transpose()
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
            let mut conn = self.pool.get().await?;
            let updated = diesel::update(
                batch_jobs::table
                    .filter(batch_jobs::id.eq(job_id))
                    .filter(batch_jobs::status.eq(JobStatus::Processing.as_db_str()))
                    .filter(batch_jobs::retry_count.eq(generation)),
            )
            .set((
                batch_jobs::total_rows.eq(total_rows),
                batch_jobs::total_chunks.eq(total_chunks),
                batch_jobs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
            Ok(updated > 0)
        })
    }

    fn record_chunk<'a>(
        &'a self,
        job_id: Uuid,
        report: &'a ChunkReport,
    ) -> BoxFuture<'a, Result<ChunkRecordOutcome, JobStoreError>> {
        Box::pin(async move {
            let mut pooled = self.pool.get().await?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            conn.transaction::<_, JobStoreError, _>(|conn| {
                async move { record_chunk_locked(conn, job_id, report).await }.scope_boxed()
            })
            .await
        })
    }

    fn chunk_status(
        &self,
        job_id: Uuid,
        generation: i32,
        chunk_index: i32,
    ) -> BoxFuture<'_, Result<Option<ChunkStatus>, JobStoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            batch_job_chunks::table
                .find((job_id, generation, chunk_index))
                .select(batch_job_chunks::status)
                .first::<String>(&mut conn)
                .await
                .optional()?
                .map(|status| ChunkStatus::from_db_str(&status))
                .transpose()
        })
    }

    fn fail_job<'a>(
        &'a self,
        job_id: Uuid,
        generation: i32,
        error: &'a RowError,
    ) -> BoxFuture<'a, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut pooled = self.pool.get().await?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            conn.transaction::<_, JobStoreError, _>(|conn| {
                async move {
                    let Some(row) = lock_job(conn, job_id).await? else {
                        return Ok(None);
                    };
                    let job = map_job_row(row)?;
                    if job.status.is_terminal() || job.retry_count != generation {
                        return Ok(None);
                    }

                    let mut errors = job.errors;
                    errors.push(error.clone());
                    let updated = diesel::update(batch_jobs::table.find(job_id))
                        .set((
                            batch_jobs::status.eq(JobStatus::Failed.as_db_str()),
                            batch_jobs::errors.eq(serde_json::to_value(&errors)?),
                            batch_jobs::updated_at.eq(Utc::now()),
                        ))
                        .returning(BatchJobRow::as_returning())
                        .get_result(conn)
                        .await?;
                    map_job_row(updated).map(Some)
                }
                .scope_boxed()
            })
            .await
        })
    }

    fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> BoxFuture<'_, Result<Option<FinalizedJob>, JobStoreError>> {
        Box::pin(async move {
            let mut pooled = self.pool.get().await?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            conn.transaction::<_, JobStoreError, _>(|conn| {
                async move {
                    let Some(row) = lock_job(conn, job_id).await? else {
                        return Ok(None);
                    };
                    if row.status != JobStatus::Processing.as_db_str() {
                        return Ok(None);
                    }
                    // Failed jobs keep their source so they stay retryable.
                    let (kept_object_key, released_object_key) = match status {
                        JobStatus::Completed => (None, row.object_key),
                        _ => (row.object_key, None),
                    };

                    let updated = diesel::update(batch_jobs::table.find(job_id))
                        .set((
                            batch_jobs::status.eq(status.as_db_str()),
                            batch_jobs::object_key.eq(kept_object_key),
                            batch_jobs::updated_at.eq(Utc::now()),
                        ))
                        .returning(BatchJobRow::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok(Some(FinalizedJob {
                        job: map_job_row(updated)?,
                        released_object_key,
                    }))
                }
                .scope_boxed()
            })
            .await
        })
    }

    fn reset_for_retry(&self, job_id: Uuid) -> BoxFuture<'_, Result<Option<BatchJob>, JobStoreError>> {
        Box::pin(async move {
            let mut pooled = self.pool.get().await?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            conn.transaction::<_, JobStoreError, _>(|conn| {
                async move {
                    let reset = diesel::update(
                        batch_jobs::table
                            .filter(batch_jobs::id.eq(job_id))
                            .filter(batch_jobs::status.eq(JobStatus::Failed.as_db_str()))
                            .filter(batch_jobs::retry_count.lt(batch_jobs::max_retries)),
                    )
                    .set((
                        batch_jobs::status.eq(JobStatus::Pending.as_db_str()),
                        batch_jobs::processed_rows.eq(0),
                        batch_jobs::created_count.eq(0),
                        batch_jobs::error_count.eq(0),
                        batch_jobs::total_chunks.eq(0),
                        batch_jobs::chunks_completed.eq(0),
                        batch_jobs::chunks_failed.eq(0),
                        batch_jobs::errors.eq(serde_json::json!([])),
                        batch_jobs::retry_count.eq(batch_jobs::retry_count + 1),
                        batch_jobs::updated_at.eq(Utc::now()),
                    ))
                    .returning(BatchJobRow::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?;

                    let Some(row) = reset else {
                        return Ok(None);
                    };
                    diesel::delete(
                        batch_job_chunks::table.filter(batch_job_chunks::job_id.eq(job_id)),
                    )
                    .execute(conn)
                    .await?;
                    map_job_row(row).map(Some)
                }
                .scope_boxed()
            })
            .await
        })
    }
}
