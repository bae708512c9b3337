use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::schema::{batch_job_chunks, batch_jobs, notifications, products, queue_messages};

/// Materialized row from `batch_jobs`.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = batch_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BatchJobRow {
    pub id: Uuid,
    pub seller_id: String,
    pub status: String,
    pub file_name: String,
    pub object_key: Option<String>,
    pub total_rows: i32,
    pub processed_rows: i32,
    pub created_count: i32,
    pub error_count: i32,
    pub total_chunks: i32,
    pub chunks_completed: i32,
    pub chunks_failed: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub errors: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = batch_jobs)]
pub struct NewBatchJobRow<'a> {
    pub id: Uuid,
    pub seller_id: &'a str,
    pub status: &'a str,
    pub file_name: &'a str,
    pub object_key: Option<&'a str>,
    pub total_rows: i32,
    pub max_retries: i32,
}

/// One row of the per-chunk outcome ledger.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = batch_job_chunks)]
#[diesel(primary_key(job_id, generation, chunk_index))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ChunkLedgerRow {
    pub job_id: Uuid,
    pub generation: i32,
    pub chunk_index: i32,
    pub status: String,
    pub processed_rows: i32,
    pub created_count: i32,
    pub error_count: i32,
    /// Row errors this outcome contributed to the job's error list.
    pub errors: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = products)]
pub struct NewProduct {
    pub id: Uuid,
    pub seller_id: String,
    pub batch_job_id: Uuid,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub category: String,
    pub stock: i32,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotificationRow<'a> {
    pub id: Uuid,
    pub seller_id: &'a str,
    pub kind: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = queue_messages)]
pub struct NewQueueMessage<'a> {
    pub queue: &'a str,
    pub body: &'a str,
}
