use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for job persistence.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("database operation failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("failed to acquire DB pool connection: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
    #[error("invalid job status value in database: {0}")]
    InvalidStatus(String),
    #[error("invalid chunk status value in database: {0}")]
    InvalidChunkStatus(String),
    #[error("malformed job error list: {0}")]
    ErrorList(#[from] serde_json::Error),
}

/// Lifecycle of one uploaded file.
///
/// `pending -> processing -> completed | failed`, and `failed -> pending` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, JobStoreError> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobStoreError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One rejected CSV row. `row` is the 1-based data-row number; `0` refers to the file itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: i64,
    pub error: String,
}

impl RowError {
    pub fn new(row: i64, error: impl Into<String>) -> Self {
        Self {
            row,
            error: error.into(),
        }
    }
}

/// Projection of a `batch_jobs` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: Uuid,
    pub seller_id: String,
    pub status: JobStatus,
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
    pub errors: Vec<RowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            status: self.status,
            total_chunks: self.total_chunks,
            chunks_completed: self.chunks_completed,
            chunks_failed: self.chunks_failed,
        }
    }
}

/// Insert payload for a freshly accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBatchJob {
    pub id: Uuid,
    pub seller_id: String,
    pub file_name: String,
    pub object_key: String,
    pub total_rows: i32,
    pub max_retries: i32,
}

/// Chunk counters returned by atomic increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub status: JobStatus,
    pub total_chunks: i32,
    pub chunks_completed: i32,
    pub chunks_failed: i32,
}

impl JobProgress {
    pub fn chunks_done(&self) -> i32 {
        self.chunks_completed + self.chunks_failed
    }

    /// True once every chunk of a split job has a recorded outcome.
    pub fn all_chunks_done(&self) -> bool {
        self.chunks_done() >= self.total_chunks
    }
}

/// Outcome class of one chunk delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(value: &str) -> Result<Self, JobStoreError> {
        match value {
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(JobStoreError::InvalidChunkStatus(other.to_string())),
        }
    }
}

/// Counters produced by handling one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub generation: i32,
    pub chunk_index: i32,
    pub status: ChunkStatus,
    pub processed_rows: i32,
    pub created_count: i32,
    pub error_count: i32,
    pub errors: Vec<RowError>,
}

/// Ledger entry: the most recent recorded outcome of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTally {
    pub status: ChunkStatus,
    pub processed_rows: i32,
    pub created_count: i32,
    pub error_count: i32,
}

impl From<&ChunkReport> for ChunkTally {
    fn from(report: &ChunkReport) -> Self {
        Self {
            status: report.status,
            processed_rows: report.processed_rows,
            created_count: report.created_count,
            error_count: report.error_count,
        }
    }
}

/// What `record_chunk` did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Counters were updated. `previous` is the outcome this report superseded, if any.
    Recorded { previous: Option<ChunkStatus> },
    /// The chunk already completed; duplicate deliveries leave counters untouched.
    AlreadyCompleted,
    /// The report belongs to an earlier retry generation of the job.
    StaleGeneration { current: i32 },
    /// The job is not `processing` (already finalized, or reset for retry).
    JobNotProcessing(JobStatus),
    /// `chunk_index` is outside `[0, total_chunks)`.
    OutOfRange { total_chunks: i32 },
    JobMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecordOutcome {
    pub disposition: ChunkDisposition,
    /// Counters after the operation; `None` only when the job does not exist.
    pub progress: Option<JobProgress>,
}

impl ChunkRecordOutcome {
    pub fn applied(&self) -> bool {
        matches!(self.disposition, ChunkDisposition::Recorded { .. })
    }
}

/// A job that left `processing`, plus the upload key it released.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedJob {
    pub job: BatchJob,
    pub released_object_key: Option<String>,
}
