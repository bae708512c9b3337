//! Queue payloads. Every body is a JSON object with a `type` discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Triggers the split step for one job generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadedMessage {
    pub job_id: Uuid,
    pub seller_id: String,
    pub object_key: String,
    pub file_name: String,
    pub total_rows: i64,
    /// The job's `retry_count` when the message was produced.
    #[serde(default)]
    pub generation: i32,
}

/// One slice of data rows. `start_row`/`end_row` are 1-based data-row numbers, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub job_id: Uuid,
    pub seller_id: String,
    pub object_key: String,
    #[serde(default)]
    pub generation: i32,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub start_row: i64,
    pub end_row: i64,
    pub header_line: String,
    pub rows: Vec<String>,
}

impl ChunkMessage {
    pub fn row_count(&self) -> i64 {
        self.end_row - self.start_row + 1
    }
}

/// A message that exhausted its receive budget on the main queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub original: Box<PipelineMessage>,
    pub error: String,
    pub receive_count: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineMessage {
    #[serde(rename = "csv_file_uploaded")]
    FileUploaded(FileUploadedMessage),
    #[serde(rename = "csv_chunk")]
    Chunk(ChunkMessage),
    #[serde(rename = "csv_dead_letter")]
    DeadLetter(DeadLetterMessage),
    /// Any other discriminator. Logged and dropped by the pollers.
    #[serde(other)]
    Unknown,
}

impl PipelineMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineMessage::FileUploaded(_) => "csv_file_uploaded",
            PipelineMessage::Chunk(_) => "csv_chunk",
            PipelineMessage::DeadLetter(_) => "csv_dead_letter",
            PipelineMessage::Unknown => "unknown",
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            PipelineMessage::FileUploaded(message) => Some(message.job_id),
            PipelineMessage::Chunk(message) => Some(message.job_id),
            PipelineMessage::DeadLetter(message) => message.original.job_id(),
            PipelineMessage::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_messages_use_camel_case_fields_and_type_tag() {
        let message = PipelineMessage::Chunk(ChunkMessage {
            job_id: Uuid::nil(),
            seller_id: "seller-1".to_string(),
            object_key: "uploads/seller-1/x/catalog.csv".to_string(),
            generation: 0,
            chunk_index: 1,
            total_chunks: 2,
            start_row: 1001,
            end_row: 1500,
            header_line: "name,price".to_string(),
            rows: vec!["Widget,10".to_string()],
        });

        let encoded = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(encoded["type"], "csv_chunk");
        assert_eq!(encoded["chunkIndex"], 1);
        assert_eq!(encoded["totalChunks"], 2);
        assert_eq!(encoded["headerLine"], "name,price");
    }

    #[test]
    fn unknown_types_decode_to_the_fallback_variant() {
        let decoded: PipelineMessage =
            serde_json::from_str(r#"{"type":"image_resize","jobId":"abc"}"#)
                .expect("unknown type should still decode");
        assert_eq!(decoded, PipelineMessage::Unknown);
    }

    #[test]
    fn upload_messages_without_generation_default_to_first_generation() {
        let decoded: PipelineMessage = serde_json::from_str(
            r#"{"type":"csv_file_uploaded","jobId":"00000000-0000-0000-0000-000000000000",
                "sellerId":"s","objectKey":"k","fileName":"f.csv","totalRows":3}"#,
        )
        .expect("upload message should decode");

        let PipelineMessage::FileUploaded(message) = decoded else {
            panic!("expected an upload message");
        };
        assert_eq!(message.generation, 0);
        assert_eq!(message.total_rows, 3);
    }

    #[test]
    fn dead_letter_row_count_spans_the_inclusive_range() {
        let chunk = ChunkMessage {
            job_id: Uuid::nil(),
            seller_id: "s".to_string(),
            object_key: "k".to_string(),
            generation: 0,
            chunk_index: 2,
            total_chunks: 3,
            start_row: 2001,
            end_row: 2437,
            header_line: "name,price".to_string(),
            rows: Vec::new(),
        };
        assert_eq!(chunk.row_count(), 437);
    }
}
