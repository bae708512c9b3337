//! Batch CSV ingestion: upload acceptance, splitting, chunk processing and finalization.

pub mod csv;
mod error;
pub mod messages;
mod persister;
mod service;

pub use error::{IngestError, RetryRejection};
pub use messages::{ChunkMessage, DeadLetterMessage, FileUploadedMessage, PipelineMessage};
pub use persister::{
    map_diesel_error, PersistError, PersistErrorKind, PgProductPersister, ProductPersister,
};
pub use service::{
    completion_notification, ChunkOutcome, DeadLetterOutcome, IngestConfig, IngestionService,
    SplitOutcome, StartUpload, UploadTicket,
};
