//! Transport boundary for pipeline messages.
//!
//! `MessageQueue` is the provider seam (one call per provider request). `QueueClient` layers
//! JSON payloads and batch splitting on top of it. No ingestion logic lives here.

mod postgres;

pub use postgres::{PgMessageQueue, RedrivePolicy};

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest number of entries a single provider send call accepts.
pub const MAX_BATCH_ENTRIES: usize = 10;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("queue pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),

    #[error("failed to encode message body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to parse message body: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("batch of {0} entries exceeds provider limit of {MAX_BATCH_ENTRIES}")]
    BatchTooLarge(usize),
}

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Opaque token identifying this delivery; required to acknowledge it.
    pub receipt_handle: String,
    pub body: String,
    /// Number of times the message has been received, including this delivery.
    pub receive_count: u32,
}

/// Long-poll parameters for one receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: MAX_BATCH_ENTRIES,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Provider-level queue operations.
pub trait MessageQueue: Send + Sync {
    /// Sends at most [`MAX_BATCH_ENTRIES`] bodies in one provider call.
    fn send_entries<'a>(
        &'a self,
        queue: &'a str,
        bodies: &'a [String],
    ) -> BoxFuture<'a, Result<(), QueueError>>;

    /// Receives up to `options.max_messages`, hiding each one for `options.visibility_timeout`.
    fn receive<'a>(
        &'a self,
        queue: &'a str,
        options: ReceiveOptions,
    ) -> BoxFuture<'a, Result<Vec<QueueMessage>, QueueError>>;

    /// Acknowledges one delivery so it is never redelivered.
    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt_handle: &'a str,
    ) -> BoxFuture<'a, Result<(), QueueError>>;
}

impl<T> MessageQueue for Arc<T>
where
    T: MessageQueue + ?Sized,
{
    fn send_entries<'a>(
        &'a self,
        queue: &'a str,
        bodies: &'a [String],
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        (**self).send_entries(queue, bodies)
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        options: ReceiveOptions,
    ) -> BoxFuture<'a, Result<Vec<QueueMessage>, QueueError>> {
        (**self).receive(queue, options)
    }

    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt_handle: &'a str,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        (**self).delete(queue, receipt_handle)
    }
}

/// JSON-speaking client shared by the ingestion service and the pollers.
#[derive(Clone)]
pub struct QueueClient {
    transport: Arc<dyn MessageQueue>,
}

impl QueueClient {
    pub fn new(transport: Arc<dyn MessageQueue>) -> Self {
        Self { transport }
    }

    pub async fn send<T: Serialize>(&self, queue: &str, payload: &T) -> Result<(), QueueError> {
        let body = serde_json::to_string(payload).map_err(QueueError::Encode)?;
        self.transport
            .send_entries(queue, std::slice::from_ref(&body))
            .await
    }

    /// Sends every payload, one provider call per [`MAX_BATCH_ENTRIES`] group.
    ///
    /// Returns the number of provider calls made.
    pub async fn send_batch<T: Serialize>(
        &self,
        queue: &str,
        payloads: &[T],
    ) -> Result<usize, QueueError> {
        let bodies = payloads
            .iter()
            .map(|payload| serde_json::to_string(payload).map_err(QueueError::Encode))
            .collect::<Result<Vec<_>, _>>()?;

        let mut calls = 0usize;
        for group in bodies.chunks(MAX_BATCH_ENTRIES) {
            self.transport.send_entries(queue, group).await?;
            calls += 1;
        }
        Ok(calls)
    }

    pub async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.transport.receive(queue, options).await
    }

    pub async fn delete(&self, queue: &str, message: &QueueMessage) -> Result<(), QueueError> {
        self.transport.delete(queue, &message.receipt_handle).await
    }
}

/// Decodes a message body as JSON.
pub fn parse_body<T: DeserializeOwned>(message: &QueueMessage) -> Result<T, QueueError> {
    serde_json::from_str(&message.body).map_err(QueueError::Parse)
}

pub fn receive_count(message: &QueueMessage) -> u32 {
    message.receive_count
}
