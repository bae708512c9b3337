use std::collections::HashMap;
use std::time::{Duration, Instant};

use diesel::insert_into;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;

use super::{MessageQueue, QueueError, QueueMessage, ReceiveOptions, MAX_BATCH_ENTRIES};
use crate::db::models::NewQueueMessage;
use crate::db::schema::queue_messages;
use crate::db::DbPool;

/// Moves messages from `source` to `dead_letter_queue` once they have been received
/// `max_receive_count` times without being deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_queue: String,
    pub max_receive_count: u32,
}

#[derive(Debug, QueryableByName)]
struct ClaimedRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    body: String,
    #[diesel(sql_type = Integer)]
    receive_count: i32,
}

/// Queue stored in the `queue_messages` table.
///
/// Receives claim rows with `FOR UPDATE SKIP LOCKED` and push `visible_at` forward by the
/// visibility timeout, so concurrent pollers never share a delivery. A delivery that is not
/// deleted becomes visible again once the timeout lapses.
pub struct PgMessageQueue {
    pool: DbPool,
    redrive: HashMap<String, RedrivePolicy>,
    poll_interval: Duration,
}

impl PgMessageQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            redrive: HashMap::new(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_redrive(mut self, source: impl Into<String>, policy: RedrivePolicy) -> Self {
        self.redrive.insert(source.into(), policy);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn redrive_exhausted(&self, queue: &str) -> Result<usize, QueueError> {
        let Some(policy) = self.redrive.get(queue) else {
            return Ok(0);
        };

        let mut conn = self.pool.get().await?;
        let moved = sql_query(
            "UPDATE queue_messages \
             SET queue = $1, visible_at = NOW() \
             WHERE queue = $2 AND visible_at <= NOW() AND receive_count >= $3",
        )
        .bind::<Text, _>(policy.dead_letter_queue.as_str())
        .bind::<Text, _>(queue)
        .bind::<Integer, _>(i32::try_from(policy.max_receive_count).unwrap_or(i32::MAX))
        .execute(&mut conn)
        .await?;

        if moved > 0 {
            tracing::warn!(
                event = "queue_redrive",
                queue,
                dead_letter_queue = %policy.dead_letter_queue,
                moved,
                "moved exhausted messages to dead-letter queue"
            );
        }
        Ok(moved)
    }

    async fn claim_visible(
        &self,
        queue: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.pool.get().await?;
        let limit = i64::try_from(options.max_messages.clamp(1, MAX_BATCH_ENTRIES)).unwrap_or(1);
        let visibility_ms = i64::try_from(options.visibility_timeout.as_millis()).unwrap_or(i64::MAX);

        let rows = sql_query(
            "UPDATE queue_messages \
             SET receive_count = receive_count + 1, \
                 visible_at = NOW() + ($3 * INTERVAL '1 millisecond') \
             WHERE id IN ( \
                 SELECT id FROM queue_messages \
                 WHERE queue = $1 AND visible_at <= NOW() \
                 ORDER BY id \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, body, receive_count",
        )
        .bind::<Text, _>(queue)
        .bind::<BigInt, _>(limit)
        .bind::<BigInt, _>(visibility_ms)
        .load::<ClaimedRow>(&mut conn)
        .await?;

        let mut messages: Vec<QueueMessage> = rows
            .into_iter()
            .map(|row| QueueMessage {
                message_id: row.id.to_string(),
                receipt_handle: format!("{}:{}", row.id, row.receive_count),
                body: row.body,
                receive_count: u32::try_from(row.receive_count).unwrap_or(0),
            })
            .collect();
        messages.sort_by_key(|message| message.message_id.parse::<i64>().unwrap_or_default());
        Ok(messages)
    }
}

fn parse_receipt(receipt_handle: &str) -> Result<(i64, i32), QueueError> {
    let invalid = || QueueError::InvalidReceipt(receipt_handle.to_string());
    let (id, count) = receipt_handle.split_once(':').ok_or_else(invalid)?;
    Ok((
        id.parse().map_err(|_| invalid())?,
        count.parse().map_err(|_| invalid())?,
    ))
}

impl MessageQueue for PgMessageQueue {
    fn send_entries<'a>(
        &'a self,
        queue: &'a str,
        bodies: &'a [String],
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            if bodies.is_empty() {
                return Ok(());
            }
            if bodies.len() > MAX_BATCH_ENTRIES {
                return Err(QueueError::BatchTooLarge(bodies.len()));
            }

            let rows: Vec<NewQueueMessage<'_>> = bodies
                .iter()
                .map(|body| NewQueueMessage {
                    queue,
                    body: body.as_str(),
                })
                .collect();

            let mut conn = self.pool.get().await?;
            insert_into(queue_messages::table)
                .values(&rows)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        options: ReceiveOptions,
    ) -> BoxFuture<'a, Result<Vec<QueueMessage>, QueueError>> {
        Box::pin(async move {
            let deadline = Instant::now() + options.wait_time;
            loop {
                self.redrive_exhausted(queue).await?;
                let messages = self.claim_visible(queue, &options).await?;
                if !messages.is_empty() {
                    return Ok(messages);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn delete<'a>(
        &'a self,
        queue: &'a str,
        receipt_handle: &'a str,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let (id, receive_count) = parse_receipt(receipt_handle)?;
            let mut conn = self.pool.get().await?;
            let deleted = diesel::delete(
                queue_messages::table
                    .filter(queue_messages::id.eq(id))
                    .filter(queue_messages::queue.eq(queue))
                    .filter(queue_messages::receive_count.eq(receive_count)),
            )
            .execute(&mut conn)
            .await?;

            if deleted == 0 {
                tracing::debug!(
                    event = "queue_stale_receipt",
                    queue,
                    receipt_handle,
                    "delete matched no message; delivery was superseded or already removed"
                );
            }
            Ok(())
        })
    }
}
