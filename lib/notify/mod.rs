//! Seller notification sink.

use std::sync::Arc;

use diesel::insert_into;
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::NewNotificationRow;
use crate::db::schema::notifications;
use crate::db::DbPool;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("notification pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BatchCompleted,
    BatchFailed,
    BatchCompletedWithErrors,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::BatchCompleted => "batch_completed",
            NotificationKind::BatchFailed => "batch_failed",
            NotificationKind::BatchCompletedWithErrors => "batch_completed_with_errors",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub seller_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification)
        -> BoxFuture<'a, Result<(), NotifyError>>;
}

impl<T> Notifier for Arc<T>
where
    T: Notifier + ?Sized,
{
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        (**self).notify(notification)
    }
}

/// Writes notifications to the `notifications` table for the seller-facing inbox.
pub struct PgNotifier {
    pool: DbPool,
}

impl PgNotifier {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl Notifier for PgNotifier {
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let row = NewNotificationRow {
                id: Uuid::new_v4(),
                seller_id: &notification.seller_id,
                kind: notification.kind.as_str(),
                title: &notification.title,
                message: &notification.message,
                metadata: notification.metadata.clone(),
            };

            let mut conn = self.pool.get().await?;
            insert_into(notifications::table)
                .values(&row)
                .execute(&mut conn)
                .await?;

            tracing::info!(
                event = "notification_stored",
                seller_id = %notification.seller_id,
                kind = notification.kind.as_str(),
                "stored seller notification"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::NotificationKind;

    #[test]
    fn kinds_use_wire_names() {
        for kind in [
            NotificationKind::BatchCompleted,
            NotificationKind::BatchFailed,
            NotificationKind::BatchCompletedWithErrors,
        ] {
            let encoded = serde_json::to_value(kind).expect("kind should serialize");
            assert_eq!(encoded, serde_json::Value::from(kind.as_str()));
        }
    }
}
