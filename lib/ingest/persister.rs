use std::sync::Arc;

use diesel::insert_into;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use thiserror::Error;

use crate::db::models::NewProduct;
use crate::db::schema::products;
use crate::db::DbPool;
use crate::retry::is_transient_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    Retryable,
    Fatal,
}

/// Typed persistence failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
}

impl PersistError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: PersistErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PersistErrorKind::Retryable
    }
}

pub fn map_diesel_error(error: DieselError) -> PersistError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => PersistError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            // Deadlocks and connection-limit errors surface as `Unknown` with a telling message.
            _ if is_transient_message(info.message()) => PersistError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            _ => PersistError::fatal(format!(
                "fatal database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            PersistError::retryable("transaction rollback requested by database".to_string())
        }
        other => PersistError::fatal(format!("fatal diesel error: {other}")),
    }
}

/// Writes validated product rows.
pub trait ProductPersister: Send + Sync {
    /// Inserts every row or none. Returns the number of rows inserted.
    fn insert_products<'a>(
        &'a self,
        rows: &'a [NewProduct],
    ) -> BoxFuture<'a, Result<usize, PersistError>>;
}

impl<T> ProductPersister for Arc<T>
where
    T: ProductPersister + ?Sized,
{
    fn insert_products<'a>(
        &'a self,
        rows: &'a [NewProduct],
    ) -> BoxFuture<'a, Result<usize, PersistError>> {
        (**self).insert_products(rows)
    }
}

/// Postgres persister. One transaction per call, split into statements of `statement_rows`.
pub struct PgProductPersister {
    pool: DbPool,
    statement_rows: usize,
}

impl PgProductPersister {
    pub fn new(pool: DbPool, statement_rows: usize) -> Self {
        Self {
            pool,
            statement_rows: statement_rows.max(1),
        }
    }
}

impl ProductPersister for PgProductPersister {
    fn insert_products<'a>(
        &'a self,
        rows: &'a [NewProduct],
    ) -> BoxFuture<'a, Result<usize, PersistError>> {
        Box::pin(async move {
            if rows.is_empty() {
                return Ok(0);
            }

            let mut pooled = self.pool.get().await.map_err(|err| {
                PersistError::retryable(format!("failed to acquire DB pool connection: {err}"))
            })?;
            let conn: &mut AsyncPgConnection = &mut pooled;
            let statement_rows = self.statement_rows;

            conn.transaction::<_, DieselError, _>(|conn| {
                async move {
                    let mut inserted = 0usize;
                    for statement in rows.chunks(statement_rows) {
                        inserted += insert_into(products::table)
                            .values(statement)
                            .execute(conn)
                            .await?;
                    }
                    Ok(inserted)
                }
                .scope_boxed()
            })
            .await
            .map_err(map_diesel_error)
        })
    }
}
