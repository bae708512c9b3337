use std::time::Duration;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::db::DbPool;

/// Shared by the health/metrics server and the worker tasks of one process.
pub struct AppState {
    pub pool: DbPool,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    /// Upper bound on acquiring a connection for `/health`.
    pub health_timeout: Duration,
}

impl AppState {
    pub fn new(pool: DbPool, shutdown_token: CancellationToken) -> Self {
        Self {
            pool,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            health_timeout: Duration::from_secs(2),
        }
    }
}
