use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ingest::IngestConfig;
use crate::queue::{ReceiveOptions, MAX_BATCH_ENTRIES};
use crate::worker::WorkerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {name}: `{value}` ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Where uploaded CSV files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// S3 bucket; credentials and region come from the standard `AWS_*` variables.
    S3 { bucket: String },
    Local { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_url: String,
    pub db_pool_size: usize,
    /// `None` when neither `STORAGE_BUCKET` nor `STORAGE_ROOT` is set.
    pub storage: Option<StorageBackend>,
    pub metrics_bind: SocketAddr,
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let db_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let storage = match (var("STORAGE_BUCKET"), var("STORAGE_ROOT")) {
            (Some(bucket), _) => Some(StorageBackend::S3 { bucket }),
            (None, Some(root)) => Some(StorageBackend::Local {
                root: PathBuf::from(root),
            }),
            (None, None) => None,
        };

        let chunk_queue = var("CHUNK_QUEUE").unwrap_or_else(|| "csv-ingest".to_string());
        let dead_letter_queue =
            var("DEAD_LETTER_QUEUE").unwrap_or_else(|| "csv-ingest-dlq".to_string());

        let max_receive_count: u32 = parse_var(&var, "MAX_RECEIVE_COUNT", 3)?;
        let visibility_secs: u64 = parse_var(&var, "VISIBILITY_TIMEOUT_SECS", 300)?;
        let wait_secs: u64 = parse_var(&var, "RECEIVE_WAIT_SECS", 20)?;
        let batch_size: usize = parse_var(&var, "RECEIVE_BATCH_SIZE", MAX_BATCH_ENTRIES)?;
        let pollers: usize = parse_var(&var, "CHUNK_POLLERS", 2)?;
        let upload_url_ttl_secs: u64 = parse_var(&var, "UPLOAD_URL_TTL_SECS", 900)?;
        let db_pool_size: usize = parse_var(&var, "DB_POOL_SIZE", 16)?;
        let metrics_bind: SocketAddr =
            parse_var(&var, "METRICS_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        ensure(
            "MAX_RECEIVE_COUNT",
            max_receive_count,
            max_receive_count > 0,
            "must be > 0",
        )?;
        ensure(
            "RECEIVE_BATCH_SIZE",
            batch_size,
            (1..=MAX_BATCH_ENTRIES).contains(&batch_size),
            &format!("must be between 1 and {MAX_BATCH_ENTRIES}"),
        )?;
        ensure("CHUNK_POLLERS", pollers, pollers > 0, "must be > 0")?;
        ensure("DB_POOL_SIZE", db_pool_size, db_pool_size > 0, "must be > 0")?;

        let ingest = IngestConfig {
            chunk_queue: chunk_queue.clone(),
            dead_letter_queue: dead_letter_queue.clone(),
            upload_url_ttl: Duration::from_secs(upload_url_ttl_secs),
            ..IngestConfig::default()
        };
        let worker = WorkerConfig {
            chunk_queue,
            dead_letter_queue,
            max_receive_count,
            receive: ReceiveOptions {
                max_messages: batch_size,
                wait_time: Duration::from_secs(wait_secs),
                visibility_timeout: Duration::from_secs(visibility_secs),
            },
            pollers,
            ..WorkerConfig::default()
        };

        Ok(Self {
            db_url,
            db_pool_size,
            storage,
            metrics_bind,
            ingest,
            worker,
        })
    }

    pub fn storage_backend(&self) -> Result<&StorageBackend, ConfigError> {
        self.storage
            .as_ref()
            .ok_or(ConfigError::Missing("STORAGE_BUCKET or STORAGE_ROOT"))
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value: raw,
            reason: err.to_string(),
        }),
    }
}

fn ensure<T: ToString>(
    name: &'static str,
    value: T,
    ok: bool,
    reason: &str,
) -> Result<(), ConfigError> {
    if ok {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    })
}
