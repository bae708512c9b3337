//! Process entrypoints behind the CLI subcommands.

use crate::{
    cli::{Cli, Command, JobArgs, SubmitArgs, UploadUrlArgs, WorkerArgs},
    config::{Config, ConfigError, StorageBackend},
    db::{build_db_pool, run_migrations, DbPool},
    ingest::{csv::split_lines, IngestError, IngestionService, PgProductPersister, StartUpload},
    jobs::PgJobStore,
    logging::{format_error_report, init_logging},
    notify::PgNotifier,
    queue::{PgMessageQueue, QueueClient, RedrivePolicy},
    server::setup_server,
    state::AppState,
    storage::{BlobStore, ObjectStoreBlobs, StorageError},
    worker::{ChunkWorker, DeadLetterProcessor},
};
use bytes::Bytes;
use diesel_async::pooled_connection::deadpool::BuildError;
use dotenv::dotenv;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build db pool: {0}")]
    Pool(#[from] BuildError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("migration failed: {0}")]
    Migration(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommandError {
    /// `2` for caller mistakes and refused requests, `1` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Config(_) | CommandError::Usage(_) => 2,
            CommandError::Ingest(
                IngestError::Validation(_)
                | IngestError::NotFound(_)
                | IngestError::RetryRejected(_),
            ) => 2,
            _ => 1,
        }
    }
}

fn mode_name(command: &Command) -> &'static str {
    match command {
        Command::Migrate => "migrate",
        Command::Worker(_) => "worker",
        Command::DeadLetterWorker => "dead_letter_worker",
        Command::Submit(_) => "submit",
        Command::Status(_) => "status",
        Command::Retry(_) => "retry",
        Command::UploadUrl(_) => "upload_url",
    }
}

/// Runs one subcommand to completion and returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    dotenv().ok();

    let logging_context = init_logging("catalog_ingest", mode_name(&cli.command), &cli.log_level);
    let span = logging_context.span();

    let result = load_and_execute(cli.command).instrument(span).await;

    match result {
        Ok(()) => 0,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "command_failed",
                mode = %logging_context.mode,
                error = %err,
                error_report = %error_report,
                "command failed"
            );
            eprintln!("{err}");
            err.exit_code()
        }
    }
}

async fn load_and_execute(command: Command) -> Result<(), CommandError> {
    let config = Config::from_env()?;
    match command {
        Command::Migrate => migrate(&config).await,
        Command::Worker(args) => run_workers(config, &args).await,
        Command::DeadLetterWorker => run_workers(config, &dead_letter_only()).await,
        Command::Submit(args) => submit(&config, args).await,
        Command::Status(args) => status(&config, &args).await,
        Command::Retry(args) => retry(&config, &args).await,
        Command::UploadUrl(args) => upload_url(&config, &args).await,
    }
}

fn dead_letter_only() -> WorkerArgs {
    WorkerArgs {
        no_dead_letter: false,
        pollers: Some(0),
    }
}

/// Postgres-backed collaborators wired into one service.
struct Runtime {
    pool: DbPool,
    queue: QueueClient,
    blobs: Arc<ObjectStoreBlobs>,
    service: Arc<IngestionService>,
}

impl Runtime {
    fn build(config: &Config) -> Result<Self, CommandError> {
        let pool = build_db_pool(&config.db_url, config.db_pool_size)?;
        let blobs = Arc::new(match config.storage_backend()? {
            StorageBackend::S3 { bucket } => ObjectStoreBlobs::s3_from_env(bucket)?,
            StorageBackend::Local { root } => ObjectStoreBlobs::local(root)?,
        });
        let queue = QueueClient::new(Arc::new(
            PgMessageQueue::new(pool.clone()).with_redrive(
                config.worker.chunk_queue.clone(),
                RedrivePolicy {
                    dead_letter_queue: config.worker.dead_letter_queue.clone(),
                    max_receive_count: config.worker.max_receive_count,
                },
            ),
        ));
        let service = Arc::new(IngestionService::new(
            Arc::new(PgJobStore::new(pool.clone())),
            queue.clone(),
            blobs.clone(),
            Arc::new(PgProductPersister::new(
                pool.clone(),
                config.ingest.insert_statement_rows,
            )),
            Arc::new(PgNotifier::new(pool.clone())),
            config.ingest.clone(),
        ));
        Ok(Self {
            pool,
            queue,
            blobs,
            service,
        })
    }
}

async fn migrate(config: &Config) -> Result<(), CommandError> {
    let db_url = config.db_url.clone();
    let applied = tokio::task::spawn_blocking(move || run_migrations(&db_url))
        .await?
        .map_err(CommandError::Migration)?;
    info!(event = "migrations_applied", applied, "database schema is current");
    Ok(())
}

/// Runs the pollers and the metrics server until SIGINT/SIGTERM.
async fn run_workers(config: Config, args: &WorkerArgs) -> Result<(), CommandError> {
    let runtime = Runtime::build(&config)?;
    let pollers = args.pollers.unwrap_or(config.worker.pollers);
    let with_dead_letter = !args.no_dead_letter;
    if pollers == 0 && !with_dead_letter {
        return Err(CommandError::Usage(
            "nothing to run: no chunk pollers and the dead-letter processor is disabled"
                .to_string(),
        ));
    }

    let state = Arc::new(AppState::new(runtime.pool.clone(), CancellationToken::new()));
    let shutdown_token = state.shutdown_token.clone();
    let signal_handle = tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));
    let server_handle = setup_server(state, config.metrics_bind).await?;

    let mut tasks = JoinSet::new();
    if pollers > 0 {
        let worker = Arc::new(ChunkWorker::new(
            runtime.service.clone(),
            runtime.queue.clone(),
            config.worker.clone(),
        ));
        for _ in 0..pollers {
            tasks.spawn(Arc::clone(&worker).run(shutdown_token.clone()));
        }
    }
    if with_dead_letter {
        let processor = Arc::new(DeadLetterProcessor::new(
            runtime.service.clone(),
            runtime.queue.clone(),
            config.worker.clone(),
        ));
        tasks.spawn(processor.run(shutdown_token.clone()));
    }

    info!(
        event = "workers_started",
        chunk_pollers = pollers,
        dead_letter = with_dead_letter,
        chunk_queue = %config.worker.chunk_queue,
        dead_letter_queue = %config.worker.dead_letter_queue,
        metrics_bind = %config.metrics_bind,
    );

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(event = "poller_task_failed", error = %err);
            // Without the poller this process no longer does its job.
            shutdown_token.cancel();
        }
    }

    shutdown_token.cancel();
    signal_handle.abort();
    server_handle.await?;
    info!(event = "workers_stopped");
    Ok(())
}

async fn handle_shutdown_signals(token: CancellationToken) {
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!(event = "shutdown_signal", signal = "SIGTERM"),
                _ = sigint.recv() => info!(event = "shutdown_signal", signal = "SIGINT"),
            }
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(
                event = "signal_registration_failed",
                error = %err,
                "falling back to ctrl-c"
            );
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(event = "ctrl_c_failed", error = %err);
                return;
            }
        }
    }
    token.cancel();
}

async fn submit(config: &Config, args: SubmitArgs) -> Result<(), CommandError> {
    let file_name = match args.file_name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CommandError::Usage(format!("{} has no file name", args.file.display()))
            })?,
    };
    let bytes = tokio::fs::read(&args.file).await?;
    let data_rows = split_lines(&String::from_utf8_lossy(&bytes))
        .len()
        .saturating_sub(1);

    let runtime = Runtime::build(config)?;
    let job_id = Uuid::new_v4();
    let object_key = format!("uploads/{}/{job_id}/{file_name}", args.seller);
    runtime
        .blobs
        .put_object(&object_key, Bytes::from(bytes))
        .await?;

    let started = runtime
        .service
        .start_upload(StartUpload {
            seller_id: args.seller,
            job_id,
            object_key: object_key.clone(),
            file_name,
            total_rows: i64::try_from(data_rows).unwrap_or(i64::MAX),
        })
        .await;

    match started {
        Ok(job_id) => {
            println!("{}", serde_json::json!({ "jobId": job_id }));
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup_err) = runtime.blobs.delete_object(&object_key).await {
                warn!(
                    event = "upload_cleanup_failed",
                    object_key = %object_key,
                    error = %cleanup_err,
                );
            }
            Err(err.into())
        }
    }
}

async fn status(config: &Config, args: &JobArgs) -> Result<(), CommandError> {
    let runtime = Runtime::build(config)?;
    let job = runtime.service.job_status(&args.seller, args.job).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn retry(config: &Config, args: &JobArgs) -> Result<(), CommandError> {
    let runtime = Runtime::build(config)?;
    let job = runtime.service.retry_job(&args.seller, args.job).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn upload_url(config: &Config, args: &UploadUrlArgs) -> Result<(), CommandError> {
    let runtime = Runtime::build(config)?;
    let ticket = runtime
        .service
        .prepare_upload(&args.seller, &args.file_name)
        .await?;
    println!(
        "{}",
        serde_json::json!({
            "jobId": ticket.job_id,
            "objectKey": ticket.object_key,
            "uploadUrl": ticket.upload_url,
            "expiresIn": ticket.expires_in.as_secs(),
        })
    );
    Ok(())
}
