use std::path::PathBuf;

use crate::build_info;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    about = "Batch CSV catalog ingestion",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[arg(long = "log-level", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply pending database migrations and exit
    Migrate,
    /// Poll the chunk queue (and by default the dead-letter queue) until SIGINT/SIGTERM
    Worker(WorkerArgs),
    /// Poll only the dead-letter queue
    DeadLetterWorker,
    /// Store a local CSV file and start a batch job for it
    Submit(SubmitArgs),
    /// Print a batch job as JSON
    Status(JobArgs),
    /// Retry a failed batch job
    Retry(JobArgs),
    /// Allocate a job id and a presigned upload URL
    UploadUrl(UploadUrlArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    #[arg(long)]
    /// Do not run the dead-letter processor in this process
    pub no_dead_letter: bool,

    #[arg(long)]
    /// Override CHUNK_POLLERS
    pub pollers: Option<usize>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SubmitArgs {
    #[arg(long)]
    pub seller: String,

    #[arg(long)]
    pub file: PathBuf,

    #[arg(long = "file-name")]
    /// Name recorded on the job; defaults to the file's own name
    pub file_name: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct JobArgs {
    #[arg(long)]
    pub seller: String,

    #[arg(long)]
    pub job: Uuid,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct UploadUrlArgs {
    #[arg(long)]
    pub seller: String,

    #[arg(long = "file-name")]
    pub file_name: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
