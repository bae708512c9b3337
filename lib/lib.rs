pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod ingest;
pub mod jobs;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod retry;
pub mod server;
pub mod state;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod test_support;
