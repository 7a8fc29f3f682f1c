//! shardrunner -- sharded browser-test execution worker.
//!
//! A worker claims one shard of a test run at a time, runs its files through
//! an external test runner, streams results to the Results Collector, and
//! heals broken element selectors on request.

pub mod collector;
pub mod config;
pub mod healing;
pub mod job;
pub mod reporter;
pub mod runner;
pub mod shard;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::collector::{Dispatcher, HttpCollector};
use crate::config::WorkerConfig;
use crate::reporter::{StreamOptions, TcpConnector};
use crate::runner::ProcessRunner;
use crate::worker::ExecutionWorker;

/// Build a worker wired to the configured collector, stream, and runner.
///
/// The returned dispatcher must be drained before exit so queued status
/// updates are delivered.
pub fn build_worker(config: &WorkerConfig) -> Result<(ExecutionWorker, Dispatcher)> {
    let collector = Arc::new(
        HttpCollector::new(&config.collector).context("failed to build collector client")?,
    );
    let dispatcher = Dispatcher::spawn(collector.clone());

    let mut worker = ExecutionWorker::new(config, Arc::new(ProcessRunner::default()), dispatcher.handle());
    match &config.collector.stream_addr {
        Some(addr) => {
            let connector = TcpConnector::new(addr.clone())
                .with_options(StreamOptions::from(&config.collector));
            worker = worker.with_stream(Arc::new(connector));
        }
        None => tracing::info!("no stream address configured, results will not be streamed"),
    }
    if config.reporter.upload_artifacts {
        worker = worker.with_artifacts(collector);
    }

    tracing::info!(
        worker_id = %worker.worker_id(),
        collector = %config.collector.base_url,
        batch_size = config.worker.batch_size,
        "worker ready"
    );
    Ok((worker, dispatcher))
}
