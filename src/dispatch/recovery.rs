use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::storage::{StorageError, StorageFacade, StoredJob};
use crate::utils::timing::measure_execution;

use super::{DispatchRegistry, Msg, RegistryError};

const CONTEXT: &str = "dispatch::recovery";

#[derive(Debug)]
pub enum RecoveryError {
    Storage(StorageError),
    Registry(RegistryError),
    Spawn(io::Error),
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(source) => write!(f, "recovery scan failed: {source}"),
            Self::Registry(source) => write!(f, "recovery publish failed: {source}"),
            Self::Spawn(source) => write!(f, "failed to spawn recovery thread: {source}"),
        }
    }
}

impl std::error::Error for RecoveryError {}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub jobs_per_topic: BTreeMap<String, usize>,
}

impl RecoveryReport {
    pub fn total_jobs(&self) -> usize {
        self.jobs_per_topic.values().sum()
    }
}

/// Re-enqueues every stored job into its topic's pending buffer.
///
/// Publishing blocks on full buffers, so for topics holding more jobs than the
/// buffer capacity this only returns once workers have drained the excess.
#[cfg(test)]
pub fn recover_into(
    storage: &StorageFacade,
    registry: &DispatchRegistry,
    logger: &Logger,
) -> Result<RecoveryReport, RecoveryError> {
    let jobs = storage.recover().map_err(RecoveryError::Storage)?;
    publish_recovered(jobs, registry, logger)
}

fn publish_recovered(
    jobs: Vec<StoredJob>,
    registry: &DispatchRegistry,
    logger: &Logger,
) -> Result<RecoveryReport, RecoveryError> {
    let mut report = RecoveryReport::default();

    for job in jobs {
        registry.ensure_topic(&job.topic);
        registry
            .publish(Msg::new(job.topic.as_str(), job.id))
            .map_err(RecoveryError::Registry)?;
        *report.jobs_per_topic.entry(job.topic).or_default() += 1;
    }

    logger.log(
        LogLevel::Info,
        Some(CONTEXT),
        "Stored jobs re-enqueued for dispatch",
        Some(json!({
            "topics": report.jobs_per_topic.len(),
            "jobs": report.total_jobs(),
            "per_topic": report.jobs_per_topic
        })),
    );
    Ok(report)
}

/// Scans the store on the calling thread, then publishes the scanned jobs
/// from a background thread so startup never waits on buffer backpressure.
///
/// Must be called before ingestion starts: jobs appended after the scan are
/// published by their ingest request and are not part of the snapshot.
pub fn spawn_recovery(
    storage: &StorageFacade,
    registry: Arc<DispatchRegistry>,
    logger: Logger,
) -> Result<JoinHandle<()>, RecoveryError> {
    let jobs = measure_execution("recovery scan", Some(CONTEXT), &logger, || storage.recover())
        .map_err(RecoveryError::Storage)?;
    for job in &jobs {
        registry.ensure_topic(&job.topic);
    }

    thread::Builder::new()
        .name("queue-recovery".to_owned())
        .spawn(move || {
            let result = measure_execution("recovery publish", Some(CONTEXT), &logger, || {
                publish_recovered(jobs, &registry, &logger)
            });
            match result {
                Ok(_) => {}
                Err(RecoveryError::Registry(RegistryError::Closed)) => logger.warn(
                    Some(CONTEXT),
                    "Registry closed before recovery finished; remaining jobs stay stored",
                ),
                Err(error) => logger.error(Some(CONTEXT), &error.to_string()),
            }
        })
        .map_err(RecoveryError::Spawn)
}
