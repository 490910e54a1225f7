use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::config::StorageConfig;
use crate::logging::{LogLevel, Logger};

use super::{SledStorage, StorageBackend, StorageError, StoredJob, expand_home_path};

/// Builds the sub-collection key for a tenant's topic.
pub fn topic_key(tenant: &str, topic: &str) -> String {
    format!("{tenant}_{topic}")
}

/// The Durable Store: owns job payload bytes for the lifetime of the process.
pub struct StorageFacade {
    data_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(config: &StorageConfig, logger: &Logger) -> Result<Self, StorageError> {
        let data_path = expand_home_path(&config.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing job storage",
            Some(json!({
                "configured_path": config.path,
                "resolved_path": data_path.display().to_string(),
                "cache_capacity": config.cache_capacity,
                "flush_every_ms": config.flush_every_ms,
                "remove_on_ack": config.remove_on_ack
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend = SledStorage::open(
            &data_path,
            Some(config.cache_capacity).filter(|capacity| *capacity > 0),
            Some(config.flush_every_ms).filter(|interval| *interval > 0),
        )?;

        Ok(Self::with_backend(data_path, Box::new(backend)))
    }

    pub fn with_backend(data_path: PathBuf, backend: Box<dyn StorageBackend>) -> Self {
        Self { data_path, backend }
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    /// Durably appends one job and returns its sequence id. The store is
    /// flushed before returning, so a successful append survives a crash.
    pub fn append(&self, tenant: &str, topic: &str, payload: &[u8]) -> Result<u64, StorageError> {
        let id = self.backend.append(&topic_key(tenant, topic), payload)?;
        self.backend.flush()?;
        Ok(id)
    }

    pub fn fetch(&self, topic_key: &str, id: u64) -> Result<Vec<u8>, StorageError> {
        self.backend.fetch(topic_key, id)
    }

    pub fn remove(&self, topic_key: &str, id: u64) -> Result<bool, StorageError> {
        self.backend.remove(topic_key, id)
    }

    pub fn recover(&self) -> Result<Vec<StoredJob>, StorageError> {
        self.backend.recover()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}
