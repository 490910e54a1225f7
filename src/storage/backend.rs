use super::StorageError;

/// A stored job as seen by recovery: only the reference, never the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredJob {
    pub topic: String,
    pub id: u64,
}

/// Transactional job store keyed by topic key and per-topic sequence id.
pub trait StorageBackend: Send + Sync {
    /// Assigns the next sequence id for `topic` and persists `payload` under it
    /// in one transaction.
    fn append(&self, topic: &str, payload: &[u8]) -> Result<u64, StorageError>;
    fn fetch(&self, topic: &str, id: u64) -> Result<Vec<u8>, StorageError>;
    fn remove(&self, topic: &str, id: u64) -> Result<bool, StorageError>;
    /// Every stored job, topics in key order, ids ascending within a topic.
    fn recover(&self) -> Result<Vec<StoredJob>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}
