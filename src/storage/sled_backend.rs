use std::path::Path;

use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};

use super::{StorageBackend, StorageError, StoredJob};

/// Top-level collection: one entry per topic key, holding its last issued id.
const QUEUE_TREE: &str = "queue";
/// Per-topic sub-collections are named `queue/<tenant>_<topic>`.
const TOPIC_TREE_PREFIX: &str = "queue/";
const SEQUENCE_WIDTH: usize = 8;

pub struct SledStorage {
    db: sled::Db,
    topics: sled::Tree,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        flush_every_ms: Option<u64>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new()
            .path(data_path)
            .flush_every_ms(flush_every_ms);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        let db = config.open().map_err(StorageError::Sled)?;
        let topics = db.open_tree(QUEUE_TREE).map_err(StorageError::Sled)?;
        Ok(Self { db, topics })
    }

    fn jobs_tree(&self, topic: &str) -> Result<sled::Tree, StorageError> {
        if topic.is_empty() {
            return Err(StorageError::InvalidTopicKey {
                topic: topic.to_owned(),
            });
        }

        self.db
            .open_tree(format!("{TOPIC_TREE_PREFIX}{topic}"))
            .map_err(StorageError::Sled)
    }
}

fn encode_sequence(id: u64) -> [u8; SEQUENCE_WIDTH] {
    id.to_be_bytes()
}

fn decode_sequence(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; SEQUENCE_WIDTH] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

impl StorageBackend for SledStorage {
    fn append(&self, topic: &str, payload: &[u8]) -> Result<u64, StorageError> {
        let jobs = self.jobs_tree(topic)?;

        let result = (&self.topics, &jobs).transaction(
            |(topics, jobs)| -> ConflictableTransactionResult<u64, usize> {
                let next = match topics.get(topic.as_bytes())? {
                    Some(raw) => {
                        decode_sequence(&raw).ok_or(ConflictableTransactionError::Abort(raw.len()))?
                            + 1
                    }
                    None => 1,
                };

                let key = encode_sequence(next);
                topics.insert(topic.as_bytes(), &key[..])?;
                jobs.insert(&key[..], payload)?;
                Ok(next)
            },
        );

        result.map_err(|error| match error {
            TransactionError::Abort(len) => StorageError::CorruptSequence {
                topic: topic.to_owned(),
                len,
            },
            TransactionError::Storage(source) => StorageError::Sled(source),
        })
    }

    fn fetch(&self, topic: &str, id: u64) -> Result<Vec<u8>, StorageError> {
        let jobs = self.jobs_tree(topic)?;
        jobs.get(encode_sequence(id))
            .map_err(StorageError::Sled)?
            .map(|value| value.to_vec())
            .ok_or_else(|| StorageError::NotFound {
                topic: topic.to_owned(),
                id,
            })
    }

    fn remove(&self, topic: &str, id: u64) -> Result<bool, StorageError> {
        let jobs = self.jobs_tree(topic)?;
        jobs.remove(encode_sequence(id))
            .map(|previous| previous.is_some())
            .map_err(StorageError::Sled)
    }

    fn recover(&self) -> Result<Vec<StoredJob>, StorageError> {
        let mut recovered = Vec::new();

        for entry in self.topics.iter() {
            let (raw_topic, _) = entry.map_err(StorageError::Sled)?;
            let topic = String::from_utf8_lossy(&raw_topic).into_owned();
            let jobs = self.jobs_tree(&topic)?;

            for key in jobs.iter().keys() {
                let key = key.map_err(StorageError::Sled)?;
                let id = decode_sequence(&key).ok_or_else(|| StorageError::CorruptSequence {
                    topic: topic.clone(),
                    len: key.len(),
                })?;
                recovered.push(StoredJob {
                    topic: topic.clone(),
                    id,
                });
            }
        }

        Ok(recovered)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }
}
