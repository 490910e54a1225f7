use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    InvalidTopicKey {
        topic: String,
    },
    CorruptSequence {
        topic: String,
        len: usize,
    },
    NotFound {
        topic: String,
        id: u64,
    },
    Sled(sled::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::InvalidTopicKey { topic } => {
                write!(f, "invalid topic key '{topic}' for job storage")
            }
            Self::CorruptSequence { topic, len } => write!(
                f,
                "sequence counter for topic '{topic}' is corrupt: expected 8 bytes, found {len}"
            ),
            Self::NotFound { topic, id } => {
                write!(f, "job {id} not found in topic '{topic}'")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}
