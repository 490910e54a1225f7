mod backend;
mod error;
mod facade;
mod path;
mod sled_backend;

pub use backend::{StorageBackend, StoredJob};
pub use error::StorageError;
pub use facade::{StorageFacade, topic_key};
use path::expand_home_path;
pub use sled_backend::SledStorage;
