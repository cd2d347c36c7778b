//! Secure blob storage for the persisted runtime configuration.
//!
//! The store is opaque to its callers: encryption happens inside `save` and
//! `load`, and a blob that cannot be read back is simply absent.

mod encrypted;

pub use encrypted::SqliteBlobStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::StoreError;

/// Fixed location/value-name pair a blob lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    pub location: String,
    pub value_name: String,
}

impl BlobKey {
    pub fn new(location: impl Into<String>, value_name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            value_name: value_name.into(),
        }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.location, self.value_name)
    }
}

pub trait BlobStore: Send + Sync {
    /// `None` when the blob is missing, empty or cannot be decrypted.
    fn load(&self, key: &BlobKey) -> Option<Vec<u8>>;

    fn save(&self, key: &BlobKey, bytes: &[u8]) -> Result<(), StoreError>;
}

/// In-process store for tests and benches. Can be told to refuse writes.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobKey, Vec<u8>>>,
    fail_saves: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Store raw bytes directly, bypassing any validation.
    pub fn put(&self, key: &BlobKey, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), bytes);
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: &BlobKey) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .filter(|b| !b.is_empty())
            .cloned()
    }

    fn save(&self, key: &BlobKey, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        self.put(key, bytes.to_vec());
        Ok(())
    }
}
