//! The key-value seam between this crate and the host.
//!
//! Everything the coordination primitives do goes through [`KvStore`]; the
//! atomic [`set_if_matches`](KvStore::set_if_matches) is the only
//! synchronization primitive they rely on. In particular, no TTL support is
//! assumed from the store.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKvStore;

#[derive(Error, Debug, Clone)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("kv store unavailable: {0}")]
    Unavailable(String),

    #[error("kv store internal error: {0}")]
    Internal(String),
}

/// A shared, byte-keyed store with atomic compare-and-set.
///
/// Adapters wrap whatever the host exposes (a plugin API, a database table).
/// Reads of absent keys return `Ok(None)`; absence is not an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Atomically writes `new_value` (or deletes the key, when `None`) if the
    /// current value matches `expected_old`, where `None` means the key must
    /// be absent. Returns whether the write was applied.
    async fn set_if_matches(
        &self,
        key: &str,
        new_value: Option<&[u8]>,
        expected_old: Option<&[u8]>,
    ) -> Result<bool, KvError>;

    /// Deletes a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Lists keys by zero-based page index. A page shorter than `per_page`
    /// is the last page.
    async fn list_keys(&self, page: usize, per_page: usize) -> Result<Vec<String>, KvError>;
}
