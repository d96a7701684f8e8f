use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{KvError, KvStore};

/// In-process [`KvStore`] with injectable failure modes.
///
/// This is the store the coordination test suites run against. Failures can
/// be injected globally ([`set_failing`](Self::set_failing)) or for reads of
/// a key prefix ([`set_failing_with_prefix`](Self::set_failing_with_prefix)).
/// Keys are kept sorted so `list_keys` pagination is stable.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    failing: bool,
    failing_read_prefix: Option<String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.guard().failing = failing;
    }

    /// Makes reads of keys with the given prefix fail until cleared.
    pub fn set_failing_with_prefix(&self, prefix: Option<&str>) {
        self.guard().failing_read_prefix = prefix.map(str::to_string);
    }

    /// Drops all entries, keeping any configured failure modes.
    pub fn clear(&self) {
        self.guard().entries.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.guard().entries.contains_key(key)
    }

    /// Reads an entry without the failure injection applied.
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.guard().entries.get(key).cloned()
    }

    /// Writes an entry without the failure injection applied.
    pub fn set_raw(&self, key: &str, value: &[u8]) {
        self.guard().entries.insert(key.to_string(), value.to_vec());
    }

    pub fn len(&self) -> usize {
        self.guard().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().entries.is_empty()
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let inner = self.guard();
        if inner.failing {
            return Err(KvError::Unavailable("injected failure".to_string()));
        }
        if let Some(prefix) = &inner.failing_read_prefix {
            if key.starts_with(prefix.as_str()) {
                return Err(KvError::Unavailable(format!(
                    "injected read failure for prefix {}",
                    prefix
                )));
            }
        }
        Ok(inner.entries.get(key).cloned())
    }

    async fn set_if_matches(
        &self,
        key: &str,
        new_value: Option<&[u8]>,
        expected_old: Option<&[u8]>,
    ) -> Result<bool, KvError> {
        let mut inner = self.guard();
        if inner.failing {
            return Err(KvError::Unavailable("injected failure".to_string()));
        }

        let matches = match expected_old {
            None => !inner.entries.contains_key(key),
            Some(expected) => inner.entries.get(key).map(Vec::as_slice) == Some(expected),
        };
        if !matches {
            return Ok(false);
        }

        match new_value {
            Some(value) => {
                inner.entries.insert(key.to_string(), value.to_vec());
            }
            None => {
                inner.entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.guard();
        if inner.failing {
            return Err(KvError::Unavailable("injected failure".to_string()));
        }
        inner.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, page: usize, per_page: usize) -> Result<Vec<String>, KvError> {
        let inner = self.guard();
        if inner.failing {
            return Err(KvError::Unavailable("injected failure".to_string()));
        }
        Ok(inner
            .entries
            .keys()
            .skip(page.saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect())
    }
}
