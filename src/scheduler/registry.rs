use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use uuid::Uuid;

/// Boxed future produced by a job callback.
pub type CallbackFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Callback invoked with the job's key when a scheduled job fires.
///
/// Callbacks run while the job's cluster mutex is held, so they should
/// dispatch quickly; see [`JobOnceScheduler`](crate::JobOnceScheduler).
pub type JobOnceCallback = Arc<dyn Fn(String) -> CallbackFuture + Send + Sync>;

/// Registered callbacks, kept in registration order.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    entries: Vec<(Uuid, JobOnceCallback)>,
}

impl CallbackRegistry {
    pub fn add(&mut self, callback: JobOnceCallback) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push((id, callback));
        id
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    /// Clones the current entries so callers can invoke them without holding
    /// the registry lock.
    pub fn snapshot(&self) -> Vec<(Uuid, JobOnceCallback)> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
