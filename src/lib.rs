//! Cluster-wide coordination primitives for processes that share nothing but
//! a key-value store with atomic compare-and-set.
//!
//! Plugin instances running on separate nodes must not trample each other
//! when doing singleton work. This crate provides two building blocks for
//! that, layered bottom-up:
//!
//! - [`DistributedMutex`]: mutual exclusion across an unbounded set of
//!   independent processes, using only CAS on the shared store.
//! - [`JobOnceScheduler`]: durable one-shot jobs that fire at most once per
//!   cluster, surviving process restarts and membership changes.
//!
//! The store itself is abstracted behind the [`KvStore`] trait; an in-memory
//! implementation with injectable failures ([`MemoryKvStore`]) backs the test
//! suites.

pub mod config;
pub mod error;
pub mod kv;
pub mod mutex;
pub mod scheduler;

pub use config::{MutexConfig, SchedulerConfig};
pub use error::{ClusterError, Result};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use mutex::{DistributedMutex, MUTEX_PREFIX};
pub use scheduler::{
    get_scheduler, CallbackFuture, JobOnce, JobOnceCallback, JobOnceMetadata, JobOnceScheduler,
    ONCE_PREFIX,
};
