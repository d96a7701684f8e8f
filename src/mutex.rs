//! Cluster-wide mutual exclusion backed by atomic compare-and-set.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::MutexConfig;
use crate::error::{ClusterError, Result};
use crate::kv::KvStore;

/// Namespaces mutex entries apart from other keys in the shared store.
pub const MUTEX_PREFIX: &str = "mutex_";

/// A mutex usable by any number of processes sharing one key-value store.
///
/// The durable form is a single entry at `mutex_<name>` whose value is the
/// lock's expiry as a decimal nanosecond Unix timestamp. The store's own
/// expiry support, if any, is deliberately not used: encoding the expiry in
/// the value and CAS-deleting stale entries gives correct takeover semantics
/// with nothing but the atomic set.
///
/// A holder refreshes the entry at half the ttl; a crashed holder therefore
/// releases the lock after at most `ttl` of wall-clock time. Mutexes with
/// different names are unrelated.
pub struct DistributedMutex {
    kv: Arc<dyn KvStore>,
    key: String,
    config: MutexConfig,

    // Holder-side state for the refresh task. Present exactly while locked.
    held: tokio::sync::Mutex<Option<HeldLock>>,
}

struct HeldLock {
    stop_refresh: CancellationToken,
    refresh_task: JoinHandle<()>,

    // Expiry last written to the store, shared with the refresh task. Only
    // the current holder's tasks touch it.
    last_expiry: Arc<AtomicI64>,
}

/// Result of a single acquisition attempt. Each failed outcome retries on a
/// different cadence.
enum LockOutcome {
    /// The key was claimed; carries the written expiry.
    Acquired(i64),
    /// The entry vanished between the set and the follow-up read.
    Absent,
    /// Validly held by another process.
    Contended,
    /// An expired entry was found and garbage-collected.
    Stale,
}

impl DistributedMutex {
    pub fn new(kv: Arc<dyn KvStore>, name: &str) -> Result<Self> {
        Self::with_config(kv, name, MutexConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KvStore>, name: &str, config: MutexConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(ClusterError::InvalidArgument(
                "mutex name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            kv,
            key: format!("{}{}", MUTEX_PREFIX, name),
            config,
            held: tokio::sync::Mutex::new(None),
        })
    }

    /// Locks the mutex, blocking until it is acquired.
    ///
    /// Store failures are logged and retried indefinitely. Locking a mutex
    /// already held by this instance blocks until that hold is released,
    /// exactly as it does for a hold by another process.
    pub async fn lock(&self) {
        // The Cancelled arm below is unreachable without a deadline.
        let _ = self.acquire(None).await;
    }

    /// Locks the mutex or gives up when `deadline` passes, returning
    /// [`ClusterError::Cancelled`].
    ///
    /// The deadline is checked between acquisition attempts, never in the
    /// middle of a store call.
    pub async fn lock_with_deadline(&self, deadline: Instant) -> Result<()> {
        self.acquire(Some(deadline)).await
    }

    /// Unlocks the mutex.
    ///
    /// Panics if the mutex is not locked, like `sync::Mutex` misuse. The
    /// durable entry is removed best-effort: if deletion fails the entry
    /// expires on its own, and if another process has meanwhile claimed the
    /// key its value is left alone.
    pub async fn unlock(&self) {
        let held = { self.held.lock().await.take() };
        let Some(held) = held else {
            panic!("mutex has not been locked");
        };

        held.stop_refresh.cancel();
        let _ = held.refresh_task.await;

        let last_value = encode_lock_value(held.last_expiry.load(Ordering::SeqCst));
        let _ = self
            .kv
            .set_if_matches(&self.key, None, Some(&last_value))
            .await;
    }

    async fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        let mut wait = Duration::ZERO;

        loop {
            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, sleep(wait)).await.is_err() {
                        return Err(ClusterError::Cancelled(self.key.clone()));
                    }
                }
                None => sleep(wait).await,
            }

            match self.try_lock().await {
                Ok(LockOutcome::Acquired(expiry)) => {
                    self.start_refresh(expiry).await;
                    return Ok(());
                }
                Ok(LockOutcome::Absent) => {
                    // The key is free again; retry without waiting.
                    wait = Duration::ZERO;
                }
                Ok(LockOutcome::Contended) => {
                    wait = self.config.lock_poll_interval;
                }
                Ok(LockOutcome::Stale) => {
                    // The expired entry was just collected; a brief wait is
                    // enough before claiming the key.
                    wait = self.config.lock_poll_interval / 4;
                }
                Err(err) => {
                    tracing::warn!(lock_key = %self.key, error = %err, "Failed to lock mutex, will retry");
                    wait = self.next_error_wait(wait);
                }
            }
        }
    }

    /// Makes a single attempt to lock the mutex, classifying the entry found
    /// when the claim fails.
    async fn try_lock(&self) -> Result<LockOutcome> {
        let now = now_nanos();
        let new_expiry = now + duration_nanos(self.config.ttl);
        let new_value = encode_lock_value(new_expiry);

        if self
            .kv
            .set_if_matches(&self.key, Some(&new_value), None)
            .await?
        {
            return Ok(LockOutcome::Acquired(new_expiry));
        }

        // Check whether the current hold has expired.
        let current = self.kv.get(&self.key).await?.unwrap_or_default();
        let actual_expiry = decode_lock_value(&current)?;

        if actual_expiry == 0 {
            return Ok(LockOutcome::Absent);
        }

        if actual_expiry > now {
            return Ok(LockOutcome::Contended);
        }

        // Garbage-collect the expired entry so a following attempt can claim
        // the key. The outcome does not matter; someone else may collect it
        // first.
        let _ = self.kv.set_if_matches(&self.key, None, Some(&current)).await;

        Ok(LockOutcome::Stale)
    }

    async fn start_refresh(&self, expiry: i64) {
        let stop = CancellationToken::new();
        let last_expiry = Arc::new(AtomicI64::new(expiry));

        let kv = Arc::clone(&self.kv);
        let key = self.key.clone();
        let config = self.config.clone();
        let task_stop = stop.clone();
        let task_expiry = Arc::clone(&last_expiry);

        let refresh_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    _ = sleep(config.refresh_interval) => {}
                }

                let new_expiry = now_nanos() + duration_nanos(config.ttl);
                let old_value = encode_lock_value(task_expiry.load(Ordering::SeqCst));
                let new_value = encode_lock_value(new_expiry);

                match kv.set_if_matches(&key, Some(&new_value), Some(&old_value)).await {
                    Ok(true) => {
                        task_expiry.store(new_expiry, Ordering::SeqCst);
                    }
                    Ok(false) => {
                        // The entry expired and was claimed or collected; the
                        // lock is lost. unlock() tolerates the foreign value.
                        tracing::error!(lock_key = %key, "Mutex entry no longer holds the expected value, stopping refresh");
                        return;
                    }
                    Err(err) => {
                        tracing::error!(lock_key = %key, error = %err, "Failed to refresh mutex");
                        return;
                    }
                }
            }
        });

        let mut held = self.held.lock().await;
        *held = Some(HeldLock {
            stop_refresh: stop,
            refresh_task,
            last_expiry,
        });
    }

    /// Wait after a failed store call: ramps up linearly, capped at the poll
    /// interval. Deterministic so retry timing is testable.
    fn next_error_wait(&self, last: Duration) -> Duration {
        let cap = self.config.lock_poll_interval;
        (last + cap / 4).min(cap)
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn duration_nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

fn encode_lock_value(expires_at: i64) -> Vec<u8> {
    expires_at.to_string().into_bytes()
}

/// Decodes a lock entry into the expiry it represents. Empty values decode
/// to the zero instant.
fn decode_lock_value(value: &[u8]) -> Result<i64> {
    if value.is_empty() {
        return Ok(0);
    }

    let text = std::str::from_utf8(value)
        .map_err(|err| ClusterError::Decode(format!("lock value is not utf-8: {}", err)))?;
    text.parse::<i64>()
        .map_err(|err| ClusterError::Decode(format!("lock value is not a timestamp: {}", err)))
}
