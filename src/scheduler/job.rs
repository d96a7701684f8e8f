use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{ClusterError, Result};
use crate::kv::KvStore;
use crate::mutex::DistributedMutex;
use crate::scheduler::registry::CallbackRegistry;

/// Namespaces one-shot job records apart from other keys in the shared store.
pub const ONCE_PREFIX: &str = "once_";

/// Durable form of a scheduled job, stored at `once_<key>` as JSON.
///
/// The field names are part of the storage contract; records written by
/// prior versions must keep decoding. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOnceMetadata {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "RunAt")]
    pub run_at: DateTime<Utc>,
}

pub(crate) type ActiveJobs = Arc<Mutex<HashMap<String, Arc<JobOnce>>>>;

/// A scheduled one-shot job and its local runner state.
///
/// Handles are returned by
/// [`JobOnceScheduler::schedule_once`](crate::JobOnceScheduler::schedule_once);
/// the runner task itself is spawned by the scheduler.
pub struct JobOnce {
    key: String,
    run_at: DateTime<Utc>,

    kv: Arc<dyn KvStore>,
    mutex: DistributedMutex,
    callbacks: Arc<Mutex<CallbackRegistry>>,
    active_jobs: ActiveJobs,
    config: SchedulerConfig,

    // Once-only signals: stop asks the runner to exit, done fires when it has.
    stop: CancellationToken,
    done: CancellationToken,
}

impl JobOnce {
    pub(crate) fn new(
        kv: Arc<dyn KvStore>,
        key: &str,
        run_at: DateTime<Utc>,
        callbacks: Arc<Mutex<CallbackRegistry>>,
        active_jobs: ActiveJobs,
        config: SchedulerConfig,
    ) -> Result<Arc<Self>> {
        let mutex = DistributedMutex::with_config(Arc::clone(&kv), key, config.mutex.clone())?;

        Ok(Arc::new(Self {
            key: key.to_string(),
            run_at,
            kv,
            mutex,
            callbacks,
            active_jobs,
            config,
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    /// Terminates the job: removes the durable record so no node runs it,
    /// stops the local runner, and waits for the runner to exit.
    ///
    /// Closing an already closed or completed job is a no-op.
    pub async fn close(&self) {
        self.mutex.lock().await;
        self.close_holding_mutex().await;
        self.mutex.unlock().await;

        self.done.cancelled().await;
    }

    /// Runner task. One exists per key in the local active-jobs table.
    pub(crate) async fn run(self: Arc<Self>) {
        self.run_loop().await;
        self.done.cancel();
    }

    async fn run_loop(&self) {
        let mut wait = time_until(self.run_at);
        let mut num_fails: u32 = 0;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = sleep(wait + add_jitter(self.config.jitter)) => {}
            }

            self.mutex.lock().await;

            match read_metadata(self.kv.as_ref(), &self.key).await {
                Err(err) => {
                    num_fails += 1;
                    if num_fails > self.config.max_fails {
                        tracing::error!(job_key = %self.key, error = %err, "Giving up on job after repeated failed record reads");
                        self.close_holding_mutex().await;
                        self.mutex.unlock().await;
                        return;
                    }

                    tracing::warn!(job_key = %self.key, error = %err, num_fails, "Failed to read job record, will retry");
                    wait = self.config.fail_wait;
                    self.mutex.unlock().await;
                }
                Ok(None) => {
                    // Another node already ran the job; nothing durable is
                    // left to clean up.
                    self.cancel_local().await;
                    self.mutex.unlock().await;
                    return;
                }
                Ok(Some(_)) => {
                    self.invoke_callbacks().await;
                    // Delete before releasing the mutex, so no other runner
                    // can observe the record after the callbacks ran.
                    self.close_holding_mutex().await;
                    self.mutex.unlock().await;
                    return;
                }
            }
        }
    }

    /// Invokes every registered callback serially, in registration order.
    /// Errors and panics are logged and isolated; they never prevent the
    /// record from being deleted afterwards.
    async fn invoke_callbacks(&self) {
        let callbacks = { self.callbacks.lock().await.snapshot() };
        let watchdog = self.config.mutex.ttl / 2;

        for (id, callback) in callbacks {
            let callback_future = AssertUnwindSafe(callback(self.key.clone())).catch_unwind();
            tokio::pin!(callback_future);

            let result = tokio::select! {
                result = &mut callback_future => result,
                _ = sleep(watchdog) => {
                    // The mutex is refreshed at ttl/2; a callback that runs
                    // longer than that risks outliving the hold entirely.
                    tracing::warn!(job_key = %self.key, callback_id = %id, "Job callback still running after half the lock ttl");
                    (&mut callback_future).await
                }
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(job_key = %self.key, callback_id = %id, error = %err, "Job callback returned an error");
                }
                Err(_) => {
                    tracing::error!(job_key = %self.key, callback_id = %id, "Job callback panicked");
                }
            }
        }
    }

    /// Writes the job record via CAS-from-absent, guarded by the job's mutex.
    pub(crate) async fn save_metadata(&self) -> Result<()> {
        let metadata = JobOnceMetadata {
            key: self.key.clone(),
            run_at: self.run_at,
        };
        let data = serde_json::to_vec(&metadata)?;

        self.mutex.lock().await;
        let applied = self
            .kv
            .set_if_matches(&self.storage_key(), Some(&data), None)
            .await;
        self.mutex.unlock().await;

        match applied {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClusterError::AlreadyExists(self.key.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the durable record and cancels the local runner. The caller
    /// must hold the job's mutex.
    pub(crate) async fn close_holding_mutex(&self) {
        if let Err(err) = self.kv.delete(&self.storage_key()).await {
            tracing::warn!(job_key = %self.key, error = %err, "Failed to delete job record");
        }
        self.cancel_local().await;
    }

    async fn cancel_local(&self) {
        self.active_jobs.lock().await.remove(&self.key);
        self.stop.cancel();
    }

    fn storage_key(&self) -> String {
        format!("{}{}", ONCE_PREFIX, self.key)
    }
}

/// Reads a job's stored record. No cluster lock is taken; callers wanting an
/// atomic read/check must hold the job's mutex themselves.
pub(crate) async fn read_metadata(kv: &dyn KvStore, key: &str) -> Result<Option<JobOnceMetadata>> {
    let data = kv.get(&format!("{}{}", ONCE_PREFIX, key)).await?;
    let Some(data) = data else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

fn time_until(run_at: DateTime<Utc>) -> Duration {
    (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Random addition to sleeps that would otherwise synchronize across nodes
/// and pile up on the same mutex.
pub(crate) fn add_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_nanos(rng.gen_range(0..max.as_nanos() as u64))
}
