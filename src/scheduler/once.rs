use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ClusterError, Result};
use crate::kv::KvStore;
use crate::mutex::DistributedMutex;
use crate::scheduler::job::{
    add_jitter, read_metadata, ActiveJobs, JobOnce, JobOnceMetadata, ONCE_PREFIX,
};
use crate::scheduler::registry::{CallbackRegistry, JobOnceCallback};

static SCHEDULER: OnceLock<Arc<JobOnceScheduler>> = OnceLock::new();

/// Returns the process-wide scheduler. Repeated calls return the same
/// instance; the store passed on the first call wins.
///
/// Plugin code scattered through a host can register callbacks and schedule
/// jobs against this without passing an instance around. Tests and embedders
/// coordinating over several stores use [`JobOnceScheduler::new`] instead.
pub fn get_scheduler(kv: Arc<dyn KvStore>) -> Arc<JobOnceScheduler> {
    Arc::clone(SCHEDULER.get_or_init(|| JobOnceScheduler::new(kv)))
}

/// Schedules keyed one-shot jobs that run at most once per cluster.
///
/// A scheduled job is durably recorded in the shared store, so it survives
/// process restarts: [`start`](Self::start) recovers every stored job, and a
/// background poller picks up jobs scheduled by peer nodes. When a job's
/// time arrives, its runner takes the job's cluster mutex, re-checks the
/// record, invokes the registered callbacks, and deletes the record before
/// releasing the mutex. That delete-before-release is what makes execution
/// at-most-once across the cluster.
///
/// Callbacks run while the job's cluster mutex is held. A callback that
/// outlives the mutex ttl forfeits the at-most-once guarantee (the record
/// may fire again on another node), so keep callbacks short or raise the
/// ttl in [`SchedulerConfig`].
pub struct JobOnceScheduler {
    kv: Arc<dyn KvStore>,
    config: SchedulerConfig,

    started: RwLock<bool>,
    callbacks: Arc<Mutex<CallbackRegistry>>,
    active_jobs: ActiveJobs,
}

impl JobOnceScheduler {
    /// Creates an independent scheduler over the given store.
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Self::with_config(kv, SchedulerConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KvStore>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            config,
            started: RwLock::new(false),
            callbacks: Arc::new(Mutex::new(CallbackRegistry::default())),
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Registers a callback and returns its id. Every registered callback is
    /// invoked, in registration order, for each job fired on this node.
    pub async fn add_callback(&self, callback: JobOnceCallback) -> Uuid {
        self.callbacks.lock().await.add(callback)
    }

    /// Removes a callback by id, returning whether it was registered.
    pub async fn remove_callback(&self, id: Uuid) -> bool {
        self.callbacks.lock().await.remove(id)
    }

    /// Recovers all stored jobs and begins polling for jobs scheduled by
    /// peers. Even if the whole cluster went down, previously scheduled jobs
    /// start running again here.
    ///
    /// Fails with [`ClusterError::IllegalState`] if already started or if no
    /// callback is registered yet.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut started = self.started.write().await;
        if *started {
            return Err(ClusterError::IllegalState(
                "scheduler has already been started".to_string(),
            ));
        }
        self.verify_callback_exists().await?;

        self.schedule_from_store().await?;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.poll_for_new_jobs().await });

        *started = true;
        Ok(())
    }

    /// Schedules a job to run once at `run_at`, when all registered
    /// callbacks will be called with `key`.
    ///
    /// Fails with [`ClusterError::AlreadyExists`] if a record for `key` is
    /// already stored. To reschedule, [`close`](Self::close) the original
    /// first; close is authoritative once it returns.
    pub async fn schedule_once(&self, key: &str, run_at: DateTime<Utc>) -> Result<Arc<JobOnce>> {
        {
            let started = self.started.read().await;
            if !*started {
                return Err(ClusterError::IllegalState(
                    "start the scheduler before adding jobs".to_string(),
                ));
            }
        }
        self.verify_callback_exists().await?;

        let job = JobOnce::new(
            Arc::clone(&self.kv),
            key,
            run_at,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.active_jobs),
            self.config.clone(),
        )?;

        job.save_metadata().await?;

        if !self.track_and_spawn(Arc::clone(&job)).await {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }

        Ok(job)
    }

    /// Lists the jobs currently recorded in the store. The snapshot is
    /// advisory: jobs may have run, been closed, or been added by the time
    /// the caller reads it.
    pub async fn list_scheduled(&self) -> Result<Vec<JobOnceMetadata>> {
        let mut scheduled = Vec::new();

        let mut page = 0;
        loop {
            let keys = self.kv.list_keys(page, self.config.page_size).await?;
            for key in &keys {
                let Some(job_key) = key.strip_prefix(ONCE_PREFIX) else {
                    continue;
                };
                match read_metadata(self.kv.as_ref(), job_key).await {
                    Ok(Some(metadata)) => scheduled.push(metadata),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(key = %key, error = %err, "Failed to read job record during scan");
                    }
                }
            }

            if keys.len() < self.config.page_size {
                break;
            }
            page += 1;
        }

        Ok(scheduled)
    }

    /// Closes a job by key: stops the local runner, if any, and removes the
    /// durable record so no other node runs it either.
    ///
    /// Useful when the original [`JobOnce`] handle is lost, or for jobs found
    /// via [`list_scheduled`](Self::list_scheduled). A peer node that already
    /// began executing is allowed to finish; it will find the record gone and
    /// clean up idempotently. Closing an unknown key is a no-op.
    pub async fn close(&self, key: &str) -> Result<()> {
        let job = { self.active_jobs.lock().await.get(key).cloned() };
        if let Some(job) = job {
            job.close().await;
            return Ok(());
        }

        // No local runner: a peer scheduled the job and this node has not
        // polled it yet. Delete the record under the job's mutex.
        let mutex = DistributedMutex::with_config(
            Arc::clone(&self.kv),
            key,
            self.config.mutex.clone(),
        )?;
        mutex.lock().await;
        if let Err(err) = self
            .kv
            .delete(&format!("{}{}", ONCE_PREFIX, key))
            .await
        {
            tracing::warn!(job_key = %key, error = %err, "Failed to delete job record");
        }
        mutex.unlock().await;

        Ok(())
    }

    /// Whether a runner for `key` exists on this node.
    pub async fn is_active(&self, key: &str) -> bool {
        self.active_jobs.lock().await.contains_key(key)
    }

    /// Spawns runners for every stored job not already tracked locally.
    /// Decode and construction failures are logged and skipped; they never
    /// abort the scan.
    async fn schedule_from_store(&self) -> Result<()> {
        let scheduled = self.list_scheduled().await?;

        for metadata in scheduled {
            match JobOnce::new(
                Arc::clone(&self.kv),
                &metadata.key,
                metadata.run_at,
                Arc::clone(&self.callbacks),
                Arc::clone(&self.active_jobs),
                self.config.clone(),
            ) {
                Ok(job) => {
                    self.track_and_spawn(job).await;
                }
                Err(err) => {
                    tracing::error!(job_key = %metadata.key, error = %err, "Could not create runner for stored job");
                }
            }
        }

        Ok(())
    }

    /// Inserts the job into the local active table and spawns its runner.
    /// Returns false when a runner for the key already exists on this node.
    async fn track_and_spawn(&self, job: Arc<JobOnce>) -> bool {
        let mut active = self.active_jobs.lock().await;
        if active.contains_key(job.key()) {
            return false;
        }
        active.insert(job.key().to_string(), Arc::clone(&job));

        tokio::spawn(job.run());
        true
    }

    /// Re-scans the store on an interval, picking up jobs scheduled by peer
    /// nodes. Runs for the life of the process; there is no stop signal.
    async fn poll_for_new_jobs(self: Arc<Self>) {
        loop {
            sleep(self.config.poll_interval + add_jitter(self.config.jitter)).await;

            if let Err(err) = self.schedule_from_store().await {
                tracing::error!(error = %err, "Job poller failed to scan the store, still polling");
            }
        }
    }

    async fn verify_callback_exists(&self) -> Result<()> {
        if self.callbacks.lock().await.is_empty() {
            return Err(ClusterError::IllegalState(
                "add callbacks before starting the scheduler".to_string(),
            ));
        }
        Ok(())
    }
}
