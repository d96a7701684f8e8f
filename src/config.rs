use std::time::Duration;

/// Interval after which a locked mutex entry expires unless refreshed.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Interval on which a held mutex is refreshed (half the ttl).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(7_500);

/// Base wait between attempts to acquire a contended mutex.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between scans of the store for jobs scheduled by peer nodes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound of the random jitter added to sleeps that would otherwise
/// synchronize across cluster nodes.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Consecutive failed job record reads before a runner gives up.
pub const DEFAULT_MAX_FAILS: u32 = 3;

/// Wait after a failed job record read before the next attempt.
pub const DEFAULT_FAIL_WAIT: Duration = Duration::from_secs(1);

/// Keys fetched per page when scanning the store.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Timing for a [`DistributedMutex`](crate::DistributedMutex).
///
/// The defaults are part of the durable compatibility contract: entries
/// written with them are interpreted correctly by prior versions. Deviate
/// only when every node in the cluster agrees on the new values.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

/// Timing and limits for a [`JobOnceScheduler`](crate::JobOnceScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub jitter: Duration,
    pub max_fails: u32,
    pub fail_wait: Duration,
    pub page_size: usize,
    /// Timing for the per-job mutexes the scheduler creates.
    pub mutex: MutexConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            max_fails: DEFAULT_MAX_FAILS,
            fail_wait: DEFAULT_FAIL_WAIT,
            page_size: DEFAULT_PAGE_SIZE,
            mutex: MutexConfig::default(),
        }
    }
}
