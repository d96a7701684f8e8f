pub mod job;
pub mod once;
pub mod registry;

pub use job::{JobOnce, JobOnceMetadata, ONCE_PREFIX};
pub use once::{get_scheduler, JobOnceScheduler};
pub use registry::{CallbackFuture, JobOnceCallback};
