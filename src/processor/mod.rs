pub mod job;
pub mod scheduler;
pub mod shutdown;
pub mod window;
pub mod worker;

pub use job::{BackfillJob, SyncPair};
pub use scheduler::{PassSummary, SchedulerConfig, SchedulerHandle, SyncOutcome, SyncScheduler};
pub use shutdown::ShutdownSignal;
pub use window::{compute_fetch_window, max_lookback, FetchWindow};
pub use worker::{BackfillReport, BackfillWorker, ChainFactory};
