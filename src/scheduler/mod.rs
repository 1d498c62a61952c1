pub mod job;
pub mod pool;
pub mod queue;
pub mod runner;

pub use job::Job;
pub use pool::{CompletedJob, SlotInfo, WorkerPool};
pub use queue::{JobStore, PendingJob, QueueKind};
pub use runner::{Placement, Scheduler, SchedulerStats};
