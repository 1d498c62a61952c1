pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError, TaskError};
pub use scheduler::{Job, Scheduler};
pub use worker::{JobContext, TaskHandler, TaskRegistry};
