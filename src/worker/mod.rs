//! Job execution inside worker slots.
//!
//! - **Tasks**: jobs name a task; the [`TaskRegistry`] maps that name to a
//!   [`TaskHandler`] which receives the job's JSON arguments
//! - **Execution**: [`JobExecutor`] runs a placed job on its own tokio task and
//!   reconciles the outcome with the queue directory and the pool
//! - **Built-ins**: `sleep`, `echo`, `touch` and `shell`
//!
//! # Cancellation
//!
//! A job past its `max_working_time` only has its cancellation token
//! cancelled. Handlers that never look at [`JobContext::cancellation_token`]
//! keep running.

pub mod builtin;
pub mod executor;
pub mod task;

pub use executor::{ExecutionOutcome, JobExecutor};
pub use task::{JobContext, TaskHandler, TaskRegistry};
