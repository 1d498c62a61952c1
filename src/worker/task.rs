use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;

/// Runtime information handed to a task while it runs in a worker slot.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub slot: usize,
    /// 1 for the first attempt, incremented after every recorded failure.
    pub attempt: u32,
    /// Cancelled when the job exceeds its `max_working_time`. Observing it is
    /// up to the task; nothing forces the task to stop.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: Uuid,
        slot: usize,
        attempt: u32,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            slot,
            attempt,
            cancellation_token,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// The executable part of a job, looked up by name when the job runs.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &JobContext) -> Result<Value, TaskError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, args: Value, ctx: &JobContext) -> Result<Value, TaskError> {
        (self.f)(args, ctx.clone()).await
    }
}

/// Maps task names stored in job files to the handlers that execute them.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tasks (`sleep`, `echo`, `touch`, `shell`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::worker::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a handler, replacing any previous handler of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        let name = name.into();
        tracing::debug!(task = %name, "Task registered");
        self.handlers.insert(name, handler);
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
