use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::scheduler::job::Job;
use crate::scheduler::pool::{CompletedJob, WorkerPool};
use crate::scheduler::queue::JobStore;
use crate::worker::task::{JobContext, TaskRegistry};

/// How a single stay in a worker slot ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The task returned successfully; the job file was removed.
    Succeeded(Value),
    /// The task failed; the job file stays queued for another attempt.
    Failed { error: TaskError, failures: u32 },
    /// The retry budget was already used up; the job file was removed unrun.
    Abandoned { failures: u32 },
}

/// Runs jobs placed into worker slots and reconciles the outcome with the
/// durable queue and the pool bookkeeping.
///
/// Each job runs on its own tokio task. A job file is removed before its
/// slot is released. When removal fails the job is marked as awaiting
/// removal instead, so the control loop never runs a finished job again.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    pool: Arc<RwLock<WorkerPool>>,
    store: JobStore,
    registry: Arc<TaskRegistry>,
}

impl JobExecutor {
    pub fn new(
        pool: Arc<RwLock<WorkerPool>>,
        store: JobStore,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            pool,
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Execute `job` in `slot`. The slot must already be occupied by the job.
    pub async fn execute(
        self,
        job: Job,
        slot: usize,
        cancellation_token: CancellationToken,
    ) -> ExecutionOutcome {
        let job_id = job.id();
        let failures = self.pool.read().await.retry_count(&job_id);

        if job.tries() > 0 && failures >= job.tries() {
            tracing::info!(
                job_id = %job_id,
                slot,
                failures,
                tries = job.tries(),
                "Remove job, max tries exceeded"
            );
            let removed = self.remove_file(&job).await;
            let mut pool = self.pool.write().await;
            if removed {
                pool.clear_retries(&job_id);
            } else {
                pool.mark_awaiting_removal(job_id);
            }
            pool.release(slot);
            return ExecutionOutcome::Abandoned { failures };
        }

        let ctx = JobContext::new(job_id, slot, failures + 1, cancellation_token);
        let registry = self.registry.clone();
        let task_job = job.clone();
        // The task runs on a nested tokio task so a panic surfaces as a JoinError.
        let result = tokio::spawn(async move { task_job.run(&registry, &ctx).await })
            .await
            .unwrap_or_else(|e| Err(TaskError::Panicked(e.to_string())));

        match result {
            Ok(output) => {
                let finished_at = Utc::now();
                let removed = self.remove_file(&job).await;
                let mut pool = self.pool.write().await;
                let started_at = pool.started_at(slot).unwrap_or(finished_at);
                if removed {
                    pool.clear_retries(&job_id);
                } else {
                    pool.mark_awaiting_removal(job_id);
                }
                pool.record_completion(CompletedJob {
                    job,
                    started_at,
                    finished_at,
                });
                pool.release(slot);
                tracing::info!(job_id = %job_id, slot, "Job succeeded");
                ExecutionOutcome::Succeeded(output)
            }
            Err(error) => {
                tracing::error!(
                    job_id = %job_id,
                    slot,
                    error = %error,
                    "Job failed"
                );
                let mut pool = self.pool.write().await;
                let failures = pool.record_failure(job_id);
                pool.release(slot);
                tracing::debug!(job_id = %job_id, failures, "Retry counter incremented");
                ExecutionOutcome::Failed { error, failures }
            }
        }
    }

    async fn remove_file(&self, job: &Job) -> bool {
        match self.store.remove(job).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id(), "Remove job file");
                true
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Failed to remove job file");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::pool::RunningJob;
    use crate::scheduler::queue::QueueKind;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::fs;

    struct Fixture {
        _dir: TempDir,
        pool: Arc<RwLock<WorkerPool>>,
        store: JobStore,
        executor: JobExecutor,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(&SchedulerConfig::in_dir(dir.path()))
            .await
            .unwrap();
        let pool = Arc::new(RwLock::new(WorkerPool::new(1)));
        let mut registry = TaskRegistry::with_builtins();
        registry.register_fn("fail", |_args, _ctx| async move {
            Err::<Value, _>(TaskError::Failed("boom".to_string()))
        });
        registry.register_fn("panic", |_args, _ctx| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<Value, TaskError>(Value::Null)
        });
        let executor = JobExecutor::new(pool.clone(), store.clone(), Arc::new(registry));
        Fixture {
            _dir: dir,
            pool,
            store,
            executor,
        }
    }

    /// Persist, load and place a job into slot 0 the way the control loop does.
    async fn placed(f: &Fixture, job: Job) -> Job {
        let path = f.store.persist(&job).await.unwrap();
        let job = JobStore::load(&path).await.unwrap();
        let handle = tokio::spawn(async {});
        f.pool
            .write()
            .await
            .occupy(0, RunningJob::new(job.clone(), CancellationToken::new(), handle));
        job
    }

    #[tokio::test]
    async fn success_removes_file_and_records_history() {
        let f = fixture().await;
        let job = placed(&f, Job::new("echo", json!({"message": "hi"}))).await;

        let outcome = f
            .executor
            .clone()
            .execute(job.clone(), 0, CancellationToken::new())
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Succeeded(ref v) if v == &json!("hi")));
        assert!(f.store.list(QueueKind::Ready).await.unwrap().is_empty());
        let pool = f.pool.read().await;
        assert!(pool.is_idle());
        assert_eq!(pool.history().len(), 1);
        assert_eq!(pool.history()[0].job.id(), job.id());
    }

    #[tokio::test]
    async fn unremovable_file_marks_job_finished() {
        let f = fixture().await;
        let mut job = placed(&f, Job::new("echo", json!({"message": "hi"}))).await;
        // A directory in place of the job file makes the removal fail.
        let blocker = f.store.dir(QueueKind::Ready).join("not-a-file");
        fs::create_dir(&blocker).await.unwrap();
        job.set_path(blocker.clone());

        let outcome = f
            .executor
            .clone()
            .execute(job.clone(), 0, CancellationToken::new())
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Succeeded(_)));
        assert!(blocker.exists());
        let pool = f.pool.read().await;
        assert!(pool.is_idle());
        assert!(pool.is_awaiting_removal(&job.id()));
        assert_eq!(pool.history().len(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_file_and_counts() {
        let f = fixture().await;
        let job = placed(&f, Job::new("fail", Value::Null).with_tries(3)).await;

        let outcome = f
            .executor
            .clone()
            .execute(job.clone(), 0, CancellationToken::new())
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Failed { failures: 1, .. }));
        assert_eq!(f.store.list(QueueKind::Ready).await.unwrap().len(), 1);
        let pool = f.pool.read().await;
        assert!(pool.is_idle());
        assert_eq!(pool.retry_count(&job.id()), 1);
        assert!(pool.history().is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_removes_without_running() {
        let f = fixture().await;
        let job = placed(&f, Job::new("fail", Value::Null).with_tries(2)).await;
        {
            let mut pool = f.pool.write().await;
            pool.record_failure(job.id());
            pool.record_failure(job.id());
        }

        let outcome = f
            .executor
            .clone()
            .execute(job.clone(), 0, CancellationToken::new())
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Abandoned { failures: 2 }));
        assert!(f.store.list(QueueKind::Ready).await.unwrap().is_empty());
        let pool = f.pool.read().await;
        assert!(pool.is_idle());
        assert_eq!(pool.retry_count(&job.id()), 0);
    }

    #[tokio::test]
    async fn unknown_task_is_a_failure() {
        let f = fixture().await;
        let job = placed(&f, Job::new("missing", Value::Null)).await;

        let outcome = f
            .executor
            .clone()
            .execute(job, 0, CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed {
                error: TaskError::UnknownTask(_),
                failures: 1
            }
        ));
    }

    #[tokio::test]
    async fn panic_is_a_failure() {
        let f = fixture().await;
        let job = placed(&f, Job::new("panic", Value::Null)).await;

        let outcome = f
            .executor
            .clone()
            .execute(job, 0, CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed {
                error: TaskError::Panicked(_),
                ..
            }
        ));
        assert!(f.pool.read().await.is_idle());
    }

    #[tokio::test]
    async fn attempt_number_follows_failures() {
        let f = fixture().await;
        let mut registry = TaskRegistry::new();
        registry.register_fn("attempt", |_args, ctx: JobContext| async move {
            Ok::<_, TaskError>(json!(ctx.attempt))
        });
        let executor = JobExecutor::new(f.pool.clone(), f.store.clone(), Arc::new(registry));
        let job = placed(&f, Job::new("attempt", Value::Null)).await;
        f.pool.write().await.record_failure(job.id());

        let outcome = executor.execute(job, 0, CancellationToken::new()).await;
        assert!(matches!(outcome, ExecutionOutcome::Succeeded(ref v) if v == &json!(2)));
    }
}
