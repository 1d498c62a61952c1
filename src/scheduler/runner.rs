use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::scheduler::pool::{CompletedJob, RunningJob, SlotInfo, WorkerPool};
use crate::scheduler::queue::{parse_file_name, JobStore, LockFile, QueueKind};
use crate::worker::task::TaskRegistry;
use crate::worker::JobExecutor;

/// Temp files older than this cannot belong to a write still in progress.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Result of trying to put a job into the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed(usize),
    AlreadyRunning(usize),
    PoolFull,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub pool_size: usize,
    pub busy_slots: usize,
    pub completed: usize,
    pub pending_ready: usize,
    pub pending_delayed: usize,
}

#[derive(Default)]
struct LoopState {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: SchedulerConfig,
    store: JobStore,
    pool: Arc<RwLock<WorkerPool>>,
    executor: JobExecutor,
    control: Mutex<LoopState>,
    _lock: LockFile,
}

/// Local job scheduler.
///
/// Jobs are persisted into the queue directories by [`Scheduler::submit`] and
/// picked up by a polling control loop that runs on its own tokio task once
/// [`Scheduler::run`] is called. Each pass of the loop:
///
/// 1. **Admits ready jobs**: every file in the ready directory whose job is
///    not paused and not already in a slot is placed into a free slot
/// 2. **Activates delayed jobs**: delayed files whose `start_at` has passed
///    are placed the same way; the file stays where it is until completion
/// 3. **Enforces time limits**: slots running past `max_working_time` have
///    their cancellation token cancelled
///
/// The queue directories are the source of truth. Jobs found on disk at
/// startup (left over from a previous process) are simply picked up again.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Validate `config`, take the lock file and open the queue directories.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a bad configuration, `AlreadyLocked` if
    /// another scheduler holds the lock file, or an I/O error.
    pub async fn new(config: SchedulerConfig, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;
        let lock = LockFile::acquire(&config.lock_path).await?;
        let store = JobStore::open(&config).await?;
        if let Err(e) = store.sweep_temp_files(STALE_TEMP_AGE).await {
            tracing::warn!(error = %e, "Failed to sweep stale temp files");
        }
        let pool = Arc::new(RwLock::new(WorkerPool::new(config.pool_size)));
        let executor = JobExecutor::new(pool.clone(), store.clone(), Arc::new(registry));

        tracing::info!(
            pool_size = config.pool_size,
            jobs_dir = %config.jobs_dir.display(),
            delayed_jobs_dir = %config.delayed_jobs_dir.display(),
            "Scheduler initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                pool,
                executor,
                control: Mutex::new(LoopState::default()),
                _lock: lock,
            }),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.inner.executor.registry()
    }

    /// Persist a job so the control loop can pick it up.
    pub async fn submit(&self, job: Job) -> Result<Uuid> {
        if !self.registry().contains(job.task()) {
            tracing::warn!(
                job_id = %job.id(),
                task = %job.task(),
                "Submitting job for unregistered task"
            );
        }
        let path = self.inner.store.persist(&job).await?;
        tracing::info!(
            job_id = %job.id(),
            task = %job.task(),
            delayed = job.is_delayed(),
            path = %path.display(),
            "Job persisted"
        );
        Ok(job.id())
    }

    /// Start the control loop on its own task. Does nothing if it is already running.
    pub fn run(&self) {
        let mut control = self.lock_control();
        if control.token.as_ref().is_some_and(|t| !t.is_cancelled()) {
            tracing::debug!("Scheduler already running");
            return;
        }
        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        // A loop stopped but not yet joined finishes its pass before the new
        // one starts, and joining the new loop joins both.
        let previous = control.handle.take();
        control.handle = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    tracing::error!(error = %e, "Previous control loop task failed");
                }
            }
            inner.control_loop(loop_token).await;
        }));
        control.token = Some(token);
        tracing::info!("Scheduler started");
    }

    /// Ask the control loop to exit once its current pass completes.
    pub fn stop(&self) {
        if let Some(token) = self.lock_control().token.take() {
            token.cancel();
            tracing::info!("Scheduler stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_control()
            .token
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Stop the loop, wait for it to exit, and start a fresh one.
    pub async fn restart(&self) {
        self.stop();
        self.join_loop().await;
        self.run();
    }

    /// Stop the loop and wait up to `timeout` for running jobs to finish.
    /// Jobs still running after that are aborted; their files stay queued.
    /// Returns true if the pool drained in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        self.join_loop().await;
        let drained = tokio::time::timeout(timeout, self.wait_idle()).await.is_ok();
        if drained {
            tracing::info!("Scheduler drained");
        } else {
            let aborted = self.inner.pool.write().await.abort_all();
            for job_id in &aborted {
                tracing::warn!(job_id = %job_id, "Aborted job still running at shutdown");
            }
            tracing::warn!(aborted = aborted.len(), "Scheduler shut down before draining");
        }
        drained
    }

    /// Wait until no worker slot is occupied.
    pub async fn wait_idle(&self) {
        loop {
            if self.inner.pool.read().await.is_idle() {
                return;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// Mark a queued job as paused so the control loop skips it.
    pub async fn pause_job(&self, id: Uuid) -> Result<()> {
        self.set_paused(id, true).await
    }

    /// Clear a queued job's pause flag.
    pub async fn resume_job(&self, id: Uuid) -> Result<()> {
        self.set_paused(id, false).await
    }

    /// Run one pass of the control loop. Exposed for callers that drive the
    /// scheduler themselves instead of using [`Scheduler::run`].
    pub async fn poll_once(&self) {
        self.inner.poll_once().await;
    }

    /// Try to put a job into the lowest free slot and start it.
    pub async fn try_place(&self, job: Job) -> Placement {
        self.inner.try_place(job).await
    }

    pub async fn running_jobs(&self) -> Vec<SlotInfo> {
        self.inner.pool.read().await.running()
    }

    pub async fn completed_jobs(&self) -> Vec<CompletedJob> {
        self.inner.pool.read().await.history().to_vec()
    }

    pub async fn retry_count(&self, id: Uuid) -> u32 {
        self.inner.pool.read().await.retry_count(&id)
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let pending_ready = self.inner.store.list(QueueKind::Ready).await?.len();
        let pending_delayed = self.inner.store.list(QueueKind::Delayed).await?.len();
        let pool = self.inner.pool.read().await;
        Ok(SchedulerStats {
            running: self.is_running(),
            pool_size: pool.size(),
            busy_slots: pool.busy_slots(),
            completed: pool.history().len(),
            pending_ready,
            pending_delayed,
        })
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        // Holding the pool lock keeps the job from being placed or finished
        // while its file is rewritten.
        let pool = self.inner.pool.write().await;
        if pool.is_running(&id) {
            return Err(SchedulerError::JobRunning(id));
        }
        let mut job = self
            .inner
            .store
            .find(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))?;
        if paused {
            job.pause();
        } else {
            job.resume();
        }
        self.inner.store.rewrite(&job).await?;
        drop(pool);
        tracing::info!(job_id = %id, paused, "Job pause flag updated");
        Ok(())
    }

    async fn join_loop(&self) {
        let handle = self.lock_control().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Control loop task failed");
            }
        }
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    async fn control_loop(&self, token: CancellationToken) {
        tracing::debug!("Control loop started");
        while !token.is_cancelled() {
            self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = token.cancelled() => {}
            }
        }
        tracing::info!("Control loop stopped");
    }

    async fn poll_once(&self) {
        {
            let pool = self.pool.read().await;
            tracing::debug!(
                busy_slots = pool.busy_slots(),
                completed = pool.history().len(),
                "Polling queue"
            );
        }
        self.admit(QueueKind::Ready).await;
        self.admit(QueueKind::Delayed).await;
        self.enforce_time_limits().await;
    }

    /// Place every eligible job found in one queue directory. Stops at the
    /// first job that finds the pool full; the rest wait for the next pass.
    async fn admit(&self, kind: QueueKind) {
        let paths = match self.store.list(kind).await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::error!(queue = %kind, error = %e, "Failed to list queue directory");
                return;
            }
        };

        for path in paths {
            let now = Utc::now();
            if let Some((id, start_at)) = file_name_hint(&path) {
                let (running, finished) = {
                    let pool = self.pool.read().await;
                    (pool.is_running(&id), pool.is_awaiting_removal(&id))
                };
                if running {
                    continue;
                }
                if finished {
                    self.retry_removal(id, &path).await;
                    continue;
                }
                if start_at.is_some_and(|ts| ts > now.timestamp()) {
                    continue;
                }
            }

            let job = match JobStore::load(&path).await {
                Ok(job) => job,
                Err(SchedulerError::Io(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to load job file");
                    continue;
                }
            };

            if job.paused() {
                tracing::trace!(job_id = %job.id(), "Skipping paused job");
                continue;
            }
            if !job.is_due(now) {
                continue;
            }

            if self.try_place(job).await == Placement::PoolFull {
                tracing::debug!(queue = %kind, "Worker pool full, deferring remaining jobs");
                break;
            }
        }
    }

    /// Remove the file of a job that already finished.
    async fn retry_removal(&self, id: Uuid, path: &Path) {
        let mut pool = self.pool.write().await;
        match JobStore::remove_path(path).await {
            Ok(()) => {
                pool.clear_awaiting_removal(&id);
                tracing::info!(job_id = %id, "Removed file of finished job");
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Finished job file still not removable");
            }
        }
    }

    async fn try_place(&self, job: Job) -> Placement {
        let mut pool = self.pool.write().await;
        if let Some(slot) = pool.slot_of(&job.id()) {
            return Placement::AlreadyRunning(slot);
        }
        let Some(slot) = pool.free_slot() else {
            return Placement::PoolFull;
        };

        tracing::info!(job_id = %job.id(), task = %job.task(), slot, "Put job into slot");
        let token = CancellationToken::new();
        let executor = self.executor.clone();
        let task_job = job.clone();
        let task_token = token.clone();
        // Spawned while the pool lock is held: the worker's first step takes
        // the same lock, so it cannot observe the slot before it is occupied.
        let handle = tokio::spawn(async move {
            executor.execute(task_job, slot, task_token).await;
        });
        pool.occupy(slot, RunningJob::new(job, token, handle));
        Placement::Placed(slot)
    }

    async fn enforce_time_limits(&self) {
        let overdue = self.pool.write().await.cancel_overdue();
        for job in overdue {
            tracing::warn!(
                job_id = %job.job_id,
                slot = job.slot,
                elapsed_ms = job.elapsed.as_millis() as u64,
                limit_ms = job.limit.as_millis() as u64,
                "Job exceeded max working time, requesting stop"
            );
        }
    }
}

fn file_name_hint(path: &Path) -> Option<(Uuid, Option<i64>)> {
    let name = path.file_name()?.to_str()?;
    parse_file_name(name).ok()
}
