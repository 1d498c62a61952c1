use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::job::Job;

/// A job occupying a worker slot.
#[derive(Debug)]
pub struct RunningJob {
    pub job: Job,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
    cancel_requested: bool,
}

impl RunningJob {
    pub fn new(job: Job, cancellation_token: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            job,
            started_at: Utc::now(),
            started: Instant::now(),
            cancellation_token,
            handle,
            cancel_requested: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A successful run, kept for observability.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job: Job,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of an occupied slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub slot: usize,
    pub job_id: Uuid,
    pub task: String,
    pub started_at: DateTime<Utc>,
}

/// A slot whose job just exceeded its time limit and was asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueJob {
    pub slot: usize,
    pub job_id: Uuid,
    pub elapsed: Duration,
    pub limit: Duration,
}

/// Fixed-size slot table plus the retry counter, completion history and the
/// finished jobs whose files could not be removed yet.
///
/// All scheduler bookkeeping lives here so a single lock guards it.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<RunningJob>>,
    retries: HashMap<Uuid, u32>,
    history: Vec<CompletedJob>,
    awaiting_removal: HashSet<Uuid>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            retries: HashMap::new(),
            history: Vec::new(),
            awaiting_removal: HashSet::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.busy_slots() == 0
    }

    /// Lowest-index empty slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Slot currently holding `job_id`, if any.
    pub fn slot_of(&self, job_id: &Uuid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.job.id() == *job_id))
    }

    pub fn is_running(&self, job_id: &Uuid) -> bool {
        self.slot_of(job_id).is_some()
    }

    pub fn get(&self, slot: usize) -> Option<&RunningJob> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Put a job into an empty slot. Returns false if the slot is taken or
    /// out of range.
    pub fn occupy(&mut self, slot: usize, running: RunningJob) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.is_none() => {
                *entry = Some(running);
                true
            }
            _ => false,
        }
    }

    /// Empty a slot, returning what it held.
    pub fn release(&mut self, slot: usize) -> Option<RunningJob> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn started_at(&self, slot: usize) -> Option<DateTime<Utc>> {
        self.get(slot).map(|r| r.started_at)
    }

    /// Failures recorded so far for a job.
    pub fn retry_count(&self, job_id: &Uuid) -> u32 {
        self.retries.get(job_id).copied().unwrap_or(0)
    }

    /// Count one more failure and return the new total.
    pub fn record_failure(&mut self, job_id: Uuid) -> u32 {
        let count = self.retries.entry(job_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_retries(&mut self, job_id: &Uuid) {
        self.retries.remove(job_id);
    }

    pub fn record_completion(&mut self, completed: CompletedJob) {
        self.history.push(completed);
    }

    pub fn history(&self) -> &[CompletedJob] {
        &self.history
    }

    /// Remember a finished job whose file is still on disk, so admission
    /// removes the file instead of running the job again.
    pub fn mark_awaiting_removal(&mut self, job_id: Uuid) {
        self.awaiting_removal.insert(job_id);
    }

    pub fn is_awaiting_removal(&self, job_id: &Uuid) -> bool {
        self.awaiting_removal.contains(job_id)
    }

    pub fn clear_awaiting_removal(&mut self, job_id: &Uuid) {
        self.awaiting_removal.remove(job_id);
        self.retries.remove(job_id);
    }

    /// Empty every slot and abort the worker tasks still holding one.
    /// Returns the ids of the jobs that were cut off.
    pub fn abort_all(&mut self) -> Vec<Uuid> {
        let mut aborted = Vec::new();
        for entry in self.slots.iter_mut() {
            if let Some(running) = entry.take() {
                running.cancellation_token.cancel();
                if !running.handle.is_finished() {
                    running.handle.abort();
                    aborted.push(running.job.id());
                }
            }
        }
        aborted
    }

    pub fn running(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                s.as_ref().map(|r| SlotInfo {
                    slot,
                    job_id: r.job.id(),
                    task: r.job.task().to_string(),
                    started_at: r.started_at,
                })
            })
            .collect()
    }

    /// Request cancellation of every job running past its `max_working_time`.
    /// Each occupancy is reported once; the job itself decides whether to stop.
    pub fn cancel_overdue(&mut self) -> Vec<OverdueJob> {
        let mut overdue = Vec::new();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(running) = entry.as_mut() else {
                continue;
            };
            if running.cancel_requested {
                continue;
            }
            let Some(limit) = running.job.max_working_time() else {
                continue;
            };
            let elapsed = running.elapsed();
            if elapsed > limit {
                running.cancellation_token.cancel();
                running.cancel_requested = true;
                overdue.push(OverdueJob {
                    slot,
                    job_id: running.job.id(),
                    elapsed,
                    limit,
                });
            }
        }
        overdue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn idle_handle() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    fn running(job: Job) -> RunningJob {
        RunningJob::new(job, CancellationToken::new(), idle_handle())
    }

    #[tokio::test]
    async fn slots_fill_in_ascending_order() {
        let mut pool = WorkerPool::new(2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_slot(), Some(0));

        assert!(pool.occupy(0, running(Job::new("echo", Value::Null))));
        assert_eq!(pool.free_slot(), Some(1));
        assert!(pool.occupy(1, running(Job::new("echo", Value::Null))));
        assert_eq!(pool.free_slot(), None);
        assert_eq!(pool.busy_slots(), 2);

        pool.release(0);
        assert_eq!(pool.free_slot(), Some(0));
    }

    #[tokio::test]
    async fn occupied_slot_is_not_overwritten() {
        let mut pool = WorkerPool::new(1);
        assert!(pool.occupy(0, running(Job::new("echo", Value::Null))));
        assert!(!pool.occupy(0, running(Job::new("echo", Value::Null))));
        assert!(!pool.occupy(5, running(Job::new("echo", Value::Null))));
    }

    #[tokio::test]
    async fn slot_lookup_by_job_id() {
        let mut pool = WorkerPool::new(3);
        let job = Job::new("echo", Value::Null);
        let id = job.id();
        pool.occupy(2, running(job));

        assert_eq!(pool.slot_of(&id), Some(2));
        assert!(pool.is_running(&id));
        assert_eq!(pool.running().len(), 1);
        assert_eq!(pool.running()[0].job_id, id);

        let released = pool.release(2).unwrap();
        assert_eq!(released.job.id(), id);
        assert!(!pool.is_running(&id));
        assert!(pool.is_idle());
    }

    #[test]
    fn retry_counter_accumulates_until_cleared() {
        let mut pool = WorkerPool::new(1);
        let id = Uuid::new_v4();
        assert_eq!(pool.retry_count(&id), 0);
        assert_eq!(pool.record_failure(id), 1);
        assert_eq!(pool.record_failure(id), 2);
        assert_eq!(pool.retry_count(&id), 2);
        pool.clear_retries(&id);
        assert_eq!(pool.retry_count(&id), 0);
    }

    #[tokio::test]
    async fn overdue_jobs_are_cancelled_once() {
        let mut pool = WorkerPool::new(2);
        let limited =
            Job::new("sleep", Value::Null).with_max_working_time(Duration::from_millis(10));
        let unlimited = Job::new("sleep", Value::Null);
        let token = CancellationToken::new();
        pool.occupy(0, RunningJob::new(limited, token.clone(), idle_handle()));
        pool.occupy(1, running(unlimited));

        assert!(pool.cancel_overdue().is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let overdue = pool.cancel_overdue();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].slot, 0);
        assert!(token.is_cancelled());
        assert!(pool.cancel_overdue().is_empty());
    }

    #[test]
    fn awaiting_removal_is_tracked_until_cleared() {
        let mut pool = WorkerPool::new(1);
        let id = Uuid::new_v4();
        pool.record_failure(id);
        pool.mark_awaiting_removal(id);
        assert!(pool.is_awaiting_removal(&id));

        pool.clear_awaiting_removal(&id);
        assert!(!pool.is_awaiting_removal(&id));
        assert_eq!(pool.retry_count(&id), 0);
    }

    #[tokio::test]
    async fn abort_all_empties_slots() {
        let mut pool = WorkerPool::new(2);
        let stuck = Job::new("sleep", Value::Null);
        let stuck_id = stuck.id();
        let token = CancellationToken::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        pool.occupy(0, RunningJob::new(stuck, token.clone(), handle));

        assert_eq!(pool.abort_all(), vec![stuck_id]);
        assert!(pool.is_idle());
        assert!(token.is_cancelled());
    }

    #[test]
    fn history_is_append_only() {
        let mut pool = WorkerPool::new(1);
        let now = Utc::now();
        pool.record_completion(CompletedJob {
            job: Job::new("echo", Value::Null),
            started_at: now,
            finished_at: now,
        });
        assert_eq!(pool.history().len(), 1);
    }
}
