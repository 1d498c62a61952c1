use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::worker::task::{JobContext, TaskRegistry};

/// A durable unit of work: a registered task name plus its arguments, and the
/// metadata the scheduler uses to decide when and how often to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: Uuid,
    task: String,
    args: Value,
    paused: bool,
    start_at: Option<DateTime<Utc>>,
    max_working_time: Option<Duration>,
    tries: u32,
    created_at: DateTime<Utc>,
    /// Backing file, set when the job is loaded from the queue.
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.task == other.task
            && self.args == other.args
            && self.paused == other.paused
            && self.start_at == other.start_at
            && self.max_working_time == other.max_working_time
            && self.tries == other.tries
            && self.created_at == other.created_at
    }
}

impl Job {
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args,
            paused: false,
            start_at: None,
            max_working_time: None,
            tries: 0,
            created_at: Utc::now(),
            path: None,
        }
    }

    /// Activate the job at an absolute time instead of immediately.
    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    /// Activate the job `delay` from now.
    pub fn delay(self, delay: Duration) -> Self {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.start_at(at)
    }

    /// Soft time limit. A zero duration means unbounded.
    pub fn with_max_working_time(mut self, limit: Duration) -> Self {
        self.max_working_time = if limit.is_zero() { None } else { Some(limit) };
        self
    }

    /// Maximum number of failed attempts before the job is dropped; 0 retries forever.
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn is_delayed(&self) -> bool {
        self.start_at.is_some()
    }

    pub fn start_at_time(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    pub fn max_working_time(&self) -> Option<Duration> {
        self.max_working_time
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// True once a delayed job's activation time has passed. Immediate jobs are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.start_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Queue file name: `{id}` for ready jobs, `{id}_{start_at}` (epoch seconds) for delayed ones.
    pub fn file_name(&self) -> String {
        match self.start_at {
            Some(at) => format!("{}_{}", self.id, at.timestamp()),
            None => self.id.to_string(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Invoke the registered handler for this job's task with its arguments.
    pub async fn run(
        &self,
        registry: &TaskRegistry,
        ctx: &JobContext,
    ) -> std::result::Result<Value, TaskError> {
        tracing::info!(
            job_id = %self.id,
            task = %self.task,
            args = %self.args,
            attempt = ctx.attempt,
            "Run job"
        );
        let handler = registry
            .get(&self.task)
            .ok_or_else(|| TaskError::UnknownTask(self.task.clone()))?;
        handler.call(self.args.clone(), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_job_is_ready_and_unbounded() {
        let job = Job::new("echo", json!({"message": "hi"}));
        assert_eq!(job.task(), "echo");
        assert!(!job.paused());
        assert!(!job.is_delayed());
        assert!(job.max_working_time().is_none());
        assert_eq!(job.tries(), 0);
        assert!(job.path().is_none());
        assert_eq!(job.file_name(), job.id().to_string());
    }

    #[test]
    fn ids_are_unique() {
        let a = Job::new("echo", Value::Null);
        let b = Job::new("echo", Value::Null);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn delayed_job_file_name_embeds_epoch_seconds() {
        let at = DateTime::parse_from_rfc3339("2030-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let job = Job::new("echo", Value::Null).start_at(at);
        assert!(job.is_delayed());
        assert_eq!(job.file_name(), format!("{}_{}", job.id(), at.timestamp()));
    }

    #[test]
    fn is_due_compares_against_start_at() {
        let now = Utc::now();
        let job = Job::new("echo", Value::Null).start_at(now + chrono::Duration::seconds(15));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(15)));
        assert!(Job::new("echo", Value::Null).is_due(now));
    }

    #[test]
    fn zero_max_working_time_means_unbounded() {
        let job = Job::new("sleep", Value::Null).with_max_working_time(Duration::ZERO);
        assert!(job.max_working_time().is_none());

        let job = Job::new("sleep", Value::Null).with_max_working_time(Duration::from_secs(3));
        assert_eq!(job.max_working_time(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn pause_and_resume() {
        let mut job = Job::new("echo", Value::Null);
        job.pause();
        assert!(job.paused());
        job.resume();
        assert!(!job.paused());
    }

    #[test]
    fn serialization_preserves_metadata() {
        let mut job = Job::new("shell", json!({"command": "echo hello", "env": [1, 2]}))
            .delay(Duration::from_secs(60))
            .with_max_working_time(Duration::from_millis(1500))
            .with_tries(3);
        job.pause();

        let restored = Job::deserialize(&job.serialize().unwrap()).unwrap();
        assert_eq!(restored, job);
        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.args(), job.args());
        assert_eq!(restored.start_at_time(), job.start_at_time());
        assert_eq!(restored.max_working_time(), Some(Duration::from_millis(1500)));
        assert_eq!(restored.tries(), 3);
        assert!(restored.paused());
    }

    #[test]
    fn path_is_not_serialized_or_compared() {
        let job = Job::new("echo", Value::Null);
        let mut loaded = Job::deserialize(&job.serialize().unwrap()).unwrap();
        assert!(loaded.path().is_none());
        loaded.set_path(PathBuf::from("/tmp/jobs/x"));
        assert_eq!(loaded, job);
    }

    #[test]
    fn garbage_does_not_deserialize() {
        assert!(Job::deserialize(b"not a job").is_err());
    }
}
