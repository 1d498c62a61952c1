use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Configuration for a local scheduler instance.
///
/// The two queue directories are the durable state of the scheduler:
/// - `jobs_dir` holds jobs that may run immediately
/// - `delayed_jobs_dir` holds jobs waiting for their `start_at` time
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker slots. Hard upper bound on concurrently running jobs.
    pub pool_size: usize,
    /// Directory of ready jobs, one file per job named by id.
    pub jobs_dir: PathBuf,
    /// Directory of delayed jobs, one file per job named `{id}_{start_at}`.
    pub delayed_jobs_dir: PathBuf,
    /// Single-instance guard, created exclusively for the scheduler's lifetime.
    pub lock_path: PathBuf,
    /// Sleep between two passes of the control loop.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            jobs_dir: PathBuf::from("jobs"),
            delayed_jobs_dir: PathBuf::from("delayed_jobs"),
            lock_path: PathBuf::from(".lock"),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl SchedulerConfig {
    /// Place both queue directories and the lock file under `root`.
    pub fn in_dir(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            jobs_dir: root.join("jobs"),
            delayed_jobs_dir: root.join("delayed_jobs"),
            lock_path: root.join(".lock"),
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.jobs_dir.as_os_str().is_empty() || self.delayed_jobs_dir.as_os_str().is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "queue directories must not be empty paths".to_string(),
            ));
        }
        if self.jobs_dir == self.delayed_jobs_dir {
            return Err(SchedulerError::InvalidConfig(
                "jobs_dir and delayed_jobs_dir must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.jobs_dir, PathBuf::from("jobs"));
        assert_eq!(cfg.delayed_jobs_dir, PathBuf::from("delayed_jobs"));
        assert_eq!(cfg.lock_path, PathBuf::from(".lock"));
        assert_eq!(cfg.poll_interval, Duration::from_millis(100));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_config_in_dir() {
        let cfg = SchedulerConfig::in_dir("/var/spool/jobspool");
        assert_eq!(cfg.jobs_dir, PathBuf::from("/var/spool/jobspool/jobs"));
        assert_eq!(
            cfg.delayed_jobs_dir,
            PathBuf::from("/var/spool/jobspool/delayed_jobs")
        );
        assert_eq!(cfg.lock_path, PathBuf::from("/var/spool/jobspool/.lock"));
        assert_eq!(cfg.pool_size, 10);
    }

    #[test]
    fn scheduler_config_builders() {
        let cfg = SchedulerConfig::default()
            .with_pool_size(2)
            .with_poll_interval(Duration::from_millis(20));
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.poll_interval, Duration::from_millis(20));
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let cfg = SchedulerConfig::default().with_pool_size(0);
        assert!(matches!(
            cfg.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = SchedulerConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(
            cfg.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn shared_queue_directory_is_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.delayed_jobs_dir = cfg.jobs_dir.clone();
        assert!(cfg.validate().is_err());
    }
}
