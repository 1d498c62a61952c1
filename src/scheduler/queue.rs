use std::fs::TryLockError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;

/// Which of the two queue directories a job file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Ready,
    Delayed,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Ready => write!(f, "ready"),
            QueueKind::Delayed => write!(f, "delayed"),
        }
    }
}

/// A job file found in one of the queue directories.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub kind: QueueKind,
    pub job: Job,
}

/// Parse a queue file name into the job id and, for delayed jobs, the
/// activation time in epoch seconds.
pub fn parse_file_name(name: &str) -> Result<(Uuid, Option<i64>)> {
    let invalid = || SchedulerError::InvalidFileName(name.to_string());
    match name.split_once('_') {
        Some((id, ts)) => {
            let id = Uuid::parse_str(id).map_err(|_| invalid())?;
            let ts = ts.parse::<i64>().map_err(|_| invalid())?;
            Ok((id, Some(ts)))
        }
        None => Ok((Uuid::parse_str(name).map_err(|_| invalid())?, None)),
    }
}

/// Durable job queue: two directories holding one serialized job per file.
///
/// A file's presence means the job is pending or running. Writes land in a
/// hidden temp file first and are linked into place, so listings never see a
/// partially written job.
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs_dir: PathBuf,
    delayed_jobs_dir: PathBuf,
}

impl JobStore {
    /// Open the queue, creating both directories if needed.
    pub async fn open(config: &SchedulerConfig) -> Result<Self> {
        fs::create_dir_all(&config.jobs_dir).await?;
        fs::create_dir_all(&config.delayed_jobs_dir).await?;
        Ok(Self {
            jobs_dir: config.jobs_dir.clone(),
            delayed_jobs_dir: config.delayed_jobs_dir.clone(),
        })
    }

    pub fn dir(&self, kind: QueueKind) -> &Path {
        match kind {
            QueueKind::Ready => &self.jobs_dir,
            QueueKind::Delayed => &self.delayed_jobs_dir,
        }
    }

    /// Where `job` is (or would be) stored.
    pub fn path_for(&self, job: &Job) -> PathBuf {
        let kind = if job.is_delayed() {
            QueueKind::Delayed
        } else {
            QueueKind::Ready
        };
        self.dir(kind).join(job.file_name())
    }

    /// Write a new job into the queue. Fails with `DuplicateJob` instead of
    /// overwriting an existing file for the same id.
    pub async fn persist(&self, job: &Job) -> Result<PathBuf> {
        let path = self.path_for(job);
        let tmp = temp_path(&path);
        let data = job.serialize()?;

        if let Err(e) = write_new(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(SchedulerError::DuplicateJob(job.id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored form of a job that is already queued.
    pub async fn rewrite(&self, job: &Job) -> Result<()> {
        let path = match job.path() {
            Some(path) => path.to_path_buf(),
            None => self.path_for(job),
        };
        if fs::metadata(&path).await.is_err() {
            return Err(SchedulerError::JobNotFound(job.id()));
        }
        let tmp = temp_path(&path);
        let replaced = match write_new(&tmp, &job.serialize()?).await {
            Ok(()) => fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if replaced.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        Ok(replaced?)
    }

    /// Delete hidden temp files older than `max_age`. They are left behind
    /// only when a process dies between writing and linking a job.
    pub async fn sweep_temp_files(&self, max_age: Duration) -> Result<usize> {
        let mut swept = 0;
        for kind in [QueueKind::Ready, QueueKind::Delayed] {
            let mut entries = ReadDirStream::new(fs::read_dir(self.dir(kind)).await?);
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !(name.starts_with('.') && name.ends_with(".tmp")) {
                    continue;
                }
                let age = entry
                    .metadata()
                    .await?
                    .modified()?
                    .elapsed()
                    .unwrap_or_default();
                if age < max_age {
                    continue;
                }
                match fs::remove_file(entry.path()).await {
                    Ok(()) => swept += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Removed stale temp files");
        }
        Ok(swept)
    }

    /// Queue file paths in one directory, sorted by name. Hidden files are
    /// in-progress writes and are skipped.
    pub async fn list(&self, kind: QueueKind) -> Result<Vec<PathBuf>> {
        let mut entries = ReadDirStream::new(fs::read_dir(self.dir(kind)).await?);
        let mut paths = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Read a job file; the returned job remembers its backing path.
    pub async fn load(path: &Path) -> Result<Job> {
        let data = fs::read(path).await?;
        let mut job = Job::deserialize(&data)?;
        job.set_path(path.to_path_buf());
        Ok(job)
    }

    /// Delete a job's file. A file that is already gone is not an error.
    pub async fn remove(&self, job: &Job) -> Result<()> {
        let path = match job.path() {
            Some(path) => path.to_path_buf(),
            None => self.path_for(job),
        };
        Self::remove_path(&path).await
    }

    pub async fn remove_path(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Job file already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look a job up by id in either directory, using file names only.
    pub async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        for kind in [QueueKind::Ready, QueueKind::Delayed] {
            for path in self.list(kind).await? {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Ok((file_id, _)) = parse_file_name(name) {
                    if file_id == id {
                        return Ok(Some(Self::load(&path).await?));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Every job currently queued, ready jobs first.
    pub async fn list_pending(&self) -> Result<Vec<PendingJob>> {
        let mut pending = Vec::new();
        for kind in [QueueKind::Ready, QueueKind::Delayed] {
            for path in self.list(kind).await? {
                match Self::load(&path).await {
                    Ok(job) => pending.push(PendingJob { kind, job }),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable job file"
                    ),
                }
            }
        }
        Ok(pending)
    }

}

/// Hidden sibling of `path`, unique per call so a leftover from an earlier
/// attempt never blocks a new write.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

async fn write_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Advisory lock held for the lifetime of a scheduler.
///
/// The lock is an OS file lock on an open handle, so it goes away with the
/// process even when destructors never run. The file itself is left in place
/// and only records the pid of the last holder.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl LockFile {
    pub async fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?
            .into_std()
            .await;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(SchedulerError::AlreadyLocked(path.to_path_buf()))
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let mut file = fs::File::from_std(file);
        file.set_len(0).await?;
        file.write_all(std::process::id().to_string().as_bytes())
            .await?;
        file.sync_all().await?;
        tracing::debug!(path = %path.display(), "Lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _file: file.into_std().await,
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "Lock released");
    }
}
