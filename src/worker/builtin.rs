//! Tasks available to every scheduler started from the CLI.
//!
//! - `sleep`: `{"secs": 1.5}`, `{"millis": 200}` or a bare number of seconds
//! - `echo`: `{"message": "..."}`, logged and returned
//! - `touch`: `{"path": "..."}`, creates an empty file
//! - `shell`: `{"command": "..."}`, runs `sh -c` and captures output

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::TaskError;
use crate::worker::task::{JobContext, TaskHandler, TaskRegistry};

pub fn register_builtins(registry: &mut TaskRegistry) {
    registry
        .register("sleep", Arc::new(SleepTask))
        .register("echo", Arc::new(EchoTask))
        .register("touch", Arc::new(TouchTask))
        .register("shell", Arc::new(ShellTask));
}

pub struct SleepTask;

#[derive(Deserialize)]
struct SleepArgs {
    secs: Option<f64>,
    millis: Option<u64>,
}

impl SleepTask {
    fn duration(args: Value) -> Result<Duration, TaskError> {
        if let Some(secs) = args.as_f64() {
            return Self::from_secs(secs);
        }
        let args: SleepArgs = serde_json::from_value(args)?;
        match (args.secs, args.millis) {
            (Some(secs), None) => Self::from_secs(secs),
            (None, Some(millis)) => Ok(Duration::from_millis(millis)),
            _ => Err(TaskError::InvalidArgs(
                "sleep expects exactly one of secs or millis".to_string(),
            )),
        }
    }

    fn from_secs(secs: f64) -> Result<Duration, TaskError> {
        Duration::try_from_secs_f64(secs).map_err(|e| TaskError::InvalidArgs(e.to_string()))
    }
}

#[async_trait]
impl TaskHandler for SleepTask {
    async fn call(&self, args: Value, ctx: &JobContext) -> Result<Value, TaskError> {
        let duration = Self::duration(args)?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(Value::Null),
            _ = ctx.cancellation_token.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

pub struct EchoTask;

#[derive(Deserialize)]
struct EchoArgs {
    message: String,
}

#[async_trait]
impl TaskHandler for EchoTask {
    async fn call(&self, args: Value, ctx: &JobContext) -> Result<Value, TaskError> {
        let args: EchoArgs = serde_json::from_value(args)?;
        tracing::info!(job_id = %ctx.job_id, message = %args.message, "echo");
        Ok(Value::String(args.message))
    }
}

pub struct TouchTask;

#[derive(Deserialize)]
struct TouchArgs {
    path: String,
}

#[async_trait]
impl TaskHandler for TouchTask {
    async fn call(&self, args: Value, _ctx: &JobContext) -> Result<Value, TaskError> {
        let args: TouchArgs = serde_json::from_value(args)?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.path)
            .await?;
        Ok(Value::String(args.path))
    }
}

/// Runs a shell command. Cancelling the job kills the child process.
pub struct ShellTask;

#[derive(Deserialize)]
struct ShellArgs {
    command: String,
}

impl ShellTask {
    fn process_output(
        ctx: &JobContext,
        result: std::io::Result<std::process::Output>,
    ) -> Result<Value, TaskError> {
        let output = result?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        tracing::info!(
            job_id = %ctx.job_id,
            exit_code = ?exit_code,
            "Shell command finished"
        );

        if output.status.success() {
            Ok(json!({ "exit_code": exit_code, "stdout": stdout }))
        } else if stderr.is_empty() {
            Err(TaskError::Failed(format!("Exit code: {:?}", exit_code)))
        } else {
            Err(TaskError::Failed(stderr))
        }
    }
}

#[async_trait]
impl TaskHandler for ShellTask {
    async fn call(&self, args: Value, ctx: &JobContext) -> Result<Value, TaskError> {
        let args: ShellArgs = serde_json::from_value(args)?;
        tracing::debug!(job_id = %ctx.job_id, command = %args.command, "Spawning shell command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            result = child.wait_with_output() => Self::process_output(ctx, result),
            _ = ctx.cancellation_token.cancelled() => Err(TaskError::Cancelled),
        }
    }
}
