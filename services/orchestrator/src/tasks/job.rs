//! Scheduled task records and task bodies.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sfw_id::{InstanceId, RunId};
use tokio::process::Command;

use super::trigger::Trigger;

/// Passed to a task body on every execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub run_id: RunId,
    pub fired_at: DateTime<Utc>,
}

/// The work a scheduled task performs.
///
/// Errors are logged by the scheduler and never cancel the task.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

type BoxedRun = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct FnTask<F>(F);

#[async_trait]
impl<F> TaskBody for FnTask<F>
where
    F: Fn(TaskContext) -> BoxedRun + Send + Sync,
{
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Wraps an async closure as a task body.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskBody>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnTask(move |ctx: TaskContext| -> BoxedRun { Box::pin(f(ctx)) }))
}

/// Runs an external command, appending its output to a log file.
#[derive(Debug, Clone)]
pub struct CommandTask {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    log_file: Option<PathBuf>,
}

impl CommandTask {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: Vec::new(),
            log_file: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    fn output(&self) -> anyhow::Result<(Stdio, Stdio)> {
        let Some(path) = &self.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

#[async_trait]
impl TaskBody for CommandTask {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("empty command");
        };
        let (stdout, stderr) = self.output()?;

        let status = Command::new(program)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SFW_TASK_RUN_ID", ctx.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await
            .with_context(|| format!("spawning {program}"))?;

        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }
}

/// A recurring unit of work.
#[derive(Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub trigger: Trigger,
    pub body: Arc<dyn TaskBody>,
    /// Total scheduled runs before the task removes itself.
    pub times: Option<u64>,
    /// Also run once right away, outside the scheduled runs.
    pub immediate: bool,
    /// Instance the task works against, if any.
    pub instance_id: Option<InstanceId>,
}

impl ScheduledTask {
    pub fn new(id: impl Into<String>, trigger: Trigger, body: Arc<dyn TaskBody>) -> Self {
        Self {
            id: id.into(),
            trigger,
            body,
            times: None,
            immediate: false,
            instance_id: None,
        }
    }

    pub fn times(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn bound_to(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("times", &self.times)
            .field("immediate", &self.immediate)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub trigger: String,
    pub next_run: DateTime<Utc>,
    pub executed_times: u64,
    /// Scheduled runs left, when limited.
    pub remaining: Option<u64>,
    pub instance_id: Option<InstanceId>,
}
