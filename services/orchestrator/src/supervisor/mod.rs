//! OS process supervision.
//!
//! The [`ProcessSupervisor`] launches instance processes, watches them with
//! one monitor task each and terminates them on request. Each tracked
//! process sits in a private map; whichever path removes the entry (the
//! monitor seeing an exit, or [`ProcessSupervisor::stop`]) owns the final
//! status update and the resource release, so both happen exactly once.

mod command;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sfw_id::InstanceId;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::definition::ServiceDefinition;
use crate::error::{ServiceError, ServiceResult};
use crate::instance::{InstanceStatus, ServiceInstance, StatusUpdate};
use crate::placement::PlacementScheduler;
use crate::registry::InstanceRegistry;

pub use command::{build_argv, exit_code_of, log_path, log_tail, INSTANCE_ID_ENV, LOG_TAIL_CHARS};

/// Shortest monitor tick; shorter ones are raised to this.
pub const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub log_dir: PathBuf,
    /// Wait after spawn before checking for an immediate exit.
    pub launch_grace: Duration,
    pub monitor_interval: Duration,
    /// Graceful stop window before SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            launch_grace: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct TrackedProcess {
    pid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
    definition: Arc<ServiceDefinition>,
    node_id: Option<String>,
    shutdown: watch::Sender<bool>,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    registry: Arc<InstanceRegistry>,
    placement: Arc<PlacementScheduler>,
    tracked: Mutex<HashMap<InstanceId, TrackedProcess>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<InstanceRegistry>,
        placement: Arc<PlacementScheduler>,
    ) -> Self {
        let mut config = config;
        if config.monitor_interval < MIN_MONITOR_INTERVAL {
            warn!(
                requested = ?config.monitor_interval,
                minimum = ?MIN_MONITOR_INTERVAL,
                "Monitor interval too short, using minimum"
            );
            config.monitor_interval = MIN_MONITOR_INTERVAL;
        }
        Self {
            config,
            registry,
            placement,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, TrackedProcess>> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, id: &InstanceId) -> Option<TrackedProcess> {
        self.lock().remove(id)
    }

    pub fn is_tracked(&self, id: &InstanceId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pid_of(&self, id: &InstanceId) -> Option<u32> {
        self.lock().get(id).and_then(|p| p.pid)
    }

    /// Spawns the process for `instance` and starts tracking it.
    ///
    /// Sets `pid`, `log_file` and, when a port is configured, `endpoint`.
    /// A process that exits within the grace period is a start failure
    /// carrying the tail of its log. Nothing is tracked on failure.
    pub async fn launch(
        &self,
        instance: &mut ServiceInstance,
        definition: &Arc<ServiceDefinition>,
    ) -> ServiceResult<()> {
        let start_failed = |exit_code: Option<i32>, detail: String| ServiceError::StartFailed {
            name: instance.name.clone(),
            exit_code,
            detail,
        };

        let argv = build_argv(&definition.entry_point, &instance.config, &instance.id);
        let Some((program, args)) = argv.split_first() else {
            return Err(start_failed(None, "entry point is empty".to_string()));
        };

        std::fs::create_dir_all(&self.config.log_dir).map_err(|e| {
            start_failed(
                None,
                format!("creating log dir {}: {e}", self.config.log_dir.display()),
            )
        })?;
        let log_file = log_path(&self.config.log_dir, &instance.name, &instance.id);
        let (stdout, stderr) = open_log(&log_file)
            .map_err(|e| start_failed(None, format!("opening {}: {e}", log_file.display())))?;

        info!(
            instance_id = %instance.id,
            service = %instance.name,
            program = %program,
            args = ?args,
            log_file = %log_file.display(),
            "Launching instance"
        );

        let mut child = Command::new(program)
            .args(args)
            .env(INSTANCE_ID_ENV, instance.id.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| start_failed(None, format!("spawn {program}: {e}")))?;
        let pid = child.id();

        tokio::time::sleep(self.config.launch_grace).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                let tail = log_tail(&log_file, LOG_TAIL_CHARS);
                warn!(instance_id = %instance.id, exit_code = code, "Instance exited during startup");
                return Err(start_failed(
                    Some(code),
                    format!("process exited immediately with code {code}\n{tail}"),
                ));
            }
            Err(e) => {
                let _ = child.start_kill();
                return Err(start_failed(None, format!("polling process: {e}")));
            }
        }

        instance.pid = pid;
        instance.log_file = Some(log_file);
        if let Some(port) = instance.port() {
            instance.endpoint = Some(format!("http://localhost:{port}"));
        }

        let (shutdown, _) = watch::channel(false);
        self.lock().insert(
            instance.id,
            TrackedProcess {
                pid,
                child: Arc::new(tokio::sync::Mutex::new(child)),
                definition: Arc::clone(definition),
                node_id: instance.node_id.clone(),
                shutdown,
            },
        );

        info!(instance_id = %instance.id, pid = ?pid, "Instance process started");
        Ok(())
    }

    /// Starts the monitor for a tracked instance. `None` if it is not tracked.
    pub fn spawn_monitor(self: &Arc<Self>, id: InstanceId) -> Option<JoinHandle<()>> {
        let (child, shutdown) = {
            let tracked = self.lock();
            let process = tracked.get(&id)?;
            (Arc::clone(&process.child), process.shutdown.subscribe())
        };
        let supervisor = Arc::clone(self);
        Some(tokio::spawn(async move {
            supervisor.monitor(id, child, shutdown).await;
        }))
    }

    async fn monitor(
        &self,
        id: InstanceId,
        child: Arc<tokio::sync::Mutex<Child>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(instance_id = %id, interval = ?self.config.monitor_interval, "Monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender means the entry was claimed elsewhere.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(instance_id = %id, "Monitor released");
                        return;
                    }
                }
            }

            self.registry.update_heartbeat(&id).await;

            let polled = child.lock().await.try_wait();
            match polled {
                Ok(None) => {}
                Ok(Some(status)) => {
                    self.handle_exit(id, status).await;
                    return;
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to poll instance process"),
            }
        }
    }

    async fn handle_exit(&self, id: InstanceId, status: ExitStatus) {
        let Some(process) = self.claim(&id) else {
            // Stop got there first and owns the cleanup.
            return;
        };

        let code = exit_code_of(status);
        let next = if code == 0 {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Error
        };
        if code == 0 {
            info!(instance_id = %id, "Instance exited cleanly");
        } else {
            warn!(instance_id = %id, exit_code = code, "Instance exited abnormally");
        }

        let update = StatusUpdate::to(next).exit_code(code).stopped_at(Utc::now());
        if let Err(e) = self.registry.update_status(&id, update).await {
            warn!(instance_id = %id, error = %e, "Could not record instance exit");
        }
        self.release(&process);
    }

    fn release(&self, process: &TrackedProcess) {
        if let Some(node_id) = &process.node_id {
            self.placement.release_resources(node_id, &process.definition);
        }
    }

    /// Terminates a tracked instance.
    ///
    /// Sends SIGTERM, waits up to the stop timeout and then kills. With
    /// `force` the kill is immediate. Returns `Ok(false)` when no process is
    /// tracked for `id`.
    pub async fn stop(&self, id: &InstanceId, force: bool) -> ServiceResult<bool> {
        let Some(process) = self.claim(id) else {
            debug!(instance_id = %id, "Stop requested for untracked instance");
            return Ok(false);
        };
        let _ = process.shutdown.send(true);

        if let Err(e) = self
            .registry
            .update_status(id, StatusUpdate::to(InstanceStatus::Stopping))
            .await
        {
            debug!(instance_id = %id, error = %e, "Stopping status not recorded");
        }

        info!(instance_id = %id, pid = ?process.pid, force, "Stopping instance");
        let outcome = self.terminate(id, &process, force).await;

        let update = match &outcome {
            Ok(status) => StatusUpdate::to(InstanceStatus::Stopped)
                .exit_code(exit_code_of(*status))
                .stopped_at(Utc::now()),
            Err(_) => StatusUpdate::to(InstanceStatus::Error).stopped_at(Utc::now()),
        };
        if let Err(e) = self.registry.update_status(id, update).await {
            debug!(instance_id = %id, error = %e, "Final status not recorded");
        }
        self.release(&process);

        match outcome {
            Ok(status) => {
                info!(instance_id = %id, exit_code = exit_code_of(status), "Instance stopped");
                Ok(true)
            }
            Err(e) => {
                error!(instance_id = %id, error = %e, "Failed to stop instance");
                Err(ServiceError::StopFailed {
                    instance_id: *id,
                    detail: e.to_string(),
                })
            }
        }
    }

    async fn terminate(
        &self,
        id: &InstanceId,
        process: &TrackedProcess,
        force: bool,
    ) -> std::io::Result<ExitStatus> {
        let mut child = process.child.lock().await;

        if !force {
            if let Some(pid) = process.pid {
                if let Err(e) = send_sigterm(pid) {
                    warn!(instance_id = %id, error = %e, "SIGTERM failed");
                }
            }
            match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
                Ok(result) => return result,
                Err(_) => warn!(
                    instance_id = %id,
                    timeout = ?self.config.stop_timeout,
                    "Instance ignored SIGTERM, killing"
                ),
            }
        }

        if child.try_wait()?.is_none() {
            child.start_kill()?;
        }
        child.wait().await
    }

    /// Stops every tracked process. Returns how many were stopped.
    pub async fn stop_all(&self, force: bool) -> usize {
        let ids: Vec<InstanceId> = self.lock().keys().copied().collect();
        let mut stopped = 0;
        for id in ids {
            match self.stop(&id, force).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(instance_id = %id, error = %e, "Stop during shutdown failed"),
            }
        }
        stopped
    }
}

fn open_log(path: &std::path::Path) -> std::io::Result<(Stdio, Stdio)> {
    let out = File::create(path)?;
    let err = out.try_clone()?;
    Ok((Stdio::from(out), Stdio::from(err)))
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| std::io::Error::other("pid out of range"))?;
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    // No graceful signal; the timeout path kills.
    Ok(())
}
