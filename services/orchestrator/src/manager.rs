//! The orchestrator.
//!
//! [`ServiceManager`] composes the registry, placement, supervisor and task
//! scheduler into start, stop, restart and status operations. It is the only
//! component external callers talk to.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sfw_id::{InstanceId, RunId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::definition::{
    merge_config, validate_service_name, Capability, CapabilityKind, ConfigMap, ServiceDefinition,
};
use crate::discovery::ServiceDiscovery;
use crate::error::{Result, ServiceError};
use crate::instance::{InstanceStatus, ServiceInstance, StatusSummary};
use crate::placement::{NodeStatus, PlacementScheduler, LOCAL_KIND};
use crate::registry::InstanceRegistry;
use crate::supervisor::{ProcessSupervisor, INSTANCE_ID_ENV};
use crate::tasks::{CommandTask, ScheduledTask, TaskBody, TaskContext, TaskInfo, TaskScheduler};

/// First port tried when a start carries no `port`.
pub const PORT_RANGE_START: u16 = 8000;
pub const PORT_RANGE_END: u16 = 9000;
/// Used when every scanned port is taken.
pub const FALLBACK_PORT: u16 = 8080;

/// Per-start options.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Merged over the definition's `default_config`.
    pub config: ConfigMap,
    /// Only this node is considered for placement.
    pub node_id: Option<String>,
    /// Consult the discovery source when the service is not registered.
    pub auto_discover: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            config: ConfigMap::new(),
            node_id: None,
            auto_discover: true,
        }
    }
}

impl StartOptions {
    pub fn with_config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.auto_discover = false;
        self
    }
}

pub struct ServiceManager {
    registry: Arc<InstanceRegistry>,
    placement: Arc<PlacementScheduler>,
    supervisor: Arc<ProcessSupervisor>,
    tasks: Arc<TaskScheduler>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    /// Scheduled capability tasks per instance.
    bound_tasks: Mutex<HashMap<InstanceId, Vec<String>>>,
    /// Per-service gates, held from the max-instances check until the
    /// instance is registered. Starts of different services run in parallel.
    admission: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_checker: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        placement: Arc<PlacementScheduler>,
        supervisor: Arc<ProcessSupervisor>,
        tasks: Arc<TaskScheduler>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            placement,
            supervisor,
            tasks,
            discovery: None,
            bound_tasks: Mutex::new(HashMap::new()),
            admission: Mutex::new(HashMap::new()),
            shutdown_tx,
            heartbeat_checker: Mutex::new(None),
        }
    }

    /// Wires every component from `config`, with the `local` node seeded.
    pub fn from_config(config: &Config) -> Self {
        let registry = Arc::new(InstanceRegistry::new(config.heartbeat_interval()));
        let placement = Arc::new(PlacementScheduler::with_local_node(config.placement_strategy));
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.supervisor_config(),
            Arc::clone(&registry),
            Arc::clone(&placement),
        ));
        Self::new(registry, placement, supervisor, Arc::new(TaskScheduler::new()))
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn placement(&self) -> &Arc<PlacementScheduler> {
        &self.placement
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn task_scheduler(&self) -> &Arc<TaskScheduler> {
        &self.tasks
    }

    fn admission_gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    fn bound(&self) -> MutexGuard<'_, HashMap<InstanceId, Vec<String>>> {
        self.bound_tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== Lifecycle =====

    /// Starts the heartbeat checker and the task scheduler loop.
    pub fn start(&self) {
        let mut checker = self
            .heartbeat_checker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if checker.is_none() {
            self.shutdown_tx.send_replace(false);
            let registry = Arc::clone(&self.registry);
            let shutdown = self.shutdown_tx.subscribe();
            *checker = Some(tokio::spawn(registry.run_heartbeat_checker(shutdown)));
        }
        drop(checker);

        self.tasks.start();
        info!("Service manager started");
    }

    /// Stops background loops, then every supervised process.
    ///
    /// Returns how many processes were stopped.
    pub async fn shutdown(&self) -> usize {
        info!("Service manager shutting down");
        self.tasks.stop();
        self.shutdown_tx.send_replace(true);

        let checker = self
            .heartbeat_checker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = checker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat checker ended abnormally");
            }
        }

        let task_ids: Vec<String> = self.bound().drain().flat_map(|(_, ids)| ids).collect();
        for task_id in task_ids {
            self.tasks.cancel(&task_id);
        }

        let stopped = self.supervisor.stop_all(false).await;
        info!(stopped, "Service manager stopped");
        stopped
    }

    // ===== Registration =====

    pub async fn register(&self, definition: ServiceDefinition) -> Result<Arc<ServiceDefinition>> {
        Ok(self.registry.register_definition(definition).await?)
    }

    pub async fn definitions(&self) -> Vec<Arc<ServiceDefinition>> {
        self.registry.definitions().await
    }

    async fn resolve_definition(
        &self,
        name: &str,
        auto_discover: bool,
    ) -> Result<Arc<ServiceDefinition>> {
        if let Some(definition) = self.registry.get_definition(name).await {
            return Ok(definition);
        }
        let not_registered = || ServiceError::NotRegistered(name.to_string());
        if !auto_discover {
            return Err(not_registered().into());
        }
        let Some(discovery) = &self.discovery else {
            return Err(not_registered().into());
        };
        let Some(found) = discovery.discover(name).await else {
            debug!(service = %name, "Discovery found nothing");
            return Err(not_registered().into());
        };
        if found.name != name {
            warn!(service = %name, found = %found.name, "Discovery returned a different service");
            return Err(not_registered().into());
        }
        info!(service = %name, "Registering discovered service");
        self.register(found).await
    }

    // ===== Start / stop =====

    /// Places, launches and registers a new instance of `name`.
    pub async fn start_service(&self, name: &str, options: StartOptions) -> Result<ServiceInstance> {
        validate_service_name(name)?;
        let definition = self.resolve_definition(name, options.auto_discover).await?;

        let gate = self.admission_gate(name);
        let admission = gate.lock().await;

        let running = self.registry.running_count(name).await;
        let max = definition.max_instances;
        if max > 0 && running >= max as usize {
            return Err(ServiceError::AlreadyRunning {
                name: name.to_string(),
                running,
                max,
            }
            .into());
        }

        let mut config = merge_config(&definition.default_config, &options.config);
        if !config.contains_key("port") {
            config.insert("port".to_string(), find_available_port().into());
        }

        let (node_id, node) = self
            .placement
            .schedule(&definition, options.node_id.as_deref())?;
        if node.kind != LOCAL_KIND {
            warn!(
                service = %name,
                node_id = %node_id,
                kind = %node.kind,
                "Remote launch is not supported, launching locally"
            );
        }

        let mut instance = ServiceInstance::new(name, config);
        instance.node_id = Some(node_id.clone());
        instance.service_type = definition.service_type().to_string();
        instance.metadata = instance_metadata(&definition, &node);

        if let Err(e) = self.supervisor.launch(&mut instance, &definition).await {
            self.placement.release_resources(&node_id, &definition);
            error!(service = %name, node_id = %node_id, error = %e, "Failed to start service");
            return Err(e.into());
        }

        instance.status = InstanceStatus::Running;
        instance.start_time = Some(Utc::now());
        self.registry.register_instance(instance.clone()).await;
        drop(admission);

        self.supervisor.spawn_monitor(instance.id);
        self.attach_capabilities(&instance, &definition);

        info!(
            instance_id = %instance.id,
            service = %name,
            node_id = %node_id,
            pid = ?instance.pid,
            endpoint = ?instance.endpoint,
            "Service started"
        );
        Ok(instance)
    }

    /// Stops one instance of `name`, or all of them.
    ///
    /// Returns whether anything was stopped. An instance id that belongs to
    /// another service is reported as not found.
    pub async fn stop_service(
        &self,
        name: &str,
        instance_id: Option<InstanceId>,
        force: bool,
    ) -> Result<bool> {
        let targets = match instance_id {
            Some(id) => {
                let instance = self
                    .registry
                    .get_instance(&id)
                    .await
                    .filter(|i| i.name == name)
                    .ok_or(ServiceError::InstanceNotFound(id))?;
                vec![instance]
            }
            None => self.registry.instances_by_name(name).await,
        };

        let mut stopped = 0;
        let mut last_error = None;
        for instance in targets {
            if instance.status.is_terminal() && !self.supervisor.is_tracked(&instance.id) {
                continue;
            }
            self.cancel_bound_tasks(&instance.id);
            match self.supervisor.stop(&instance.id, force).await {
                Ok(true) => stopped += 1,
                Ok(false) => debug!(instance_id = %instance.id, "Instance had no live process"),
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Failed to stop instance");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if stopped == 0 => Err(e.into()),
            _ => {
                info!(service = %name, stopped, "Stop service completed");
                Ok(stopped > 0)
            }
        }
    }

    /// Stops an instance and starts a fresh one of the same service.
    ///
    /// Without `new_config` the old effective config, including its port, is
    /// reused.
    pub async fn restart_service(
        &self,
        instance_id: InstanceId,
        new_config: Option<ConfigMap>,
    ) -> Result<ServiceInstance> {
        let current = self
            .registry
            .get_instance(&instance_id)
            .await
            .ok_or(ServiceError::InstanceNotFound(instance_id))?;

        info!(instance_id = %instance_id, service = %current.name, "Restarting instance");
        self.stop_service(&current.name, Some(instance_id), false).await?;

        let options = StartOptions {
            config: new_config.unwrap_or(current.config),
            node_id: None,
            auto_discover: false,
        };
        self.start_service(&current.name, options).await
    }

    // ===== Tasks =====

    pub fn schedule_task(&self, task: ScheduledTask) -> Result<()> {
        Ok(self.tasks.schedule(task)?)
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.tasks.cancel(task_id)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.tasks()
    }

    fn attach_capabilities(&self, instance: &ServiceInstance, definition: &ServiceDefinition) {
        let mut bound = Vec::new();
        for capability in &definition.capabilities {
            let task_id = format!("{}.{}@{}", definition.name, capability.name, instance.id);
            let command = capability_command(capability, instance);
            match capability.kind {
                CapabilityKind::Background => {
                    spawn_background(task_id, command);
                }
                CapabilityKind::Scheduled => {
                    // Validated at registration; a definition without a
                    // trigger here was constructed by hand.
                    let trigger = match capability.parsed_trigger() {
                        Ok(Some(trigger)) => trigger,
                        Ok(None) => {
                            warn!(task_id = %task_id, "Scheduled capability has no trigger");
                            continue;
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Scheduled capability has an invalid trigger");
                            continue;
                        }
                    };
                    let body = Arc::new(InstanceBoundTask {
                        instance_id: instance.id,
                        registry: Arc::clone(&self.registry),
                        tasks: Arc::downgrade(&self.tasks),
                        inner: command,
                    });
                    let mut task = ScheduledTask::new(task_id.clone(), trigger, body)
                        .immediate(capability.immediate)
                        .bound_to(instance.id);
                    if let Some(times) = capability.times {
                        task = task.times(times);
                    }
                    match self.tasks.schedule(task) {
                        Ok(()) => bound.push(task_id),
                        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to schedule capability"),
                    }
                }
            }
        }
        if !bound.is_empty() {
            self.bound().insert(instance.id, bound);
        }
    }

    fn cancel_bound_tasks(&self, instance_id: &InstanceId) {
        let Some(task_ids) = self.bound().remove(instance_id) else {
            return;
        };
        for task_id in task_ids {
            self.tasks.cancel(&task_id);
        }
    }

    // ===== Status =====

    pub async fn get_status(&self, name: &str) -> StatusSummary {
        self.registry.service_summary(name).await
    }

    pub async fn summary(&self) -> StatusSummary {
        self.registry.summary().await
    }

    /// Instances oldest first, optionally only those in `status`.
    pub async fn list_instances(&self, status: Option<InstanceStatus>) -> Vec<ServiceInstance> {
        let mut instances = self.registry.all_instances().await;
        if let Some(status) = status {
            instances.retain(|i| i.status == status);
        }
        instances
    }

    pub async fn get_instance(&self, instance_id: &InstanceId) -> Option<ServiceInstance> {
        self.registry.get_instance(instance_id).await
    }

    pub fn node_status(&self, node_id: &str) -> Result<NodeStatus> {
        Ok(self.placement.node_status(node_id)?)
    }

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.placement.nodes()
    }
}

/// First free port on 127.0.0.1 in the scan range, else [`FALLBACK_PORT`].
///
/// The port is not held; another process may take it before launch.
pub fn find_available_port() -> u16 {
    (PORT_RANGE_START..=PORT_RANGE_END)
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .unwrap_or(FALLBACK_PORT)
}

fn instance_metadata(definition: &ServiceDefinition, node: &NodeStatus) -> ConfigMap {
    let mut metadata = definition.metadata.clone();
    metadata.insert("version".to_string(), json!(definition.version));
    metadata.insert("description".to_string(), json!(definition.description));
    metadata.insert("scheduled_at".to_string(), json!(Utc::now().to_rfc3339()));
    metadata.insert(
        "node_info".to_string(),
        json!({ "host": node.host, "type": node.kind }),
    );
    metadata
}

fn capability_command(capability: &Capability, instance: &ServiceInstance) -> CommandTask {
    let command =
        CommandTask::new(capability.entry_point.argv()).env(INSTANCE_ID_ENV, instance.id.to_string());
    match &instance.log_file {
        Some(path) => command.log_to(path.clone()),
        None => command,
    }
}

fn spawn_background(task_id: String, command: CommandTask) {
    tokio::spawn(async move {
        let ctx = TaskContext {
            task_id,
            run_id: RunId::new(),
            fired_at: Utc::now(),
        };
        debug!(task_id = %ctx.task_id, run_id = %ctx.run_id, "Background capability started");
        match command.run(&ctx).await {
            Ok(()) => debug!(task_id = %ctx.task_id, "Background capability finished"),
            Err(e) => warn!(task_id = %ctx.task_id, error = %e, "Background capability failed"),
        }
    });
}

/// Runs a capability only while its instance is running; cancels itself
/// otherwise.
struct InstanceBoundTask {
    instance_id: InstanceId,
    registry: Arc<InstanceRegistry>,
    tasks: Weak<TaskScheduler>,
    inner: CommandTask,
}

#[async_trait]
impl TaskBody for InstanceBoundTask {
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let running = self
            .registry
            .get_instance(&self.instance_id)
            .await
            .is_some_and(|i| i.status == InstanceStatus::Running);
        if !running {
            info!(
                task_id = %ctx.task_id,
                instance_id = %self.instance_id,
                "Instance no longer running, cancelling bound task"
            );
            if let Some(tasks) = self.tasks.upgrade() {
                tasks.cancel(&ctx.task_id);
            }
            return Ok(());
        }
        self.inner.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{Error, ValidationError};
    use crate::tasks::Trigger;

    fn manager() -> ServiceManager {
        ServiceManager::from_config(&Config::default())
    }

    #[test]
    fn test_scanned_port_is_in_range_or_fallback() {
        let port = find_available_port();
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port) || port == FALLBACK_PORT);
    }

    #[test]
    fn test_start_options_defaults() {
        let options = StartOptions::default();
        assert!(options.auto_discover);
        assert!(options.config.is_empty());
        assert!(options.node_id.is_none());

        let options = options.with_value("port", 9100).on_node("local").without_discovery();
        assert_eq!(options.config.get("port"), Some(&json!(9100)));
        assert_eq!(options.node_id.as_deref(), Some("local"));
        assert!(!options.auto_discover);
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected_first() {
        let manager = manager();
        let err = manager
            .start_service("a!", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::InvalidServiceName { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregistered_service_without_discovery() {
        let manager = manager();
        let err = manager
            .start_service("web-1", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Service(ServiceError::NotRegistered(ref n)) if n == "web-1"));
        assert_eq!(err.error_code(), 3001);
    }

    #[tokio::test]
    async fn test_stop_unknown_service_returns_false() {
        let manager = manager();
        assert!(!manager.stop_service("web-1", None, false).await.unwrap());

        let missing = InstanceId::new();
        let err = manager
            .stop_service("web-1", Some(missing), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Service(ServiceError::InstanceNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_bound_task_cancels_itself_when_instance_is_gone() {
        let manager = manager();
        let instance_id = InstanceId::new();
        let body = Arc::new(InstanceBoundTask {
            instance_id,
            registry: Arc::clone(manager.registry()),
            tasks: Arc::downgrade(manager.task_scheduler()),
            inner: CommandTask::new(vec!["true".to_string()]),
        });
        let task = ScheduledTask::new("web-1.tick", Trigger::every(Duration::from_secs(60)), body.clone())
            .bound_to(instance_id);
        manager.schedule_task(task).unwrap();
        assert_eq!(manager.tasks().len(), 1);

        let ctx = TaskContext {
            task_id: "web-1.tick".to_string(),
            run_id: RunId::new(),
            fired_at: Utc::now(),
        };
        body.run(&ctx).await.unwrap();
        assert!(manager.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_loops() {
        let manager = manager();
        manager.start();
        assert!(manager.task_scheduler().is_running());
        assert_eq!(manager.shutdown().await, 0);
        assert!(!manager.task_scheduler().is_running());
    }
}
