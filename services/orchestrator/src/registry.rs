//! Authoritative in-memory registry of definitions and instances.
//!
//! The registry also owns heartbeat bookkeeping. A background checker marks
//! running instances that stopped heartbeating as errored; they stay
//! queryable afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sfw_id::InstanceId;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::definition::ServiceDefinition;
use crate::error::{RegistryError, RegistryResult, ValidationResult};
use crate::instance::{InstanceStatus, ServiceInstance, StatusSummary, StatusUpdate};

/// Instances missing this many heartbeat intervals are considered dead.
pub const HEARTBEAT_TIMEOUT_FACTOR: u32 = 3;

/// Shortest heartbeat interval; shorter ones are raised to this.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct RegistryState {
    definitions: HashMap<String, Arc<ServiceDefinition>>,
    instances: HashMap<InstanceId, ServiceInstance>,
    by_service: HashMap<String, BTreeSet<InstanceId>>,
    heartbeats: HashMap<InstanceId, Instant>,
}

pub struct InstanceRegistry {
    state: RwLock<RegistryState>,
    heartbeat_interval: Duration,
}

impl InstanceRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        if heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                requested = ?heartbeat_interval,
                minimum = ?MIN_HEARTBEAT_INTERVAL,
                "Heartbeat interval too short, using minimum"
            );
        }
        let heartbeat_interval = heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        Self {
            state: RwLock::new(RegistryState::default()),
            heartbeat_interval,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * HEARTBEAT_TIMEOUT_FACTOR
    }

    // ===== Definitions =====

    /// Validates and stores a definition, replacing one with the same name.
    pub async fn register_definition(
        &self,
        definition: ServiceDefinition,
    ) -> ValidationResult<Arc<ServiceDefinition>> {
        definition.validate()?;
        let definition = Arc::new(definition);

        let mut state = self.state.write().await;
        let replaced = state
            .definitions
            .insert(definition.name.clone(), Arc::clone(&definition));
        if replaced.is_some() {
            warn!(service = %definition.name, "Service definition replaced");
        } else {
            info!(
                service = %definition.name,
                version = %definition.version,
                "Registered service definition"
            );
        }
        Ok(definition)
    }

    pub async fn get_definition(&self, name: &str) -> Option<Arc<ServiceDefinition>> {
        self.state.read().await.definitions.get(name).cloned()
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.state.read().await.definitions.contains_key(name)
    }

    /// All definitions, sorted by name.
    pub async fn definitions(&self) -> Vec<Arc<ServiceDefinition>> {
        let state = self.state.read().await;
        let mut defs: Vec<_> = state.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    // ===== Instances =====

    /// Stores an instance. Running instances start with a fresh heartbeat.
    pub async fn register_instance(&self, instance: ServiceInstance) {
        let mut state = self.state.write().await;
        let id = instance.id;
        if instance.status == InstanceStatus::Running {
            state.heartbeats.insert(id, Instant::now());
        }
        state
            .by_service
            .entry(instance.name.clone())
            .or_default()
            .insert(id);
        info!(instance_id = %id, service = %instance.name, status = %instance.status, "Registered instance");
        state.instances.insert(id, instance);
    }

    /// Removes an instance and everything indexed by it.
    pub async fn deregister_instance(&self, id: &InstanceId) -> Option<ServiceInstance> {
        let mut state = self.state.write().await;
        let instance = state.instances.remove(id)?;
        state.heartbeats.remove(id);
        if let Some(ids) = state.by_service.get_mut(&instance.name) {
            ids.remove(id);
            if ids.is_empty() {
                state.by_service.remove(&instance.name);
            }
        }
        info!(instance_id = %id, service = %instance.name, "Deregistered instance");
        Some(instance)
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Option<ServiceInstance> {
        self.state.read().await.instances.get(id).cloned()
    }

    /// Instances of one service, oldest first.
    pub async fn instances_by_name(&self, name: &str) -> Vec<ServiceInstance> {
        let state = self.state.read().await;
        state
            .by_service
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect()
    }

    pub async fn running_count(&self, name: &str) -> usize {
        self.instances_by_name(name)
            .await
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count()
    }

    /// Every instance, oldest first.
    pub async fn all_instances(&self) -> Vec<ServiceInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<_> = state.instances.values().cloned().collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// Records a heartbeat. Returns false for unknown or terminal instances.
    pub async fn update_heartbeat(&self, id: &InstanceId) -> bool {
        let mut state = self.state.write().await;
        match state.instances.get(id) {
            Some(instance) if !instance.status.is_terminal() => {
                state.heartbeats.insert(*id, Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Applies `update` atomically, enforcing the status state machine.
    ///
    /// Entering a terminal status drops the heartbeat entry and stamps
    /// `stop_time` when the update carries none. Setting the current status
    /// again only applies the field changes.
    pub async fn update_status(
        &self,
        id: &InstanceId,
        update: StatusUpdate,
    ) -> RegistryResult<ServiceInstance> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(id)
            .ok_or(RegistryError::InstanceNotFound(*id))?;

        let previous = instance.status;
        if let Some(next) = update.status {
            if next != previous && !previous.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    id: *id,
                    from: previous,
                    to: next,
                });
            }
            instance.status = next;
        }
        if let Some(pid) = update.pid {
            instance.pid = Some(pid);
        }
        if let Some(endpoint) = update.endpoint {
            instance.endpoint = Some(endpoint);
        }
        if let Some(start) = update.start_time {
            instance.start_time = Some(start);
        }
        if let Some(stop) = update.stop_time {
            instance.stop_time = Some(stop);
        }
        if let Some(code) = update.exit_code {
            instance.exit_code = Some(code);
        }

        let status = instance.status;
        if status.is_terminal() && instance.stop_time.is_none() {
            instance.stop_time = Some(Utc::now());
        }
        let snapshot = instance.clone();

        if status.is_terminal() {
            state.heartbeats.remove(id);
        } else if status == InstanceStatus::Running && previous != InstanceStatus::Running {
            state.heartbeats.insert(*id, Instant::now());
        }

        if status != previous {
            info!(instance_id = %id, from = %previous, to = %status, "Instance status changed");
        }
        Ok(snapshot)
    }

    // ===== Heartbeats =====

    /// Marks every running instance silent for longer than the timeout as
    /// errored and forgets its heartbeat. Returns the affected ids.
    pub async fn check_heartbeats_at(&self, now: Instant) -> Vec<InstanceId> {
        let timeout = self.heartbeat_timeout();
        let mut state = self.state.write().await;

        let expired: Vec<InstanceId> = state
            .heartbeats
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut failed = Vec::new();
        for id in expired {
            state.heartbeats.remove(&id);
            let Some(instance) = state.instances.get_mut(&id) else {
                continue;
            };
            if instance.status != InstanceStatus::Running {
                continue;
            }
            instance.status = InstanceStatus::Error;
            instance.stop_time = Some(Utc::now());
            warn!(
                instance_id = %id,
                service = %instance.name,
                timeout_secs = timeout.as_secs(),
                "Heartbeat timed out, instance marked as error"
            );
            failed.push(id);
        }
        failed
    }

    /// Runs the heartbeat checker until `shutdown` flips to true.
    pub async fn run_heartbeat_checker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.heartbeat_interval.as_secs_f64(),
            timeout_secs = self.heartbeat_timeout().as_secs_f64(),
            "Starting heartbeat checker"
        );

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // A panic inside one pass must not end the checker.
                    let registry = Arc::clone(&self);
                    let pass = tokio::spawn(async move {
                        registry.check_heartbeats_at(Instant::now()).await
                    });
                    match pass.await {
                        Ok(failed) if !failed.is_empty() => {
                            debug!(count = failed.len(), "Heartbeat pass degraded instances");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Heartbeat pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    // ===== Summary =====

    pub async fn summary(&self) -> StatusSummary {
        let instances = self.all_instances().await;
        StatusSummary::collect(None, &instances)
    }

    pub async fn service_summary(&self, name: &str) -> StatusSummary {
        let instances = self.instances_by_name(name).await;
        StatusSummary::collect(Some(name.to_string()), &instances)
    }

    /// Forgets everything.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = RegistryState::default();
        info!("Registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ConfigMap, Resources};
    use crate::error::ValidationError;

    fn registry() -> InstanceRegistry {
        InstanceRegistry::new(Duration::from_secs(30))
    }

    fn running(name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(name, ConfigMap::new());
        instance.status = InstanceStatus::Running;
        instance.start_time = Some(Utc::now());
        instance
    }

    #[tokio::test]
    async fn test_register_definition_validates_and_replaces() {
        let registry = registry();
        let err = registry
            .register_definition(ServiceDefinition::new("x", "run"))
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidServiceName { .. }));

        registry
            .register_definition(ServiceDefinition::new("web-1", "run"))
            .await
            .unwrap();
        registry
            .register_definition(
                ServiceDefinition::new("web-1", "run").with_resources(Resources::new(2.0, 64)),
            )
            .await
            .unwrap();

        let def = registry.get_definition("web-1").await.unwrap();
        assert_eq!(def.resources.cpu_cores, 2.0);
        assert_eq!(registry.definitions().await.len(), 1);
        assert!(!registry.is_registered("web-2").await);
    }

    #[tokio::test]
    async fn test_instances_are_indexed_by_name() {
        let registry = registry();
        let a = running("web-1");
        let b = running("web-1");
        let c = running("worker");
        let (a_id, b_id) = (a.id, b.id);
        registry.register_instance(a).await;
        registry.register_instance(b).await;
        registry.register_instance(c).await;

        let web: Vec<_> = registry.instances_by_name("web-1").await.iter().map(|i| i.id).collect();
        assert_eq!(web, vec![a_id, b_id]);
        assert_eq!(registry.all_instances().await.len(), 3);

        registry.deregister_instance(&a_id).await.unwrap();
        assert_eq!(registry.instances_by_name("web-1").await.len(), 1);
        assert!(registry.deregister_instance(&a_id).await.is_none());
        assert!(registry.get_instance(&a_id).await.is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_are_enforced() {
        let registry = registry();
        let instance = running("web-1");
        let id = instance.id;
        registry.register_instance(instance).await;

        let stopped = registry
            .update_status(&id, StatusUpdate::to(InstanceStatus::Stopped).exit_code(0))
            .await
            .unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.exit_code, Some(0));
        assert!(stopped.stop_time.is_some());

        let err = registry
            .update_status(&id, StatusUpdate::to(InstanceStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                id,
                from: InstanceStatus::Stopped,
                to: InstanceStatus::Running,
            }
        );

        let missing = InstanceId::new();
        assert_eq!(
            registry
                .update_status(&missing, StatusUpdate::to(InstanceStatus::Error))
                .await
                .unwrap_err(),
            RegistryError::InstanceNotFound(missing)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_refused_for_terminal_instances() {
        let registry = registry();
        let instance = running("web-1");
        let id = instance.id;
        registry.register_instance(instance).await;
        assert!(registry.update_heartbeat(&id).await);

        registry
            .update_status(&id, StatusUpdate::to(InstanceStatus::Error))
            .await
            .unwrap();
        assert!(!registry.update_heartbeat(&id).await);
        assert!(!registry.update_heartbeat(&InstanceId::new()).await);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_fires_exactly_once() {
        let registry = registry();
        let stale = running("web-1");
        let fresh = running("web-1");
        let (stale_id, fresh_id) = (stale.id, fresh.id);
        registry.register_instance(stale).await;
        registry.register_instance(fresh).await;

        let later = Instant::now() + Duration::from_secs(91);
        // Keep one instance alive by refreshing it "at" the later instant.
        registry.state.write().await.heartbeats.insert(fresh_id, later);

        assert!(registry.check_heartbeats_at(Instant::now()).await.is_empty());

        let failed = registry.check_heartbeats_at(later).await;
        assert_eq!(failed, vec![stale_id]);
        let instance = registry.get_instance(&stale_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        assert!(instance.stop_time.is_some());

        // Already degraded and no longer tracked.
        let much_later = later + Duration::from_secs(10);
        assert!(registry.check_heartbeats_at(much_later).await.is_empty());
        assert_eq!(
            registry.get_instance(&fresh_id).await.unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn test_heartbeat_exactly_at_timeout_is_not_expired() {
        let registry = registry();
        let instance = running("web-1");
        let id = instance.id;
        let beat = Instant::now();
        registry.register_instance(instance).await;
        registry.state.write().await.heartbeats.insert(id, beat);

        assert!(registry
            .check_heartbeats_at(beat + Duration::from_secs(90))
            .await
            .is_empty());
        assert_eq!(
            registry
                .check_heartbeats_at(beat + Duration::from_secs(90) + Duration::from_millis(1))
                .await,
            vec![id]
        );
    }

    #[tokio::test]
    async fn test_checker_loop_degrades_silent_instance() {
        let registry = Arc::new(InstanceRegistry::new(Duration::from_millis(50)));
        let instance = running("web-1");
        let id = instance.id;
        registry.register_instance(instance).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let checker = tokio::spawn(Arc::clone(&registry).run_heartbeat_checker(shutdown_rx));

        let mut degraded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if registry.get_instance(&id).await.unwrap().status == InstanceStatus::Error {
                degraded = true;
                break;
            }
        }
        assert!(degraded);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), checker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_heartbeat_interval_is_raised_to_minimum() {
        let registry = Arc::new(InstanceRegistry::new(Duration::ZERO));
        assert_eq!(registry.heartbeat_interval(), MIN_HEARTBEAT_INTERVAL);
        assert_eq!(registry.heartbeat_timeout(), MIN_HEARTBEAT_INTERVAL * 3);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let checker = tokio::spawn(Arc::clone(&registry).run_heartbeat_checker(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), checker)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_summary_and_clear() {
        let registry = registry();
        registry.register_instance(running("web-1")).await;
        registry.register_instance(running("worker")).await;
        registry
            .register_definition(ServiceDefinition::new("web-1", "run"))
            .await
            .unwrap();

        let summary = registry.summary().await;
        assert_eq!(summary.total_instances, 2);
        assert_eq!(summary.running, 2);
        assert_eq!(registry.service_summary("web-1").await.total_instances, 1);

        registry.clear().await;
        assert!(registry.all_instances().await.is_empty());
        assert!(registry.definitions().await.is_empty());
    }
}
