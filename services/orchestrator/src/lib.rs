//! sfw orchestration engine
//!
//! Registers service definitions, places instances onto resource-constrained
//! nodes, supervises their processes and runs recurring tasks against them.
//!
//! ## Architecture
//!
//! - **Task Scheduler**: Min-heap executor for interval, cron and daily tasks
//! - **Placement Scheduler**: Node resource ledger plus a selection strategy
//! - **Instance Registry**: Instance state machine and heartbeat failure detector
//! - **Process Supervisor**: Launches, monitors and terminates OS processes
//! - **Service Manager**: Composes the above into start/stop/restart/status

pub mod config;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod manager;
pub mod placement;
pub mod registry;
pub mod supervisor;
pub mod tasks;

pub use config::Config;
pub use definition::{Capability, CapabilityKind, ConfigMap, EntryPoint, Resources, ServiceDefinition};
pub use discovery::{CatalogDiscovery, ServiceDiscovery};
pub use error::{Error, RegistryError, Result, SchedulerError, ServiceError, ValidationError};
pub use instance::{InstanceRecord, InstanceStatus, ServiceInstance, StatusSummary};
pub use manager::{ServiceManager, StartOptions};
pub use placement::{NodeAttributes, NodeStatus, PlacementScheduler, Strategy};
pub use registry::InstanceRegistry;
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
pub use tasks::{ScheduledTask, TaskScheduler, Trigger, TriggerSpec};

pub use sfw_id::{InstanceId, RunId};
