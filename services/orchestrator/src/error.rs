//! Error types for the orchestration engine.
//!
//! Each component owns an error enum with its own `Result` alias. [`Error`]
//! composes them for callers of the [`ServiceManager`](crate::ServiceManager).
//! Every variant carries a stable numeric code and a reason string so the
//! management surface can report failures without matching on messages.

use sfw_id::InstanceId;
use thiserror::Error;

use crate::instance::InstanceStatus;

// ===== Validation =====

/// Malformed input rejected before anything is committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid service name '{name}': {reason}")]
    InvalidServiceName { name: String, reason: &'static str },

    #[error("invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    /// Not exactly one of interval, cron or at_time.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid at_time '{0}': expected HH:MM")]
    InvalidAtTime(String),

    #[error("unsupported cron expression '{0}': expected 'MIN HOUR * * *'")]
    UnsupportedCron(String),

    #[error("unknown placement strategy '{0}'")]
    InvalidStrategy(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

// ===== Service lifecycle =====

#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("service '{0}' is not registered")]
    NotRegistered(String),

    #[error("service '{name}' already running ({running} of max {max} instances)")]
    AlreadyRunning {
        name: String,
        running: usize,
        max: u32,
    },

    #[error("failed to start '{name}' (exit code {exit_code:?}): {detail}")]
    StartFailed {
        name: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("failed to stop {instance_id}: {detail}")]
    StopFailed {
        instance_id: InstanceId,
        detail: String,
    },

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ===== Placement =====

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("node '{0}' does not exist")]
    NodeNotFound(String),

    #[error("no available node for service '{service}'")]
    NoAvailableNode { service: String },

    #[error("node '{0}' already exists")]
    NodeExists(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

// ===== Registry =====

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance {0} is not registered")]
    InstanceNotFound(InstanceId),

    #[error("instance {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

// ===== Composite =====

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl ValidationError {
    pub fn error_code(&self) -> u16 {
        match self {
            ValidationError::InvalidServiceName { .. } => 2001,
            ValidationError::InvalidDefinition { .. } => 2002,
            ValidationError::InvalidTrigger(_) => 2003,
            ValidationError::InvalidAtTime(_) => 2004,
            ValidationError::UnsupportedCron(_) => 2005,
            ValidationError::InvalidStrategy(_) => 2006,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::InvalidServiceName { .. } => "invalid_service_name",
            ValidationError::InvalidDefinition { .. } => "invalid_definition",
            ValidationError::InvalidTrigger(_) => "invalid_trigger",
            ValidationError::InvalidAtTime(_) => "invalid_at_time",
            ValidationError::UnsupportedCron(_) => "unsupported_cron",
            ValidationError::InvalidStrategy(_) => "invalid_strategy",
        }
    }
}

impl ServiceError {
    pub fn error_code(&self) -> u16 {
        match self {
            ServiceError::NotRegistered(_) => 3001,
            ServiceError::InstanceNotFound(_) => 3002,
            ServiceError::AlreadyRunning { .. } => 3003,
            ServiceError::StartFailed { .. } => 3004,
            ServiceError::StopFailed { .. } => 3005,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ServiceError::NotRegistered(_) => "service_not_registered",
            ServiceError::InstanceNotFound(_) => "instance_not_found",
            ServiceError::AlreadyRunning { .. } => "service_already_running",
            ServiceError::StartFailed { .. } => "service_start_failed",
            ServiceError::StopFailed { .. } => "service_stop_failed",
        }
    }
}

impl SchedulerError {
    pub fn error_code(&self) -> u16 {
        match self {
            SchedulerError::NoAvailableNode { .. } => 6001,
            SchedulerError::NodeNotFound(_) => 6002,
            SchedulerError::NodeExists(_) => 6003,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            SchedulerError::NoAvailableNode { .. } => "no_available_node",
            SchedulerError::NodeNotFound(_) => "node_not_found",
            SchedulerError::NodeExists(_) => "node_exists",
        }
    }
}

impl RegistryError {
    pub fn error_code(&self) -> u16 {
        match self {
            RegistryError::InstanceNotFound(_) => 4002,
            RegistryError::InvalidTransition { .. } => 4003,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            RegistryError::InstanceNotFound(_) => "registry_instance_not_found",
            RegistryError::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

impl Error {
    /// Stable numeric code: 2xxx validation, 3xxx service, 4xxx registry,
    /// 6xxx placement.
    pub fn error_code(&self) -> u16 {
        match self {
            Error::Validation(e) => e.error_code(),
            Error::Service(e) => e.error_code(),
            Error::Scheduler(e) => e.error_code(),
            Error::Registry(e) => e.error_code(),
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Validation(e) => e.reason_code(),
            Error::Service(e) => e.reason_code(),
            Error::Scheduler(e) => e.reason_code(),
            Error::Registry(e) => e.reason_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_is_transparent() {
        let err: Error = SchedulerError::NoAvailableNode {
            service: "web-1".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "no available node for service 'web-1'");
        assert_eq!(err.error_code(), 6001);
        assert_eq!(err.reason_code(), "no_available_node");
    }

    #[test]
    fn test_codes_fall_in_their_ranges() {
        let validation: Error = ValidationError::InvalidAtTime("25:00".into()).into();
        let service: Error = ServiceError::NotRegistered("api".into()).into();
        let registry: Error = RegistryError::InstanceNotFound(InstanceId::new()).into();
        assert_eq!(validation.error_code() / 1000, 2);
        assert_eq!(service.error_code(), 3001);
        assert_eq!(registry.error_code() / 1000, 4);
    }

    #[test]
    fn test_start_failure_message_carries_detail() {
        let err = ServiceError::StartFailed {
            name: "worker".into(),
            exit_code: Some(3),
            detail: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker"));
        assert!(msg.contains("Some(3)"));
        assert!(msg.contains("boom"));
    }
}
