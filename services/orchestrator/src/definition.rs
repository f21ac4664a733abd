//! Service definitions and their validation.
//!
//! A [`ServiceDefinition`] is the immutable description of a runnable
//! service. It is validated once when registered and shared as
//! `Arc<ServiceDefinition>` afterwards.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ValidationError, ValidationResult};
use crate::tasks::{Trigger, TriggerSpec};

/// String-keyed, JSON-valued configuration mapping.
pub type ConfigMap = serde_json::Map<String, Value>;

pub const DEFAULT_VERSION: &str = "1.0.0";

/// What to execute for an instance or a capability.
///
/// A plain string is split on whitespace. An array is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryPoint {
    Command(String),
    Argv(Vec<String>),
}

impl EntryPoint {
    pub fn argv(&self) -> Vec<String> {
        match self {
            EntryPoint::Command(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
            EntryPoint::Argv(argv) => argv.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EntryPoint::Command(cmd) => cmd.trim().is_empty(),
            EntryPoint::Argv(argv) => argv.first().is_none_or(|p| p.trim().is_empty()),
        }
    }
}

impl From<&str> for EntryPoint {
    fn from(cmd: &str) -> Self {
        EntryPoint::Command(cmd.to_string())
    }
}

impl From<Vec<String>> for EntryPoint {
    fn from(argv: Vec<String>) -> Self {
        EntryPoint::Argv(argv)
    }
}

/// Resource requirements of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub gpu_count: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            disk_mb: 1024,
            gpu_count: 0,
        }
    }
}

impl Resources {
    pub fn new(cpu_cores: f64, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Run once alongside each new instance.
    Background,
    /// Run on a trigger while the instance is running.
    Scheduled,
}

/// Work a service declares next to its main process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub kind: CapabilityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
    pub entry_point: EntryPoint,
    /// Run limit for scheduled capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times: Option<u64>,
    #[serde(default)]
    pub immediate: bool,
}

impl Capability {
    pub fn background(name: impl Into<String>, entry_point: impl Into<EntryPoint>) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Background,
            trigger: None,
            entry_point: entry_point.into(),
            times: None,
            immediate: false,
        }
    }

    pub fn scheduled(
        name: impl Into<String>,
        trigger: TriggerSpec,
        entry_point: impl Into<EntryPoint>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Scheduled,
            trigger: Some(trigger),
            entry_point: entry_point.into(),
            times: None,
            immediate: false,
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

    /// Parsed trigger of a scheduled capability.
    pub fn parsed_trigger(&self) -> ValidationResult<Option<Trigger>> {
        self.trigger.as_ref().map(Trigger::from_spec).transpose()
    }
}

/// Immutable description of a runnable service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub entry_point: EntryPoint,
    /// Names of services this one expects; informational only.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    /// Every label must be present with an equal value on the chosen node.
    #[serde(default)]
    pub node_labels: BTreeMap<String, String>,
    /// Maximum concurrently running instances; 0 means unlimited.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Merged underneath the config supplied at start.
    #[serde(default)]
    pub default_config: ConfigMap,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: ConfigMap,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_max_instances() -> u32 {
    1
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, entry_point: impl Into<EntryPoint>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            entry_point: entry_point.into(),
            dependencies: Vec::new(),
            resources: Resources::default(),
            node_labels: BTreeMap::new(),
            max_instances: default_max_instances(),
            default_config: ConfigMap::new(),
            capabilities: Vec::new(),
            metadata: ConfigMap::new(),
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_config.insert(key.into(), value.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Kind of workload, taken from `metadata.type`.
    pub fn service_type(&self) -> &str {
        self.metadata
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("process")
    }

    /// Checks everything that can be checked without launching.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_service_name(&self.name)?;

        let invalid = |reason: String| ValidationError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        let cpu = self.resources.cpu_cores;
        if !cpu.is_finite() || cpu < 0.0 {
            return Err(invalid(format!("cpu_cores must be a non-negative number, got {cpu}")));
        }
        if cpu > 0.0 && cpu < 0.001 {
            return Err(invalid(format!("cpu_cores below one millicore, got {cpu}")));
        }
        if self.entry_point.is_empty() {
            return Err(invalid("entry_point is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for capability in &self.capabilities {
            if capability.name.trim().is_empty() {
                return Err(invalid("capability with empty name".to_string()));
            }
            if !seen.insert(capability.name.as_str()) {
                return Err(invalid(format!("duplicate capability '{}'", capability.name)));
            }
            if capability.entry_point.is_empty() {
                return Err(invalid(format!(
                    "capability '{}' has an empty entry_point",
                    capability.name
                )));
            }
            match (capability.kind, &capability.trigger) {
                (CapabilityKind::Scheduled, None) => {
                    return Err(ValidationError::InvalidTrigger(format!(
                        "scheduled capability '{}' has no trigger",
                        capability.name
                    )));
                }
                (CapabilityKind::Background, Some(_)) => {
                    return Err(ValidationError::InvalidTrigger(format!(
                        "background capability '{}' cannot carry a trigger",
                        capability.name
                    )));
                }
                _ => {}
            }
            capability.parsed_trigger()?;
        }

        Ok(())
    }
}

/// Service names are at least three characters of `[A-Za-z0-9_-]`.
pub fn validate_service_name(name: &str) -> ValidationResult<()> {
    let reject = |reason| {
        Err(ValidationError::InvalidServiceName {
            name: name.to_string(),
            reason,
        })
    };

    if name.trim().is_empty() {
        return reject("name cannot be empty");
    }
    if name.chars().count() < 3 {
        return reject("name must be at least 3 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return reject("name may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}

/// Deep-merges `overlay` onto `base`. Nested objects merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_config(base: &ConfigMap, overlay: &ConfigMap) -> ConfigMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = merge_config(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
