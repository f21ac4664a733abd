//! Nodes and their resource ledgers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::Resources;

/// Node kind that launches instances on this host.
pub const LOCAL_KIND: &str = "local";

/// Id of the node seeded by [`PlacementScheduler::with_local_node`](super::PlacementScheduler::with_local_node).
pub const LOCAL_NODE_ID: &str = "local";

/// Exact resource amounts. CPU is held in millicores so allocate followed by
/// release restores the ledger bit for bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub gpu_count: u32,
}

impl ResourceVector {
    /// Negative or non-finite cpu values count as zero. Any positive value
    /// holds at least one millicore.
    pub fn from_resources(resources: &Resources) -> Self {
        let cpu = resources.cpu_cores;
        let cpu_millis = if cpu.is_finite() && cpu > 0.0 {
            ((cpu * 1000.0).round() as u64).max(1)
        } else {
            0
        };
        Self {
            cpu_millis,
            memory_mb: resources.memory_mb,
            disk_mb: resources.disk_mb,
            gpu_count: resources.gpu_count,
        }
    }

    pub fn to_resources(self) -> Resources {
        Resources {
            cpu_cores: self.cpu_millis as f64 / 1000.0,
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
            gpu_count: self.gpu_count,
        }
    }

    /// True when every component of `self` is at most `other`'s.
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_mb <= other.memory_mb
            && self.disk_mb <= other.disk_mb
            && self.gpu_count <= other.gpu_count
    }

    pub fn saturating_add(&self, other: &ResourceVector) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            gpu_count: self.gpu_count.saturating_add(other.gpu_count),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }
}

impl From<&Resources> for ResourceVector {
    fn from(resources: &Resources) -> Self {
        Self::from_resources(resources)
    }
}

/// Attributes supplied when adding a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub host: String,
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub capacity: Resources,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl NodeAttributes {
    pub fn new(host: impl Into<String>, kind: impl Into<String>, capacity: Resources) -> Self {
        Self {
            host: host.into(),
            kind: kind.into(),
            labels: BTreeMap::new(),
            capacity,
            available: true,
        }
    }

    /// This host: 8 cores, 16 GiB memory, 100 GiB disk, no GPU.
    pub fn local() -> Self {
        Self::new(
            "localhost",
            LOCAL_KIND,
            Resources {
                cpu_cores: 8.0,
                memory_mb: 16_384,
                disk_mb: 102_400,
                gpu_count: 0,
            },
        )
        .with_label("os", "linux")
        .with_label("env", "development")
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// A placement target and its ledger.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub kind: String,
    pub available: bool,
    pub labels: BTreeMap<String, String>,
    pub total: ResourceVector,
    pub used: ResourceVector,
    pub last_updated: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>, attrs: NodeAttributes) -> Self {
        Self {
            id: id.into(),
            host: attrs.host,
            kind: attrs.kind,
            available: attrs.available,
            labels: attrs.labels,
            total: ResourceVector::from_resources(&attrs.capacity),
            used: ResourceVector::default(),
            last_updated: Utc::now(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == LOCAL_KIND
    }

    pub fn headroom(&self) -> ResourceVector {
        self.total.saturating_sub(&self.used)
    }

    pub fn labels_match(&self, required: &BTreeMap<String, String>) -> bool {
        required
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }

    pub fn admits(&self, required: &ResourceVector, labels: &BTreeMap<String, String>) -> bool {
        self.available && self.labels_match(labels) && required.fits_within(&self.headroom())
    }

    /// CPU utilisation, used by the least-loaded strategy.
    pub fn cpu_load(&self) -> f64 {
        if self.total.cpu_millis == 0 {
            return if self.used.cpu_millis == 0 { 0.0 } else { f64::INFINITY };
        }
        self.used.cpu_millis as f64 / self.total.cpu_millis as f64
    }

    pub(crate) fn allocate(&mut self, required: &ResourceVector) {
        self.used = self.used.saturating_add(required);
        self.last_updated = Utc::now();
    }

    pub(crate) fn release(&mut self, required: &ResourceVector) {
        self.used = self.used.saturating_sub(required);
        self.last_updated = Utc::now();
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id.clone(),
            host: self.host.clone(),
            kind: self.kind.clone(),
            available: self.available,
            labels: self.labels.clone(),
            resources: NodeResources {
                total: self.total.to_resources(),
                used: self.used.to_resources(),
                available: self.headroom().to_resources(),
            },
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub total: Resources,
    pub used: Resources,
    pub available: Resources,
}

/// Snapshot of a node for management output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub host: String,
    pub kind: String,
    pub available: bool,
    pub labels: BTreeMap<String, String>,
    pub resources: NodeResources,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_exact_in_millis() {
        let r = ResourceVector::from_resources(&Resources::new(0.1, 0));
        assert_eq!(r.cpu_millis, 100);
        let three = r.saturating_add(&r).saturating_add(&r);
        assert_eq!(three.cpu_millis, 300);
        let back = three.saturating_sub(&r).saturating_sub(&r).saturating_sub(&r);
        assert_eq!(back, ResourceVector::default());
    }

    #[test]
    fn test_positive_cpu_never_rounds_to_zero() {
        let tiny = ResourceVector::from_resources(&Resources::new(0.0001, 0));
        assert_eq!(tiny.cpu_millis, 1);
        assert_eq!(ResourceVector::from_resources(&Resources::new(0.0, 0)).cpu_millis, 0);
        assert_eq!(ResourceVector::from_resources(&Resources::new(0.7, 0)).cpu_millis, 700);
    }

    #[test]
    fn test_admission_checks_every_dimension() {
        let node = Node::new(
            "n1",
            NodeAttributes::new(
                "h",
                LOCAL_KIND,
                Resources {
                    cpu_cores: 2.0,
                    memory_mb: 1024,
                    disk_mb: 100,
                    gpu_count: 1,
                },
            ),
        );
        let none = BTreeMap::new();
        let fits = ResourceVector {
            cpu_millis: 2000,
            memory_mb: 1024,
            disk_mb: 100,
            gpu_count: 1,
        };
        assert!(node.admits(&fits, &none));
        assert!(!node.admits(&ResourceVector { disk_mb: 101, ..fits }, &none));
        assert!(!node.admits(&ResourceVector { gpu_count: 2, ..fits }, &none));
        assert!(!node.admits(&ResourceVector { cpu_millis: 2001, ..fits }, &none));
    }

    #[test]
    fn test_labels_must_all_match() {
        let node = Node::new("local", NodeAttributes::local());
        let mut required = BTreeMap::new();
        required.insert("os".to_string(), "linux".to_string());
        assert!(node.labels_match(&required));
        required.insert("env".to_string(), "production".to_string());
        assert!(!node.labels_match(&required));
    }

    #[test]
    fn test_unavailable_node_admits_nothing() {
        let node = Node::new("local", NodeAttributes::local().unavailable());
        assert!(!node.admits(&ResourceVector::default(), &BTreeMap::new()));
    }

    #[test]
    fn test_release_floors_at_zero() {
        let mut node = Node::new("local", NodeAttributes::local());
        let req = ResourceVector::from_resources(&Resources::new(1.0, 512));
        node.release(&req);
        assert_eq!(node.used, ResourceVector::default());
        assert_eq!(node.cpu_load(), 0.0);
    }
}
