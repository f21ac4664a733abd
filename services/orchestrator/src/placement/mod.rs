//! Resource-aware node placement.
//!
//! The [`PlacementScheduler`] owns every node ledger. Admission and
//! allocation happen under one lock, so two concurrent placements can never
//! both claim the last unit of a resource.

mod node;
mod strategy;

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::definition::ServiceDefinition;
use crate::error::{SchedulerError, SchedulerResult};

pub use node::{
    Node, NodeAttributes, NodeResources, NodeStatus, ResourceVector, LOCAL_KIND, LOCAL_NODE_ID,
};
pub use strategy::Strategy;

struct Ledger {
    /// Insertion order is the tie-break order for strategies.
    nodes: Vec<Node>,
    strategy: Strategy,
}

impl Ledger {
    fn position(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }
}

pub struct PlacementScheduler {
    ledger: Mutex<Ledger>,
}

impl Default for PlacementScheduler {
    fn default() -> Self {
        Self::with_local_node(Strategy::default())
    }
}

impl PlacementScheduler {
    /// A scheduler with no nodes.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                nodes: Vec::new(),
                strategy,
            }),
        }
    }

    /// A scheduler seeded with the `local` node.
    pub fn with_local_node(strategy: Strategy) -> Self {
        let scheduler = Self::new(strategy);
        scheduler
            .lock()
            .nodes
            .push(Node::new(LOCAL_NODE_ID, NodeAttributes::local()));
        info!(node_id = LOCAL_NODE_ID, strategy = %strategy, "Placement scheduler initialized");
        scheduler
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_node(&self, node_id: impl Into<String>, attrs: NodeAttributes) -> SchedulerResult<()> {
        let node_id = node_id.into();
        let mut ledger = self.lock();
        if ledger.position(&node_id).is_some() {
            return Err(SchedulerError::NodeExists(node_id));
        }
        info!(node_id = %node_id, host = %attrs.host, kind = %attrs.kind, "Added node");
        ledger.nodes.push(Node::new(node_id, attrs));
        Ok(())
    }

    /// Removes a node. Later releases against it are ignored.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut ledger = self.lock();
        let Some(index) = ledger.position(node_id) else {
            return false;
        };
        let node = ledger.nodes.remove(index);
        if node.used != ResourceVector::default() {
            warn!(node_id = %node_id, used = ?node.used, "Removed node with live allocations");
        } else {
            info!(node_id = %node_id, "Removed node");
        }
        true
    }

    pub fn set_node_available(&self, node_id: &str, available: bool) -> SchedulerResult<()> {
        let mut ledger = self.lock();
        let index = ledger
            .position(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
        ledger.nodes[index].available = available;
        info!(node_id = %node_id, available, "Node availability changed");
        Ok(())
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.lock().strategy = strategy;
        info!(strategy = %strategy, "Placement strategy changed");
    }

    pub fn strategy(&self) -> Strategy {
        self.lock().strategy
    }

    /// Picks a node for `definition` and reserves its resources.
    ///
    /// With `preferred_node` only that node is considered.
    pub fn schedule(
        &self,
        definition: &ServiceDefinition,
        preferred_node: Option<&str>,
    ) -> SchedulerResult<(String, NodeStatus)> {
        let required = ResourceVector::from_resources(&definition.resources);
        let no_node = || SchedulerError::NoAvailableNode {
            service: definition.name.clone(),
        };

        let mut ledger = self.lock();
        let index = match preferred_node {
            Some(node_id) => {
                let index = ledger
                    .position(node_id)
                    .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))?;
                if !ledger.nodes[index].admits(&required, &definition.node_labels) {
                    return Err(no_node());
                }
                index
            }
            None => {
                let eligible: Vec<usize> = ledger
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.admits(&required, &definition.node_labels))
                    .map(|(i, _)| i)
                    .collect();
                let candidates: Vec<&Node> = eligible.iter().map(|&i| &ledger.nodes[i]).collect();
                let pick = ledger
                    .strategy
                    .select(&definition.name, &candidates)
                    .ok_or_else(no_node)?;
                eligible[pick]
            }
        };

        let strategy = ledger.strategy;
        let node = &mut ledger.nodes[index];
        node.allocate(&required);
        debug!(
            service = %definition.name,
            node_id = %node.id,
            strategy = %strategy,
            used = ?node.used,
            "Reserved resources"
        );
        Ok((node.id.clone(), node.status()))
    }

    /// Returns `definition`'s reservation to `node_id`, never below zero.
    pub fn release_resources(&self, node_id: &str, definition: &ServiceDefinition) {
        let required = ResourceVector::from_resources(&definition.resources);
        let mut ledger = self.lock();
        match ledger.position(node_id) {
            Some(index) => {
                let node = &mut ledger.nodes[index];
                node.release(&required);
                debug!(service = %definition.name, node_id = %node_id, used = ?node.used, "Released resources");
            }
            None => warn!(node_id = %node_id, "Release against unknown node ignored"),
        }
    }

    pub fn node_status(&self, node_id: &str) -> SchedulerResult<NodeStatus> {
        let ledger = self.lock();
        ledger
            .position(node_id)
            .map(|index| ledger.nodes[index].status())
            .ok_or_else(|| SchedulerError::NodeNotFound(node_id.to_string()))
    }

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.lock().nodes.iter().map(Node::status).collect()
    }

    /// Whether `node_id` launches on this host.
    pub fn is_local(&self, node_id: &str) -> bool {
        let ledger = self.lock();
        ledger
            .position(node_id)
            .is_some_and(|index| ledger.nodes[index].is_local())
    }
}
