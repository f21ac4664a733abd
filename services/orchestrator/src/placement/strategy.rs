//! Node selection strategies.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::node::Node;
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Uniform choice among admissible nodes.
    #[default]
    Random,
    /// Hash of the service name modulo the candidate count. Stable per name,
    /// not a rotating pointer.
    RoundRobin,
    /// Lowest `used_cpu / total_cpu`; ties go to the earlier node.
    LeastLoaded,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
        }
    }

    /// Index into `candidates` of the chosen node, `None` when empty.
    pub fn select(&self, service_name: &str, candidates: &[&Node]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self {
            Strategy::Random => rand::rng().random_range(0..candidates.len()),
            Strategy::RoundRobin => (name_hash(service_name) % candidates.len() as u64) as usize,
            Strategy::LeastLoaded => {
                let mut best = 0;
                for (i, node) in candidates.iter().enumerate().skip(1) {
                    if node.cpu_load() < candidates[best].cpu_load() {
                        best = i;
                    }
                }
                best
            }
        };
        Some(index)
    }
}

/// First eight bytes of SHA-256 over the name.
fn name_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "random" => Ok(Strategy::Random),
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            other => Err(ValidationError::InvalidStrategy(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Resources;
    use crate::placement::node::{NodeAttributes, ResourceVector, LOCAL_KIND};

    fn node(id: &str, used_cpu: u64) -> Node {
        let mut node = Node::new(
            id,
            NodeAttributes::new("h", LOCAL_KIND, Resources::new(4.0, 4096)),
        );
        node.allocate(&ResourceVector {
            cpu_millis: used_cpu,
            ..ResourceVector::default()
        });
        node
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("random".parse::<Strategy>().unwrap(), Strategy::Random);
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!(" least_loaded ".parse::<Strategy>().unwrap(), Strategy::LeastLoaded);
        assert_eq!(
            "busiest".parse::<Strategy>(),
            Err(ValidationError::InvalidStrategy("busiest".to_string()))
        );
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(Strategy::Random.select("web-1", &[]), None);
    }

    #[test]
    fn test_least_loaded_picks_lowest_ratio_first_on_tie() {
        let a = node("a", 2000);
        let b = node("b", 1000);
        let c = node("c", 1000);
        assert_eq!(Strategy::LeastLoaded.select("web-1", &[&a, &b, &c]), Some(1));
    }

    #[test]
    fn test_round_robin_is_stable_per_name() {
        let nodes: Vec<Node> = (0..5).map(|i| node(&format!("n{i}"), 0)).collect();
        let refs: Vec<&Node> = nodes.iter().collect();
        let first = Strategy::RoundRobin.select("web-1", &refs);
        for _ in 0..10 {
            assert_eq!(Strategy::RoundRobin.select("web-1", &refs), first);
        }
        assert_eq!(first, Some((name_hash("web-1") % 5) as usize));
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let nodes: Vec<Node> = (0..3).map(|i| node(&format!("n{i}"), 0)).collect();
        let refs: Vec<&Node> = nodes.iter().collect();
        for _ in 0..100 {
            let pick = Strategy::Random.select("web-1", &refs).unwrap();
            assert!(pick < 3);
        }
    }
}
