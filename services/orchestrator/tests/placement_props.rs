//! Property tests for the placement ledger.
//!
//! Random sequences of reservations and releases against a small cluster
//! must keep every node's `used` equal to the sum of its live reservations,
//! never above capacity, and must refuse a placement only when no node can
//! take it.

use std::collections::HashMap;

use proptest::prelude::*;
use sfw_orchestrator::placement::{
    NodeAttributes, PlacementScheduler, ResourceVector, Strategy as PlacementStrategy,
};
use sfw_orchestrator::{Resources, SchedulerError, ServiceDefinition};

#[derive(Debug, Clone)]
enum Op {
    Place { cpu_millis: u64, memory_mb: u64 },
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u64..=5_000, 0u64..=6_000).prop_map(|(cpu_millis, memory_mb)| Op::Place { cpu_millis, memory_mb }),
        1 => any::<usize>().prop_map(Op::Release),
    ]
}

fn placement_strategy() -> impl Strategy<Value = PlacementStrategy> {
    prop_oneof![
        Just(PlacementStrategy::Random),
        Just(PlacementStrategy::RoundRobin),
        Just(PlacementStrategy::LeastLoaded),
    ]
}

fn cluster(strategy: PlacementStrategy) -> (PlacementScheduler, HashMap<String, ResourceVector>) {
    let scheduler = PlacementScheduler::new(strategy);
    let mut totals = HashMap::new();
    for (id, cpu, memory) in [("n1", 4.0, 8_192), ("n2", 8.0, 4_096), ("n3", 2.0, 16_384)] {
        let capacity = Resources {
            cpu_cores: cpu,
            memory_mb: memory,
            disk_mb: 10_000,
            gpu_count: 0,
        };
        totals.insert(id.to_string(), ResourceVector::from_resources(&capacity));
        scheduler
            .add_node(id, NodeAttributes::new("127.0.0.1", "local", capacity))
            .unwrap();
    }
    (scheduler, totals)
}

fn definition(index: usize, cpu_millis: u64, memory_mb: u64) -> ServiceDefinition {
    ServiceDefinition::new(format!("svc-{index}"), "run").with_resources(Resources {
        cpu_cores: cpu_millis as f64 / 1000.0,
        memory_mb,
        disk_mb: 100,
        gpu_count: 0,
    })
}

proptest! {
    #[test]
    fn test_ledger_conserves_resources(strategy in placement_strategy(), ops in prop::collection::vec(op(), 1..60)) {
        let (scheduler, totals) = cluster(strategy);
        let mut live: Vec<(String, ServiceDefinition)> = Vec::new();

        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Place { cpu_millis, memory_mb } => {
                    let def = definition(i, cpu_millis, memory_mb);
                    let required = ResourceVector::from_resources(&def.resources);

                    // Free capacity per node before the attempt.
                    let fits_somewhere = scheduler.nodes().iter().any(|n| {
                        required.fits_within(&ResourceVector::from_resources(&n.resources.available))
                    });

                    match scheduler.schedule(&def, None) {
                        Ok((node_id, _)) => {
                            prop_assert!(fits_somewhere);
                            live.push((node_id, def));
                        }
                        Err(SchedulerError::NoAvailableNode { .. }) => prop_assert!(!fits_somewhere),
                        Err(other) => prop_assert!(false, "unexpected error {other}"),
                    }
                }
                Op::Release(pick) => {
                    if !live.is_empty() {
                        let (node_id, def) = live.remove(pick % live.len());
                        scheduler.release_resources(&node_id, &def);
                    }
                }
            }

            for status in scheduler.nodes() {
                let expected = live
                    .iter()
                    .filter(|(node_id, _)| *node_id == status.node_id)
                    .fold(ResourceVector::default(), |acc, (_, def)| {
                        acc.saturating_add(&ResourceVector::from_resources(&def.resources))
                    });
                let used = ResourceVector::from_resources(&status.resources.used);
                prop_assert_eq!(used, expected);
                prop_assert!(used.fits_within(&totals[&status.node_id]));
            }
        }

        for (node_id, def) in live.drain(..) {
            scheduler.release_resources(&node_id, &def);
        }
        for status in scheduler.nodes() {
            prop_assert_eq!(
                ResourceVector::from_resources(&status.resources.used),
                ResourceVector::default()
            );
        }
    }
}

#[test]
fn test_concurrent_placements_never_overcommit() {
    let scheduler = PlacementScheduler::new(PlacementStrategy::Random);
    scheduler
        .add_node(
            "n1",
            NodeAttributes::new(
                "127.0.0.1",
                "local",
                Resources {
                    cpu_cores: 4.0,
                    memory_mb: 65_536,
                    disk_mb: 1_000_000,
                    gpu_count: 0,
                },
            ),
        )
        .unwrap();

    // 0.75 cores each: floor(4.0 / 0.75) = 5 fit.
    let placed: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..32)
            .map(|i| {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    let def = ServiceDefinition::new(format!("svc-{i}"), "run")
                        .with_resources(Resources::new(0.75, 64));
                    scheduler.schedule(&def, None).is_ok()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });

    assert_eq!(placed, 5);
    let status = scheduler.node_status("n1").unwrap();
    assert_eq!(ResourceVector::from_resources(&status.resources.used).cpu_millis, 3_750);
    assert_eq!(status.resources.used.memory_mb, 5 * 64);
}
