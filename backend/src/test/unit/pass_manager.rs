//! Pass-manager policy: thresholds, determinism, non-overlap, config
//! replacement.

use std::collections::{BTreeMap, BTreeSet};

use fusor_dtype::EngineKind;
use fusor_graph::{Graph, Op, OpKind, Partition, PartitionPolicy};

use crate::backend::FusorBackend;
use crate::pass_manager::{PassManager, PatternConfig};
use crate::test::helpers::*;

/// op id -> sorted op ids of its partition.
fn partition_map(graph: &Graph) -> BTreeMap<u64, BTreeSet<u64>> {
    let mut map = BTreeMap::new();
    for partition in graph.partitions() {
        let members: BTreeSet<u64> = partition.op_ids().iter().copied().collect();
        for &op in partition.op_ids() {
            map.insert(op, members.clone());
        }
    }
    map
}

#[test]
fn debug_policy_never_groups_ops() {
    let _guard = global_guard();
    let mut graph = Graph::new(EngineKind::Cpu);
    graph
        .add_op(Op::new(0, OpKind::Relu, "r").with_input(f32_lt(0, &[8])).with_output(f32_lt(1, &[8])))
        .unwrap();
    graph
        .add_op(Op::new(1, OpKind::Tanh, "t").with_input(f32_lt(1, &[8])).with_output(f32_lt(2, &[8])))
        .unwrap();
    graph.get_partitions(PartitionPolicy::Debug).unwrap();

    assert_eq!(graph.partitions().len(), 2);
    for partition in graph.partitions() {
        assert_eq!(partition.op_ids().len(), 1);
    }
}

#[test]
fn partitioning_is_deterministic() {
    let _guard = global_guard();
    let mut first = conv_block_graph();
    let mut second = conv_block_graph();
    first.get_partitions(PartitionPolicy::Fusion).unwrap();
    second.get_partitions(PartitionPolicy::Fusion).unwrap();

    assert_eq!(partition_map(&first), partition_map(&second));
}

#[test]
fn no_op_belongs_to_two_partitions() {
    let _guard = global_guard();
    let mut graph = sum_chain_graph();
    graph.get_partitions(PartitionPolicy::Fusion).unwrap();

    let mut seen = BTreeSet::new();
    for partition in graph.partitions() {
        for &op in partition.op_ids() {
            assert!(seen.insert(op), "op {op} claimed twice");
        }
    }
}

#[test]
fn large_partitions_can_be_disabled() {
    let _guard = global_guard();
    // SAFETY: serialized by the global guard.
    unsafe { std::env::set_var("FUSOR_ENABLE_LARGE_PARTITION", "0") };
    let mut graph = conv_block_graph();
    let result = graph.get_partitions(PartitionPolicy::Fusion);
    unsafe { std::env::remove_var("FUSOR_ENABLE_LARGE_PARTITION") };
    result.unwrap();

    // conv+bias fuse in the normal band; the relu is picked up alone.
    assert_eq!(graph.partitions().len(), 2);
    let sizes: Vec<usize> = graph.partitions().iter().map(|p| p.op_ids().len()).collect();
    assert_eq!(sizes, vec![2, 1]);
}

#[test]
fn config_document_replaces_the_registry_order() {
    let _guard = global_guard();
    let registry = FusorBackend::get().pattern_registry().filtered(f32::MAX);
    let pm = PassManager::new(registry);

    // Only the single-op relu pass is configured: the conv block must come
    // out as three single partitions minus the unmatchable ops.
    let config = PatternConfig { passes: vec!["relu_pass".to_string(), "unknown_pattern".to_string()] };
    let mut graph = conv_block_graph();
    graph.finalize().unwrap();
    pm.run_with_config(&mut graph, &config).unwrap();

    assert_eq!(graph.partitions().len(), 1);
    assert_eq!(graph.partitions()[0].op_ids(), &[2]);
}

#[test]
fn dump_and_load_round_trip() {
    let _guard = global_guard();
    let registry = FusorBackend::get().pattern_registry().filtered(f32::MAX);
    let pm = PassManager::new(registry);

    let path = std::env::temp_dir().join(format!("fusor_graph_passes_test_{}.json", std::process::id()));
    pm.dump_patterns(&path).unwrap();
    let config = PassManager::load_config(&path).unwrap().expect("dump just wrote the file");
    std::fs::remove_file(&path).ok();

    let registered: Vec<String> =
        FusorBackend::get().pattern_registry().iter().map(|p| p.name.to_string()).collect();
    assert_eq!(config.passes, registered);
    assert!(config.passes.iter().any(|name| name == "conv_bias_eltwise_block"));
}

#[test]
fn malformed_config_is_an_error() {
    let _guard = global_guard();
    let path = std::env::temp_dir().join(format!("fusor_graph_passes_bad_{}.json", std::process::id()));
    std::fs::write(&path, "{ not json").unwrap();
    let result = PassManager::load_config(&path);
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(fusor_graph::Error::InvalidArguments { .. })));
}
