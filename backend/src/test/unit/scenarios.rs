//! End-to-end scenarios through the public partition API.

use fusor_dtype::DType;
use fusor_graph::{Partition, PartitionPolicy, Property};
use fusor_primitive::memory::{Desc, FormatTag};

use crate::backend::FusorBackend;
use crate::test::helpers::*;

#[test]
fn single_op_partition_under_debug_policy() {
    let _guard = global_guard();
    let mut graph = relu_graph();
    let cp = compile_single_partition(&mut graph, PartitionPolicy::Debug);
    assert_eq!(graph.partitions()[0].op_ids(), &[0]);

    let (mut inputs, mut outputs) = io_buffers(&cp, &[0.0]);
    run_partition(&cp, &mut inputs, &mut outputs);
    assert!(outputs[0].iter().all(|&v| v == 0.0));
    assert_eq!(outputs[0].len(), 48);
}

#[test]
fn conv_post_op_fusion_under_fusion_policy() {
    let _guard = global_guard();
    let mut graph = conv_block_graph();
    let cp = compile_single_partition(&mut graph, PartitionPolicy::Fusion);

    // The single partition holds every op in the graph.
    let mut claimed: Vec<u64> = graph.partitions()[0].op_ids().to_vec();
    claimed.sort_unstable();
    assert_eq!(claimed, vec![0, 1, 2]);

    // Compile filled the unknown output shape.
    assert_eq!(cp.outputs()[0].dims.as_slice(), &[1, 16, 6, 6]);

    // Ones for data and weights, 0.5 bias: every window sums 27 values.
    let (mut inputs, mut outputs) = io_buffers(&cp, &[1.0, 1.0, 0.5]);
    run_partition(&cp, &mut inputs, &mut outputs);
    assert_eq!(outputs[0].len(), 576);
    assert!(outputs[0].iter().all(|&v| v == 27.5));
}

#[test]
fn layout_id_round_trip() {
    let backend = FusorBackend::get();
    let row = Desc::with_tag(&[2, 2], DType::F32, FormatTag::Ab).unwrap();
    let col = Desc::with_tag(&[2, 2], DType::F32, FormatTag::Ba).unwrap();

    let i = backend.intern_layout(&row);
    assert_eq!(backend.intern_layout(&row), i);
    let j = backend.intern_layout(&col);
    assert_ne!(i, j);

    assert_eq!(backend.lookup_layout(i), backend.lookup_layout(i));
    #[cfg(not(feature = "layout-debug"))]
    {
        assert_eq!(backend.lookup_layout(i), Some(row));
        assert_ne!(backend.lookup_layout(j), backend.lookup_layout(i));
    }
}

#[test]
fn sum_fusion_executes_elementwise() {
    let _guard = global_guard();
    let mut graph = sum_chain_graph();
    let cp = compile_single_partition(&mut graph, PartitionPolicy::Fusion);
    assert_eq!(graph.partitions()[0].op_ids().len(), 3);

    let (mut inputs, mut outputs) = io_buffers(&cp, &[1.0, 2.0, 3.0, 4.0]);
    run_partition(&cp, &mut inputs, &mut outputs);
    assert_eq!(outputs[0].len(), 32);
    assert!(outputs[0].iter().all(|&v| v == 10.0));
}

#[test]
fn disabled_backend_yields_no_partitions() {
    let _guard = global_guard();
    // SAFETY: serialized by the global guard; no other thread reads the
    // variable concurrently.
    unsafe { std::env::set_var("FUSOR_DISABLE_BACKEND", "1") };
    let mut graph = conv_block_graph();
    let result = graph.get_partitions(PartitionPolicy::Fusion);
    unsafe { std::env::remove_var("FUSOR_DISABLE_BACKEND") };

    result.unwrap();
    assert!(graph.partitions().is_empty());
}

#[test]
fn constant_weights_survive_buffer_reuse() {
    let _guard = global_guard();
    let mut graph = conv_block_graph();
    graph.get_partitions(PartitionPolicy::Fusion).unwrap();
    let partition = &graph.partitions()[0];

    // Mark weights and bias constant at compile.
    let inputs: Vec<_> = partition
        .inputs()
        .iter()
        .map(|lt| {
            let mut lt = lt.clone();
            if lt.id == 1 || lt.id == 2 {
                lt.property = Property::Constant;
            }
            lt
        })
        .collect();
    let cp = partition.compile(&inputs, partition.outputs(), &fusor_graph::Engine::cpu()).unwrap();

    let (mut inputs, mut outputs) = io_buffers(&cp, &[1.0, 1.0, 0.0]);
    run_partition(&cp, &mut inputs, &mut outputs);
    assert!(outputs[0].iter().all(|&v| v == 27.0));

    // Clobber the weight buffer: the cached constants must still be used.
    inputs[1].fill(123.0);
    let mut outputs2 = vec![vec![0.0f32; outputs[0].len()]];
    run_partition(&cp, &mut inputs, &mut outputs2);
    assert!(outputs2[0].iter().all(|&v| v == 27.0));
}
