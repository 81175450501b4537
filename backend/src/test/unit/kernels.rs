//! Kernel structure and execution machinery.

use std::sync::Arc;

use fusor_dtype::EngineKind;
use fusor_graph::{CompiledKernel, Engine, Partition, PartitionPolicy, Stream, Tensor};
use fusor_primitive::primitives::PostOp;

use crate::ir::InternalKind;
use crate::kernels::{KernelKind, SubgraphKernel, thread_cache};
use crate::partition::FusorPartition;
use crate::test::helpers::*;

fn conv_block_partition() -> FusorPartition {
    let graph = conv_block_graph();
    FusorPartition::new(
        KernelKind::LargePartition,
        "conv_bias_eltwise_block",
        graph.ops().to_vec(),
        vec![f32_lt(0, &[1, 3, 8, 8]), f32_lt(1, &[16, 3, 3, 3]), f32_lt(2, &[16])],
        vec![unknown_lt(5, 4)],
        EngineKind::Cpu,
    )
}

#[test]
fn conv_block_compiles_to_one_fused_executable() {
    let _guard = global_guard();
    let partition = conv_block_partition();
    let mut kernel = SubgraphKernel::new(KernelKind::LargePartition);
    kernel.compile(&partition, &Engine::cpu(), partition.inputs(), partition.outputs()).unwrap();

    let sg = kernel.subgraph().unwrap();
    assert_eq!(sg.executables().len(), 1);
    assert_eq!(sg.n_live_nodes(), 1);

    let (_, conv) = sg.live_nodes().next().unwrap();
    assert_eq!(conv.kind, InternalKind::Conv);
    assert!(conv.attrs.with_bias);
    assert!(matches!(conv.post_ops.as_slice(), [PostOp::Eltwise(_)]));

    assert_eq!(kernel.compiled_outputs()[0].dims.as_slice(), &[1, 16, 6, 6]);
}

#[test]
fn sum_kernel_collapses_the_add_chain() {
    let _guard = global_guard();
    let graph = sum_chain_graph();
    let dims = [32i64];
    let partition = FusorPartition::new(
        KernelKind::Sum,
        "sum_chain3",
        graph.ops().to_vec(),
        vec![f32_lt(0, &dims), f32_lt(1, &dims), f32_lt(2, &dims), f32_lt(3, &dims)],
        vec![f32_lt(6, &dims)],
        EngineKind::Cpu,
    );
    let mut kernel = SubgraphKernel::new(KernelKind::Sum);
    kernel.compile(&partition, &Engine::cpu(), partition.inputs(), partition.outputs()).unwrap();

    let sg = kernel.subgraph().unwrap();
    assert_eq!(sg.n_live_nodes(), 1);
    let (_, sum) = sg.live_nodes().next().unwrap();
    assert_eq!(sum.kind, InternalKind::Sum);
    assert_eq!(sum.inputs.len(), 4);
}

#[test]
fn pinned_transposed_input_gets_a_reorder() {
    let _guard = global_guard();
    use fusor_graph::{LogicalTensor, Op, OpKind};
    use fusor_dtype::DType;

    let src = LogicalTensor::new(0, DType::F32).with_dims(&[2, 2]).with_strides(&[1, 2]);
    let weights = f32_lt(1, &[2, 2]);
    let out = f32_lt(2, &[2, 2]);
    let op = Op::new(0, OpKind::MatMul, "matmul0")
        .with_input(src.clone())
        .with_input(weights.clone())
        .with_output(out.clone());
    let partition = FusorPartition::new(
        KernelKind::Matmul,
        "matmul_pass",
        vec![op],
        vec![src, weights],
        vec![out],
        EngineKind::Cpu,
    );

    let mut kernel = SubgraphKernel::new(KernelKind::Matmul);
    kernel.compile(&partition, &Engine::cpu(), partition.inputs(), partition.outputs()).unwrap();
    let sg = kernel.subgraph().unwrap();
    // The column-major input is densified by an explicit reorder.
    assert_eq!(sg.n_live_nodes(), 2);
    let kinds: Vec<InternalKind> = sg.exec_order().iter().map(|&op| sg.node(op).kind).collect();
    assert_eq!(kinds, vec![InternalKind::Reorder, InternalKind::Matmul]);

    let compiled = partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap();
    // Column-major storage of [[1,2],[3,4]] times the identity.
    let mut a = vec![1.0f32, 3.0, 2.0, 4.0];
    let mut identity = vec![1.0f32, 0.0, 0.0, 1.0];
    let mut result = vec![0.0f32; 4];
    let stream = Stream::new(&Engine::cpu());
    let inputs = [
        Tensor::from_f32_slice(compiled.inputs()[0].clone(), &mut a),
        Tensor::from_f32_slice(compiled.inputs()[1].clone(), &mut identity),
    ];
    let outputs = [Tensor::from_f32_slice(compiled.outputs()[0].clone(), &mut result)];
    compiled.execute(&stream, &inputs, &outputs).unwrap();
    assert_eq!(result, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn pool_eltwise_partition_runs_both_stages() {
    let _guard = global_guard();
    use fusor_graph::{AttrValue, Op, OpKind, attr};

    let mut graph = fusor_graph::Graph::new(EngineKind::Cpu);
    graph
        .add_op(
            Op::new(0, OpKind::MaxPool, "pool0")
                .with_attr(attr::KERNEL, AttrValue::I64s(vec![2, 2]))
                .with_attr(attr::STRIDES, AttrValue::I64s(vec![2, 2]))
                .with_input(f32_lt(0, &[1, 1, 4, 4]))
                .with_output(f32_lt(1, &[1, 1, 2, 2])),
        )
        .unwrap();
    graph
        .add_op(Op::new(1, OpKind::Relu, "relu0").with_input(f32_lt(1, &[1, 1, 2, 2])).with_output(f32_lt(2, &[
            1, 1, 2, 2,
        ])))
        .unwrap();
    graph.finalize().unwrap();

    let compiled = compile_single_partition(&mut graph, PartitionPolicy::Fusion);
    assert_eq!(graph.partitions()[0].op_ids().len(), 2);

    // The pool pipeline runs no fusion passes: pool then eltwise execute as
    // two chained stages through one scratchpad temporary.
    let mut src: Vec<f32> = (0..16).map(|i| i as f32 - 8.0).collect();
    let mut out = vec![0.0f32; 4];
    run_partition(&compiled, std::slice::from_mut(&mut src), std::slice::from_mut(&mut out));
    assert_eq!(out, vec![0.0, 0.0, 5.0, 7.0]);
}

#[test]
fn binary_eltwise_fuses_into_one_executable() {
    let _guard = global_guard();
    use fusor_graph::{Op, OpKind};

    let dims = [8i64];
    let ops = vec![
        Op::new(0, OpKind::Add, "add0")
            .with_input(f32_lt(0, &dims))
            .with_input(f32_lt(1, &dims))
            .with_output(f32_lt(2, &dims)),
        Op::new(1, OpKind::Relu, "relu0").with_input(f32_lt(2, &dims)).with_output(f32_lt(3, &dims)),
    ];
    let partition = FusorPartition::new(
        KernelKind::Binary,
        "binary_eltwise",
        ops,
        vec![f32_lt(0, &dims), f32_lt(1, &dims)],
        vec![f32_lt(3, &dims)],
        EngineKind::Cpu,
    );
    let mut kernel = SubgraphKernel::new(KernelKind::Binary);
    kernel.compile(&partition, &Engine::cpu(), partition.inputs(), partition.outputs()).unwrap();

    let sg = kernel.subgraph().unwrap();
    assert_eq!(sg.n_live_nodes(), 1);
    let (_, node) = sg.live_nodes().next().unwrap();
    assert_eq!(node.kind, InternalKind::Binary);
    assert!(matches!(node.post_ops.as_slice(), [PostOp::Eltwise(_)]));
}

#[test]
fn dropping_a_kernel_retires_its_thread_resources() {
    let _guard = global_guard();
    let before = thread_cache::cached_on_this_thread();

    let partition = conv_block_partition();
    let compiled = partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap();
    let (mut inputs, mut outputs) = io_buffers(&compiled, &[1.0]);
    run_partition(&compiled, &mut inputs, &mut outputs);
    assert_eq!(thread_cache::cached_on_this_thread(), before + 1);

    drop(compiled);
    // The retired entry is purged on the next cache access.
    let probe = thread_cache::KernelId::fresh();
    thread_cache::get_or_create(probe, Default::default);
    assert_eq!(thread_cache::cached_on_this_thread(), before + 1);
    thread_cache::retire(probe);
}

#[test]
fn one_kernel_executes_from_many_threads() {
    let _guard = global_guard();
    let mut graph = conv_block_graph();
    let compiled = Arc::new(compile_single_partition(&mut graph, PartitionPolicy::Fusion));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let compiled = Arc::clone(&compiled);
            std::thread::spawn(move || {
                let bias = t as f32;
                let (mut inputs, mut outputs) = io_buffers(&compiled, &[1.0, 1.0, bias]);
                run_partition(&compiled, &mut inputs, &mut outputs);
                assert!(outputs[0].iter().all(|&v| v == 27.0 + bias), "thread {t} read a foreign result");
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn mismatched_tensor_counts_are_invalid() {
    let _guard = global_guard();
    let mut graph = relu_graph();
    let compiled = compile_single_partition(&mut graph, PartitionPolicy::Debug);

    let stream = Stream::new(&Engine::cpu());
    let result = compiled.execute(&stream, &[], &[]);
    assert!(matches!(result, Err(fusor_graph::Error::InvalidArguments { .. })));
}

#[test]
fn execute_before_compile_is_internal() {
    let kernel = SubgraphKernel::new(KernelKind::Eltwise);
    let stream = Stream::new(&Engine::cpu());
    let result = kernel.execute(&stream, &[], &[]);
    assert!(matches!(result, Err(fusor_graph::Error::Internal { .. })));
}

#[test]
fn tensor_shapes_must_be_filled_for_io_helpers() {
    let _guard = global_guard();
    let partition = conv_block_partition();
    let compiled = partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap();
    // Inputs keep their given dims; the output came back concrete.
    assert!(compiled.inputs().iter().all(|lt| !lt.has_unknown_dims()));
    assert!(compiled.outputs().iter().all(|lt| !lt.has_unknown_dims()));
    let _ = Tensor::from_f32_slice(compiled.outputs()[0].clone(), &mut vec![0.0; 576]);
}
