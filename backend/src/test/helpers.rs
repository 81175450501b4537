//! Shared test fixtures: graph builders and the guard serializing tests that
//! touch process-global state (environment variables, capability flags).

use fusor_dtype::{DType, EngineKind};
use fusor_graph::{
    AttrValue, CompiledPartition, DIM_UNKNOWN, Engine, Graph, LogicalTensor, Op, OpKind, Partition, PartitionPolicy,
    Stream, Tensor, attr,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

use crate::backend::register_fusor_backend;

static GLOBAL_STATE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialize tests that read or mutate env vars / global capability flags.
pub fn global_guard() -> MutexGuard<'static, ()> {
    register_fusor_backend();
    GLOBAL_STATE.lock()
}

pub fn f32_lt(id: u64, dims: &[i64]) -> LogicalTensor {
    LogicalTensor::new(id, DType::F32).with_dims(dims)
}

pub fn unknown_lt(id: u64, rank: usize) -> LogicalTensor {
    LogicalTensor::new(id, DType::F32).with_dims(&vec![DIM_UNKNOWN; rank])
}

/// `relu(x)`, x f32[1,3,4,4].
pub fn relu_graph() -> Graph {
    let mut graph = Graph::new(EngineKind::Cpu);
    graph
        .add_op(Op::new(0, OpKind::Relu, "relu0").with_input(f32_lt(0, &[1, 3, 4, 4])).with_output(f32_lt(1, &[
            1, 3, 4, 4,
        ])))
        .unwrap();
    graph.finalize().unwrap();
    graph
}

/// `y = relu(add(bias, conv(x, w)))` with x f32[1,3,8,8], w f32[16,3,3,3],
/// bias f32[16]. Intermediate and output shapes are left unknown so compile
/// has something to fill.
pub fn conv_block_graph() -> Graph {
    let mut graph = Graph::new(EngineKind::Cpu);
    graph
        .add_op(
            Op::new(0, OpKind::Convolution, "conv0")
                .with_attr(attr::STRIDES, AttrValue::I64s(vec![1, 1]))
                .with_attr(attr::PADS_BEGIN, AttrValue::I64s(vec![0, 0]))
                .with_attr(attr::PADS_END, AttrValue::I64s(vec![0, 0]))
                .with_attr(attr::DILATIONS, AttrValue::I64s(vec![1, 1]))
                .with_input(f32_lt(0, &[1, 3, 8, 8]))
                .with_input(f32_lt(1, &[16, 3, 3, 3]))
                .with_output(unknown_lt(3, 4)),
        )
        .unwrap();
    graph
        .add_op(
            Op::new(1, OpKind::Add, "bias_add")
                .with_input(f32_lt(2, &[16]))
                .with_input(unknown_lt(3, 4))
                .with_output(unknown_lt(4, 4)),
        )
        .unwrap();
    graph
        .add_op(Op::new(2, OpKind::Relu, "relu0").with_input(unknown_lt(4, 4)).with_output(unknown_lt(5, 4)))
        .unwrap();
    graph.finalize().unwrap();
    graph
}

/// `y = add(add(add(a, b), c), d)`, all f32[32].
pub fn sum_chain_graph() -> Graph {
    let dims = [32i64];
    let mut graph = Graph::new(EngineKind::Cpu);
    graph
        .add_op(
            Op::new(0, OpKind::Add, "add0")
                .with_input(f32_lt(0, &dims))
                .with_input(f32_lt(1, &dims))
                .with_output(f32_lt(4, &dims)),
        )
        .unwrap();
    graph
        .add_op(
            Op::new(1, OpKind::Add, "add1")
                .with_input(f32_lt(4, &dims))
                .with_input(f32_lt(2, &dims))
                .with_output(f32_lt(5, &dims)),
        )
        .unwrap();
    graph
        .add_op(
            Op::new(2, OpKind::Add, "add2")
                .with_input(f32_lt(5, &dims))
                .with_input(f32_lt(3, &dims))
                .with_output(f32_lt(6, &dims)),
        )
        .unwrap();
    graph.finalize().unwrap();
    graph
}

/// Partition the graph and compile its only partition on the CPU engine.
pub fn compile_single_partition(graph: &mut Graph, policy: PartitionPolicy) -> CompiledPartition {
    graph.get_partitions(policy).unwrap();
    assert_eq!(graph.partitions().len(), 1, "expected exactly one partition");
    let partition = &graph.partitions()[0];
    partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap()
}

/// Execute a compiled partition against f32 buffers, one per compiled input
/// and output, in order.
pub fn run_partition(cp: &CompiledPartition, inputs: &mut [Vec<f32>], outputs: &mut [Vec<f32>]) {
    let stream = Stream::new(&Engine::cpu());
    let input_tensors: Vec<Tensor> = cp
        .inputs()
        .iter()
        .zip(inputs.iter_mut())
        .map(|(lt, data)| Tensor::from_f32_slice(lt.clone(), data))
        .collect();
    let output_tensors: Vec<Tensor> = cp
        .outputs()
        .iter()
        .zip(outputs.iter_mut())
        .map(|(lt, data)| Tensor::from_f32_slice(lt.clone(), data))
        .collect();
    cp.execute(&stream, &input_tensors, &output_tensors).unwrap();
}

/// Buffers sized for the compiled partition's tensors, inputs seeded by the
/// given fill values (cycled), outputs zeroed.
pub fn io_buffers(cp: &CompiledPartition, fills: &[f32]) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let inputs = cp
        .inputs()
        .iter()
        .enumerate()
        .map(|(i, lt)| vec![fills[i % fills.len()]; lt.nelems().unwrap() as usize])
        .collect();
    let outputs = cp.outputs().iter().map(|lt| vec![0.0f32; lt.nelems().unwrap() as usize]).collect();
    (inputs, outputs)
}
