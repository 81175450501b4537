//! Asynchronous execution: serial chaining and dependency closure.

use fusor_dtype::EngineKind;
use fusor_graph::{CompletionToken, Engine, Partition, Stream};

use crate::kernels::KernelKind;
use crate::partition::FusorPartition;
use crate::test::helpers::*;

/// A three-stage softmax chain in one partition: three executables.
fn softmax_chain_partition() -> FusorPartition {
    use fusor_graph::{AttrValue, Op, OpKind, attr};
    let dims = [2i64, 8];
    let op = |id: u64, input: u64, output: u64| {
        Op::new(id, OpKind::Softmax, format!("softmax{id}"))
            .with_attr(attr::AXIS, AttrValue::I64(1))
            .with_input(f32_lt(input, &dims))
            .with_output(f32_lt(output, &dims))
    };
    FusorPartition::new(
        KernelKind::Softmax,
        "softmax_chain",
        vec![op(0, 0, 1), op(1, 1, 2), op(2, 2, 3)],
        vec![f32_lt(0, &dims)],
        vec![f32_lt(3, &dims)],
        EngineKind::Cpu,
    )
}

/// Every id reachable through the token's dependency edges.
fn closure_size(token: &CompletionToken) -> usize {
    let mut seen = std::collections::HashSet::new();
    let mut stack = vec![token.clone()];
    while let Some(next) = stack.pop() {
        if seen.insert(next.id()) {
            stack.extend(next.dependencies().iter().cloned());
        }
    }
    seen.len() - 1 // exclude the returned token itself
}

#[test]
fn async_execute_chains_every_executable() {
    let _guard = global_guard();
    let partition = softmax_chain_partition();
    let compiled = partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap();

    let stream = Stream::new(&Engine::cpu());
    let upstream_a = stream.chain(vec![]);
    let upstream_b = stream.chain(vec![]);

    let (mut inputs, mut outputs) = io_buffers(&compiled, &[1.0]);
    let input_tensors: Vec<_> = compiled
        .inputs()
        .iter()
        .zip(inputs.iter_mut())
        .map(|(lt, data)| fusor_graph::Tensor::from_f32_slice(lt.clone(), data))
        .collect();
    let output_tensors: Vec<_> = compiled
        .outputs()
        .iter()
        .zip(outputs.iter_mut())
        .map(|(lt, data)| fusor_graph::Tensor::from_f32_slice(lt.clone(), data))
        .collect();

    let done = compiled
        .execute_async(&stream, &input_tensors, &output_tensors, &[upstream_a.clone(), upstream_b.clone()])
        .unwrap();

    // The returned event depends, transitively, on both upstream events and
    // on every executable submitted in between.
    assert!(done.depends_transitively_on(&upstream_a));
    assert!(done.depends_transitively_on(&upstream_b));
    assert_eq!(closure_size(&done), 2 + 2); // two chain predecessors + two upstream deps

    // Uniform rows stay uniform through softmax: each element is 1/8.
    assert!(outputs[0].iter().all(|&v| (v - 0.125).abs() < 1e-6));
}

#[test]
fn async_result_matches_synchronous_execution() {
    let _guard = global_guard();
    let partition = softmax_chain_partition();
    let compiled = partition.compile(partition.inputs(), partition.outputs(), &Engine::cpu()).unwrap();
    let stream = Stream::new(&Engine::cpu());

    let mut seed = vec![0.0f32; 16];
    for (i, v) in seed.iter_mut().enumerate() {
        *v = i as f32 * 0.25;
    }

    let mut sync_in = seed.clone();
    let mut sync_out = vec![0.0f32; 16];
    run_partition(&compiled, std::slice::from_mut(&mut sync_in), std::slice::from_mut(&mut sync_out));

    let mut async_in = seed;
    let mut async_out = vec![0.0f32; 16];
    let input = fusor_graph::Tensor::from_f32_slice(compiled.inputs()[0].clone(), &mut async_in);
    let output = fusor_graph::Tensor::from_f32_slice(compiled.outputs()[0].clone(), &mut async_out);
    let token = compiled.execute_async(&stream, &[input], &[output], &[]).unwrap();
    stream.wait().unwrap();

    assert_eq!(sync_out, async_out);
    assert!(token.dependencies().len() == 1 || closure_size(&token) >= 2);
}
