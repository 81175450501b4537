//! Memory-plan invariants: reuse, disjointness, in-place aliasing, constant
//! promotion.

use fusor_graph::{Op, OpKind, Property};
use fusor_primitive::Engine;

use crate::ir::{FpMathMode, Subgraph, ValueKind};
use crate::passes::{MemBinding, MemoryPlanner, layout_propagation, lower_down};
use crate::test::helpers::*;

/// Build and plan a subgraph straight from graph-level ops.
fn plan(ops: Vec<Op>, inputs: &[fusor_graph::LogicalTensor], outputs: &[fusor_graph::LogicalTensor],
        constants_enabled: bool) -> (Subgraph, MemoryPlanner) {
    let mut sg = Subgraph::new(ops, inputs, outputs, Engine::cpu(), FpMathMode::Strict, false).unwrap();
    lower_down(&mut sg).unwrap();
    layout_propagation(&mut sg).unwrap();
    let mut planner = MemoryPlanner::new(constants_enabled);
    planner.run(&mut sg).unwrap();
    (sg, planner)
}

fn chain_op(id: u64, kind: OpKind, input: u64, output: u64, dims: &[i64]) -> Op {
    Op::new(id, kind, format!("op{id}")).with_input(f32_lt(input, dims)).with_output(f32_lt(output, dims))
}

#[test]
fn disjoint_lifetimes_reuse_offsets() {
    let dims = [2i64, 8];
    // Four softmaxes in a row: t1 and t3 never overlap.
    let ops = vec![
        chain_op(0, OpKind::Softmax, 0, 1, &dims),
        chain_op(1, OpKind::Softmax, 1, 2, &dims),
        chain_op(2, OpKind::Softmax, 2, 3, &dims),
        chain_op(3, OpKind::Softmax, 3, 4, &dims),
    ];
    let (sg, planner) = plan(ops, &[f32_lt(0, &dims)], &[f32_lt(4, &dims)], true);
    let plan = planner.plan().unwrap();

    let offset_of = |tensor: u64| match plan.bindings[sg.value_of_tensor(tensor).unwrap()] {
        Some(MemBinding::Internal { offset }) => offset,
        other => panic!("tensor {tensor} is not scratchpad-backed: {other:?}"),
    };
    let (t1, t2, t3) = (offset_of(1), offset_of(2), offset_of(3));
    assert_eq!(t1, t3, "disjoint lifetimes must share an offset");
    assert_ne!(t1, t2);
    // Two concurrent 64-byte-aligned temporaries, not three.
    assert_eq!(plan.total_internal_bytes, 128);
}

#[test]
fn overlapping_lifetimes_never_overlap_in_memory() {
    let dims = [4i64, 4];
    let ops = vec![
        chain_op(0, OpKind::Softmax, 0, 1, &dims),
        chain_op(1, OpKind::Softmax, 1, 2, &dims),
        chain_op(2, OpKind::Softmax, 2, 3, &dims),
        chain_op(3, OpKind::Softmax, 3, 4, &dims),
    ];
    let (sg, planner) = plan(ops, &[f32_lt(0, &dims)], &[f32_lt(4, &dims)], true);
    let plan = planner.plan().unwrap();

    let internal: Vec<(usize, usize, (usize, usize))> = (0..sg.values.len())
        .filter_map(|v| match (plan.bindings[v], plan.lifetimes[v]) {
            (Some(MemBinding::Internal { offset }), Some(lifetime)) => {
                let size = sg.value(v).desc.as_ref().unwrap().size();
                Some((offset, size, lifetime))
            }
            _ => None,
        })
        .collect();

    for (i, &(off_a, size_a, (first_a, last_a))) in internal.iter().enumerate() {
        for &(off_b, size_b, (first_b, last_b)) in &internal[i + 1..] {
            let live_overlap = first_a <= last_b && first_b <= last_a;
            let mem_overlap = off_a < off_b + size_b && off_b < off_a + size_a;
            assert!(!(live_overlap && mem_overlap), "live-overlapping values share scratchpad bytes");
        }
    }
}

#[test]
fn dying_input_is_aliased_in_place() {
    let dims = [16i64];
    let ops = vec![
        chain_op(0, OpKind::Relu, 0, 1, &dims),
        chain_op(1, OpKind::Tanh, 1, 2, &dims),
        chain_op(2, OpKind::Relu, 2, 3, &dims),
    ];
    let (sg, planner) = plan(ops, &[f32_lt(0, &dims)], &[f32_lt(3, &dims)], true);
    let plan = planner.plan().unwrap();

    let binding = |tensor: u64| plan.bindings[sg.value_of_tensor(tensor).unwrap()].unwrap();
    // t2 reuses t1's block in place; only one scratchpad slot exists.
    assert_eq!(binding(1), binding(2));
    assert_eq!(plan.total_internal_bytes, 64);
}

#[test]
fn single_eltwise_reports_caller_inplace_pair() {
    let dims = [16i64];
    let ops = vec![chain_op(0, OpKind::Relu, 0, 1, &dims)];
    let (_sg, planner) = plan(ops, &[f32_lt(0, &dims)], &[f32_lt(1, &dims)], true);
    assert_eq!(planner.plan().unwrap().inplace_pairs, vec![(0, 1)]);
}

#[test]
fn constants_are_promoted_when_the_capability_allows() {
    let dims = [16i64];
    let mut weights = f32_lt(1, &dims);
    weights.property = Property::Constant;
    let ops = vec![
        Op::new(0, OpKind::Add, "add0")
            .with_input(f32_lt(0, &dims))
            .with_input(weights.clone())
            .with_output(f32_lt(2, &dims)),
    ];

    let (sg, planner) = plan(ops.clone(), &[f32_lt(0, &dims), weights.clone()], &[f32_lt(2, &dims)], true);
    let mem_plan = planner.plan().unwrap();
    let weight_value = sg.value_of_tensor(1).unwrap();
    assert!(matches!(mem_plan.bindings[weight_value], Some(MemBinding::Constant { .. })));
    assert_eq!(mem_plan.constant_inputs, vec![(1, 0, 64)]);
    assert_eq!(mem_plan.total_constant_bytes, 64);

    // Capability off: the constant stays a plain external input.
    let (sg, planner) = plan(ops, &[f32_lt(0, &dims), weights], &[f32_lt(2, &dims)], false);
    let mem_plan = planner.plan().unwrap();
    let weight_value = sg.value_of_tensor(1).unwrap();
    assert_eq!(mem_plan.bindings[weight_value], Some(MemBinding::ExternalInput(1)));
    assert_eq!(mem_plan.total_constant_bytes, 0);
}

#[test]
fn externals_bind_positionally() {
    let dims = [8i64];
    let ops = vec![chain_op(0, OpKind::Relu, 0, 1, &dims)];
    let (sg, planner) = plan(ops, &[f32_lt(0, &dims)], &[f32_lt(1, &dims)], true);
    let plan = planner.plan().unwrap();

    for (v, slot) in sg.values.iter().enumerate() {
        match slot.kind {
            ValueKind::ExternalInput(i) => {
                assert_eq!(plan.bindings[v], Some(MemBinding::ExternalInput(i)));
            }
            ValueKind::ExternalOutput(j) => {
                assert_eq!(plan.bindings[v], Some(MemBinding::ExternalOutput(j)));
            }
            ValueKind::Internal => {}
        }
    }
}
