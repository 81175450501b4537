//! The registered pattern set.
//!
//! Grouped the way the backend registers them: conv fusions, matmul fusions,
//! binary/sum fusions, pool fusions, then the single-op debug pass-throughs.
//! Within a priority band, registration order is the tie-break.

use fusor_graph::{Op, OpKind};

use super::{Pattern, PatternRegistry};
use crate::kernels::KernelKind;
use crate::op_schema::broadcast_dims;

const ELTWISE: &[OpKind] = &[OpKind::Relu, OpKind::Sigmoid, OpKind::Tanh];
const BIAS_OR_ADD: &[OpKind] = &[OpKind::Add, OpKind::BiasAdd];

/// Either a plain broadcastable add, or a bias-style add with a rank-1 side.
fn addable(op: &Op) -> bool {
    if op.inputs.len() != 2 {
        return false;
    }
    let (a, b) = (&op.inputs[0], &op.inputs[1]);
    broadcast_dims(&a.dims, &b.dims).is_ok() || a.rank() == 1 || b.rank() == 1
}

/// Two inputs of identical, fully-known dims: a sum-chain link.
fn same_dims(op: &Op) -> bool {
    op.inputs.len() == 2
        && op.inputs[0].dims == op.inputs[1].dims
        && !op.inputs[0].dims.is_empty()
        && !op.inputs[0].has_unknown_dims()
}

/// Broadcast-compatible binary op.
fn broadcastable(op: &Op) -> bool {
    op.inputs.len() == 2 && broadcast_dims(&op.inputs[0].dims, &op.inputs[1].dims).is_ok()
}

pub fn register_conv_fusions(registry: &mut PatternRegistry) {
    // Large band: conv with a multi-stage post-op tail.
    registry.register(
        Pattern::def("conv_bias_add_eltwise_block", 22.0, KernelKind::LargePartition)
            .op(&[OpKind::Convolution])
            .op_from(BIAS_OR_ADD, &[0])
            .check(addable)
            .op_from(&[OpKind::Add], &[1])
            .check(addable)
            .op_from(ELTWISE, &[2])
            .build(),
    );
    registry.register(
        Pattern::def("conv_bias_eltwise_block", 21.0, KernelKind::LargePartition)
            .op(&[OpKind::Convolution])
            .op_from(BIAS_OR_ADD, &[0])
            .check(addable)
            .op_from(ELTWISE, &[1])
            .build(),
    );

    // Normal band: single-anchor conv fusions.
    registry.register(
        Pattern::def("conv_bias", 9.8, KernelKind::Conv)
            .op(&[OpKind::Convolution])
            .op_from(BIAS_OR_ADD, &[0])
            .check(addable)
            .build(),
    );
    registry.register(
        Pattern::def("conv_eltwise", 9.7, KernelKind::Conv)
            .op(&[OpKind::Convolution])
            .op_from(ELTWISE, &[0])
            .build(),
    );
}

pub fn register_matmul_fusions(registry: &mut PatternRegistry) {
    registry.register(
        Pattern::def("matmul_bias", 9.6, KernelKind::Matmul)
            .op(&[OpKind::MatMul])
            .op_from(BIAS_OR_ADD, &[0])
            .check(addable)
            .build(),
    );
    registry.register(
        Pattern::def("matmul_eltwise", 9.5, KernelKind::Matmul)
            .op(&[OpKind::MatMul])
            .op_from(ELTWISE, &[0])
            .build(),
    );
}

pub fn register_binary_fusions(registry: &mut PatternRegistry) {
    // Longest add-chains first so the greedy pass prefers them.
    registry.register(
        Pattern::def("sum_chain3", 9.2, KernelKind::Sum)
            .op(&[OpKind::Add])
            .check(same_dims)
            .op_from(&[OpKind::Add], &[0])
            .check(same_dims)
            .op_from(&[OpKind::Add], &[1])
            .check(same_dims)
            .build(),
    );
    registry.register(
        Pattern::def("sum_chain2", 9.1, KernelKind::Sum)
            .op(&[OpKind::Add])
            .check(same_dims)
            .op_from(&[OpKind::Add], &[0])
            .check(same_dims)
            .build(),
    );
    registry.register(
        Pattern::def("binary_eltwise", 8.5, KernelKind::Binary)
            .op(&[
                OpKind::Add,
                OpKind::Subtract,
                OpKind::Multiply,
                OpKind::Divide,
                OpKind::Maximum,
                OpKind::Minimum,
            ])
            .check(broadcastable)
            .op_from(ELTWISE, &[0])
            .build(),
    );
}

pub fn register_pool_fusions(registry: &mut PatternRegistry) {
    registry.register(
        Pattern::def("pool_eltwise", 8.1, KernelKind::Pool)
            .op(&[OpKind::MaxPool, OpKind::AvgPool])
            .op_from(ELTWISE, &[0])
            .build(),
    );
}

/// Debug band: each recognized op alone becomes its own partition.
pub fn register_single_op_passes(registry: &mut PatternRegistry) {
    let singles: &[(&'static str, &[OpKind], KernelKind)] = &[
        ("conv_pass", &[OpKind::Convolution], KernelKind::Conv),
        ("matmul_pass", &[OpKind::MatMul], KernelKind::Matmul),
        ("add_pass", &[OpKind::Add], KernelKind::Binary),
        ("subtract_pass", &[OpKind::Subtract], KernelKind::Binary),
        ("multiply_pass", &[OpKind::Multiply], KernelKind::Binary),
        ("divide_pass", &[OpKind::Divide], KernelKind::Binary),
        ("maximum_pass", &[OpKind::Maximum], KernelKind::Binary),
        ("minimum_pass", &[OpKind::Minimum], KernelKind::Binary),
        ("relu_pass", &[OpKind::Relu], KernelKind::Eltwise),
        ("sigmoid_pass", &[OpKind::Sigmoid], KernelKind::Eltwise),
        ("tanh_pass", &[OpKind::Tanh], KernelKind::Eltwise),
        ("softmax_pass", &[OpKind::Softmax], KernelKind::Softmax),
        ("max_pool_pass", &[OpKind::MaxPool], KernelKind::Pool),
        ("avg_pool_pass", &[OpKind::AvgPool], KernelKind::Pool),
        ("reorder_pass", &[OpKind::Reorder], KernelKind::Reorder),
    ];
    for &(name, kinds, kernel) in singles {
        let mut builder = Pattern::def(name, 8.0, kernel).op(kinds);
        if kernel == KernelKind::Binary {
            builder = builder.check(broadcastable);
        }
        registry.register(builder.build());
    }
}

/// Everything, in the backend's registration order.
pub fn register_all(registry: &mut PatternRegistry) {
    register_conv_fusions(registry);
    register_matmul_fusions(registry);
    register_binary_fusions(registry);
    register_pool_fusions(registry);
    register_single_op_passes(registry);
    registry.sort();
}
