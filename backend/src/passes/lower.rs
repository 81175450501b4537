//! Lowering: rewrite the partition's graph ops into the internal vocabulary.
//!
//! After this pass only [`InternalKind`] nodes appear in the subgraph, shape
//! inference has filled every previously-unknown dimension, and bias-style
//! additions directly after a convolution or matmul have been folded into the
//! producer's bias input.

use std::collections::{HashMap, HashSet};

use fusor_graph::error::{InternalSnafu, InvalidArgumentsSnafu, InvalidGraphSnafu, Result, UnimplementedSnafu};
use fusor_graph::{LogicalTensor, Op, OpKind, attr};
use fusor_primitive::primitives::{BinaryAlg, EltwiseAlg, PoolAlg};
use smallvec::SmallVec;
use tracing::trace;

use crate::ir::{InternalKind, NodeAttrs, Subgraph, ValueId, ValueKind};
use crate::op_schema::OpSchemaRegistry;

pub fn lower_down(sg: &mut Subgraph) -> Result<()> {
    snafu::ensure!(
        sg.nodes.is_empty(),
        InternalSnafu { reason: "lower_down ran on an already-lowered subgraph".to_string() }
    );
    let ops = std::mem::take(&mut sg.pending_ops);

    // How often each tensor is consumed inside the partition; bias folding
    // must not swallow a value someone else still reads.
    let mut consumer_count: HashMap<u64, usize> = HashMap::new();
    for op in &ops {
        for input in &op.inputs {
            *consumer_count.entry(input.id).or_default() += 1;
        }
    }
    let partition_outputs: HashSet<u64> = sg.given_outputs.iter().map(|lt| lt.id).collect();

    for op in topo_ops(sg, ops)? {
        lower_op(sg, &op, &consumer_count, &partition_outputs)?;
    }

    mark_outputs(sg)?;
    sg.rebuild_links();
    infer_shapes(sg)?;
    Ok(())
}

/// Order the partition ops so producers come before consumers. The matched
/// op list is usually already ordered; this also rejects wiring the matcher
/// could never produce.
fn topo_ops(sg: &Subgraph, mut ops: Vec<Op>) -> Result<Vec<Op>> {
    let mut available: HashSet<u64> = sg.given_inputs.iter().map(|lt| lt.id).collect();
    let mut ordered = Vec::with_capacity(ops.len());
    while !ops.is_empty() {
        let ready = ops.iter().position(|op| op.inputs.iter().all(|lt| available.contains(&lt.id)));
        match ready {
            Some(pos) => {
                let op = ops.remove(pos);
                available.extend(op.outputs.iter().map(|lt| lt.id));
                ordered.push(op);
            }
            None => {
                return InvalidGraphSnafu {
                    reason: "partition ops reference tensors that are neither inputs nor produced".to_string(),
                }
                .fail();
            }
        }
    }
    Ok(ordered)
}

fn lower_op(
    sg: &mut Subgraph,
    op: &Op,
    consumer_count: &HashMap<u64, usize>,
    partition_outputs: &HashSet<u64>,
) -> Result<()> {
    trace!(op = %op.kind, name = %op.name, "lowering");
    match op.kind {
        OpKind::Convolution => {
            let attrs = NodeAttrs {
                strides: attr_pair(op, attr::STRIDES)?,
                pads_begin: attr_pair(op, attr::PADS_BEGIN)?,
                pads_end: attr_pair(op, attr::PADS_END)?,
                dilations: attr_pair(op, attr::DILATIONS)?,
                ..Default::default()
            };
            lower_plain(sg, op, InternalKind::Conv, attrs)
        }
        OpKind::MatMul => lower_plain(sg, op, InternalKind::Matmul, NodeAttrs::default()),
        OpKind::BiasAdd | OpKind::Add if try_fold_bias(sg, op, consumer_count, partition_outputs)? => Ok(()),
        OpKind::BiasAdd => UnimplementedSnafu {
            reason: format!("op {}: bias addition without a fusable producer", op.name),
        }
        .fail(),
        OpKind::Add => lower_binary(sg, op, BinaryAlg::Add),
        OpKind::Subtract => lower_binary(sg, op, BinaryAlg::Subtract),
        OpKind::Multiply => lower_binary(sg, op, BinaryAlg::Multiply),
        OpKind::Divide => lower_binary(sg, op, BinaryAlg::Divide),
        OpKind::Maximum => lower_binary(sg, op, BinaryAlg::Maximum),
        OpKind::Minimum => lower_binary(sg, op, BinaryAlg::Minimum),
        OpKind::Relu => lower_eltwise(sg, op, EltwiseAlg::Relu),
        OpKind::Sigmoid => lower_eltwise(sg, op, EltwiseAlg::Sigmoid),
        OpKind::Tanh => lower_eltwise(sg, op, EltwiseAlg::Tanh),
        OpKind::Softmax => {
            let axis = op.attr_i64(attr::AXIS).unwrap_or(1);
            snafu::ensure!(
                axis >= 0,
                InvalidArgumentsSnafu { reason: format!("op {}: negative softmax axis {axis}", op.name) }
            );
            let attrs = NodeAttrs { axis: Some(axis as usize), ..Default::default() };
            lower_plain(sg, op, InternalKind::Softmax, attrs)
        }
        OpKind::MaxPool | OpKind::AvgPool => {
            let kernel = attr_pair(op, attr::KERNEL)?;
            snafu::ensure!(
                kernel.is_some(),
                InvalidArgumentsSnafu { reason: format!("op {}: pooling without a kernel attribute", op.name) }
            );
            let attrs = NodeAttrs {
                kernel,
                strides: attr_pair(op, attr::STRIDES)?,
                pads_begin: attr_pair(op, attr::PADS_BEGIN)?,
                pads_end: attr_pair(op, attr::PADS_END)?,
                pool: Some(if op.kind == OpKind::MaxPool { PoolAlg::Max } else { PoolAlg::Avg }),
                ..Default::default()
            };
            lower_plain(sg, op, InternalKind::Pool, attrs)
        }
        OpKind::Reorder => lower_plain(sg, op, InternalKind::Reorder, NodeAttrs::default()),
        OpKind::End => UnimplementedSnafu { reason: "End ops are never part of a partition".to_string() }.fail(),
    }
}

fn lower_plain(sg: &mut Subgraph, op: &Op, kind: InternalKind, attrs: NodeAttrs) -> Result<()> {
    let inputs = input_values(sg, op)?;
    let output = single_output(op)?;
    sg.add_node(kind, attrs, inputs, output);
    Ok(())
}

fn lower_binary(sg: &mut Subgraph, op: &Op, alg: BinaryAlg) -> Result<()> {
    let attrs = NodeAttrs { binary: Some(alg), ..Default::default() };
    lower_plain(sg, op, InternalKind::Binary, attrs)
}

fn lower_eltwise(sg: &mut Subgraph, op: &Op, alg: EltwiseAlg) -> Result<()> {
    let attrs = NodeAttrs { eltwise: Some(alg), ..Default::default() };
    lower_plain(sg, op, InternalKind::Eltwise, attrs)
}

/// Fold `Add(conv_out, bias)` / `BiasAdd(conv_out, bias)` with a rank-1 bias
/// into the producing conv/matmul node. Returns false when the op is not a
/// foldable bias addition.
fn try_fold_bias(
    sg: &mut Subgraph,
    op: &Op,
    consumer_count: &HashMap<u64, usize>,
    partition_outputs: &HashSet<u64>,
) -> Result<bool> {
    if op.inputs.len() != 2 {
        return Ok(false);
    }

    // Identify which side is the produced activation and which the bias.
    let candidate = |main: &LogicalTensor, bias: &LogicalTensor| -> Option<ValueId> {
        if bias.rank() != 1 {
            return None;
        }
        let value = sg.value_of_tensor(main.id)?;
        let (producer, _) = sg.value(value).producer?;
        let node = sg.node(producer);
        let foldable = matches!(node.kind, InternalKind::Conv | InternalKind::Matmul) && !node.attrs.with_bias;
        (foldable && consumer_count.get(&main.id) == Some(&1) && !partition_outputs.contains(&main.id))
            .then_some(value)
    };

    let (main_value, bias_lt) = match op.kind {
        // BiasAdd is (data, bias) by definition.
        OpKind::BiasAdd => match candidate(&op.inputs[0], &op.inputs[1]) {
            Some(v) => (v, &op.inputs[1]),
            None => return Ok(false),
        },
        // Plain Add accepts the bias on either side.
        _ => match candidate(&op.inputs[0], &op.inputs[1]) {
            Some(v) => (v, &op.inputs[1]),
            None => match candidate(&op.inputs[1], &op.inputs[0]) {
                Some(v) => (v, &op.inputs[0]),
                None => return Ok(false),
            },
        },
    };

    let bias_value = match sg.value_of_tensor(bias_lt.id) {
        Some(v) => v,
        None => {
            return InvalidGraphSnafu { reason: format!("op {}: bias tensor {} is not available", op.name, bias_lt.id) }
                .fail();
        }
    };
    let output = single_output(op)?;

    let (producer, _) = sg.value(main_value).producer.expect("candidate checked the producer");
    let node = sg.node_mut(producer);
    node.attrs.with_bias = true;
    node.inputs.insert(2, bias_value);

    // The folded node now produces the addition's output tensor: rebind the
    // producer's output slot to it.
    let out_value = node.outputs[0];
    sg.tensor_to_value.insert(output.id, out_value);
    sg.value_mut(out_value).lt = output;
    trace!(op = %op.name, "folded bias addition into producer");
    Ok(true)
}

fn input_values(sg: &Subgraph, op: &Op) -> Result<SmallVec<[ValueId; 4]>> {
    op.inputs
        .iter()
        .map(|lt| match sg.value_of_tensor(lt.id) {
            Some(value) => Ok(value),
            None => InvalidGraphSnafu { reason: format!("op {}: tensor {} is not available", op.name, lt.id) }.fail(),
        })
        .collect()
}

fn single_output(op: &Op) -> Result<LogicalTensor> {
    snafu::ensure!(
        op.outputs.len() == 1,
        InvalidGraphSnafu { reason: format!("op {} has {} outputs, expected 1", op.name, op.outputs.len()) }
    );
    Ok(op.outputs[0].clone())
}

fn attr_pair(op: &Op, name: &str) -> Result<Option<[i64; 2]>> {
    match op.attr_i64s(name) {
        None => Ok(None),
        Some(values) => match <[i64; 2]>::try_from(values) {
            Ok(pair) => Ok(Some(pair)),
            Err(_) => InvalidArgumentsSnafu {
                reason: format!("op {}: attribute {name} has {} values, expected 2", op.name, values.len()),
            }
            .fail(),
        },
    }
}

/// Bind the partition outputs to their producing values.
fn mark_outputs(sg: &mut Subgraph) -> Result<()> {
    for (j, lt) in sg.given_outputs.clone().iter().enumerate() {
        let value = match sg.value_of_tensor(lt.id) {
            Some(v) => v,
            None => {
                return InvalidGraphSnafu { reason: format!("partition output tensor {} is never produced", lt.id) }
                    .fail();
            }
        };
        sg.value_mut(value).kind = ValueKind::ExternalOutput(j);
        sg.outputs.push(value);
    }
    Ok(())
}

/// Validate every node against its schema and fill unknown output dims.
fn infer_shapes(sg: &mut Subgraph) -> Result<()> {
    let schemas = OpSchemaRegistry::new();
    let order = sg.topo_order()?;
    for op_id in order {
        let node = sg.node(op_id);
        let base = node.base_arity();
        let input_ids: Vec<ValueId> = node.inputs[..base].to_vec();
        let (kind, attrs) = (node.kind, node.attrs.clone());
        let output = node.outputs[0];

        let input_dims: Vec<&[i64]> = input_ids.iter().map(|&v| sg.value(v).lt.dims.as_slice()).collect();
        let input_dtypes: Vec<_> = input_ids.iter().map(|&v| sg.value(v).lt.dtype).collect();
        let inferred = schemas.validate_and_infer(kind, &attrs, &input_dims, &input_dtypes)?;

        let declared = &sg.value(output).lt.dims;
        if !declared.is_empty() && !sg.value(output).lt.has_unknown_dims() {
            snafu::ensure!(
                *declared == inferred,
                InvalidArgumentsSnafu {
                    reason: format!("{kind} output dims {declared:?} disagree with inferred {inferred:?}"),
                }
            );
        } else {
            trace!(node = %kind, dims = ?inferred, "filled output dims");
            sg.value_mut(output).lt.dims = inferred;
        }
    }
    Ok(())
}
