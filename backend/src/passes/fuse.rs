//! Fusion passes: collapse neighboring internal nodes into the single fused
//! primitives the library exposes.

use std::collections::HashMap;

use fusor_primitive::primitives::{BinaryAlg, PostOp};
use smallvec::SmallVec;
use tracing::trace;

use fusor_graph::error::Result;

use crate::ir::{InternalKind, NodeAttrs, OpId, Subgraph, ValueId, ValueKind};
use crate::op_schema::broadcast_dims;

/// Absorb eltwise and additive successors of conv/matmul/binary anchors as
/// post-ops. Runs to a fixpoint so whole tails collapse into one node.
pub fn fuse_post_ops(sg: &mut Subgraph) -> Result<()> {
    loop {
        let Some((anchor, succ, post_op, extra)) = find_absorbable(sg)? else {
            break;
        };
        let succ_out = sg.node(succ).outputs[0];
        sg.remove_node(succ);

        let node = sg.node_mut(anchor);
        trace!(anchor = %node.kind, ?post_op, "absorbing successor as post-op");
        node.post_ops.push(post_op);
        if let Some(extra) = extra {
            node.inputs.push(extra);
        }
        node.outputs[0] = succ_out;
        sg.rebuild_links();
    }
    Ok(())
}

fn find_absorbable(sg: &Subgraph) -> Result<Option<(OpId, OpId, PostOp, Option<ValueId>)>> {
    let order = sg.topo_order()?;
    let position: HashMap<OpId, usize> = order.iter().enumerate().map(|(pos, &id)| (id, pos)).collect();

    for &anchor in &order {
        let node = sg.node(anchor);
        if !matches!(node.kind, InternalKind::Conv | InternalKind::Matmul | InternalKind::Binary) {
            continue;
        }
        let out = node.outputs[0];
        let slot = sg.value(out);
        // Fusing across an externally visible value would erase it.
        if slot.kind != ValueKind::Internal || slot.consumers.len() != 1 {
            continue;
        }
        let (succ, port) = slot.consumers[0];
        let succ_node = sg.node(succ);

        match succ_node.kind {
            InternalKind::Eltwise if succ_node.post_ops.is_empty() => {
                let alg = succ_node.attrs.eltwise.expect("eltwise node without algorithm");
                return Ok(Some((anchor, succ, PostOp::Eltwise(alg), None)));
            }
            // Only commutative addition can ride the accumulator.
            InternalKind::Binary
                if succ_node.attrs.binary == Some(BinaryAlg::Add)
                    && succ_node.post_ops.is_empty()
                    && matches!(node.kind, InternalKind::Conv | InternalKind::Matmul) =>
            {
                let extra = succ_node.inputs[1 - port];
                let extra_slot = sg.value(extra);
                let dst_dims = &sg.value(succ_node.outputs[0]).lt.dims;

                // The extra operand must broadcast onto the fused output and
                // must already exist when the anchor runs.
                let broadcasts = broadcast_dims(&extra_slot.lt.dims, dst_dims)
                    .is_ok_and(|broadcast| &broadcast == dst_dims);
                let available = match extra_slot.producer {
                    None => true,
                    Some((producer, _)) => position.get(&producer) < position.get(&anchor),
                };
                if broadcasts && available {
                    return Ok(Some((anchor, succ, PostOp::BinaryAdd, Some(extra))));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Collapse chains of two-input additions into one n-ary sum node.
pub fn fuse_to_sum(sg: &mut Subgraph) -> Result<()> {
    loop {
        let Some(root) = find_chain_root(sg)? else {
            break;
        };
        let mut leaves: SmallVec<[ValueId; 4]> = SmallVec::new();
        let mut chain: Vec<OpId> = Vec::new();
        collect_leaves(sg, root, &mut leaves, &mut chain);
        if leaves.len() <= 2 {
            break;
        }

        let output = sg.node(root).outputs[0];
        trace!(n_inputs = leaves.len(), n_folded = chain.len(), "collapsing add chain into sum");
        for op in chain {
            sg.remove_node(op);
        }
        sg.add_node_with_output(InternalKind::Sum, NodeAttrs::default(), leaves, output);
        sg.rebuild_links();
    }
    Ok(())
}

/// A plain same-dims addition node.
fn is_chain_add(sg: &Subgraph, op: OpId) -> bool {
    let node = sg.node(op);
    node.kind == InternalKind::Binary
        && node.attrs.binary == Some(BinaryAlg::Add)
        && node.post_ops.is_empty()
        && node.inputs.iter().all(|&v| sg.value(v).lt.dims == sg.value(node.outputs[0]).lt.dims)
}

/// The last addition of a chain of at least two fusable additions.
fn find_chain_root(sg: &Subgraph) -> Result<Option<OpId>> {
    for &op in sg.topo_order()?.iter().rev() {
        if !is_chain_add(sg, op) {
            continue;
        }
        let feeds_another_add = {
            let out = sg.value(sg.node(op).outputs[0]);
            out.kind == ValueKind::Internal
                && out.consumers.len() == 1
                && is_chain_add(sg, out.consumers[0].0)
        };
        if feeds_another_add {
            continue;
        }
        // Root found; is anything below it foldable?
        let has_chain = sg.node(op).inputs.iter().any(|&v| foldable_link(sg, v));
        if has_chain {
            return Ok(Some(op));
        }
    }
    Ok(None)
}

/// Whether this value is an internal single-consumer output of another
/// fusable addition (a link that can be dissolved into the sum).
fn foldable_link(sg: &Subgraph, value: ValueId) -> bool {
    let slot = sg.value(value);
    slot.kind == ValueKind::Internal
        && slot.consumers.len() == 1
        && slot.producer.is_some_and(|(producer, _)| is_chain_add(sg, producer))
}

/// Depth-first, left-to-right expansion of the chain into its leaf values.
fn collect_leaves(sg: &Subgraph, op: OpId, leaves: &mut SmallVec<[ValueId; 4]>, chain: &mut Vec<OpId>) {
    chain.push(op);
    let inputs = sg.node(op).inputs.clone();
    for value in inputs {
        if foldable_link(sg, value) {
            let (producer, _) = sg.value(value).producer.expect("foldable link has a producer");
            collect_leaves(sg, producer, leaves, chain);
        } else {
            leaves.push(value);
        }
    }
}
