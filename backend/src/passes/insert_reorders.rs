//! Explicit layout conversion around layout-sensitive nodes.
//!
//! The compute-heavy primitives want dense data. Where a caller pinned a
//! non-contiguous layout on an external edge of a conv/matmul, this pass
//! splices in a reorder node so the heavy primitive always sees the layout it
//! prefers; elementwise nodes read strided data directly and are left alone.

use fusor_graph::Layout;
use fusor_graph::error::Result;
use fusor_primitive::memory::contiguous_strides;
use smallvec::SmallVec;
use tracing::trace;

use crate::ir::{InternalKind, NodeAttrs, Subgraph, ValueId, ValueKind};

pub fn insert_reorders(sg: &mut Subgraph) -> Result<()> {
    let layout_sensitive: Vec<ValueId> = sg
        .live_nodes()
        .filter(|(_, node)| matches!(node.kind, InternalKind::Conv | InternalKind::Matmul))
        .flat_map(|(_, node)| node.inputs.iter().chain(node.outputs.iter()).copied())
        .collect();

    let mut changed = false;
    for value in layout_sensitive {
        let slot = sg.value(value);
        if !pinned_non_contiguous(slot) {
            continue;
        }
        match slot.kind {
            ValueKind::ExternalInput(_) => {
                // in(pinned) -> reorder -> dense replica consumed instead.
                let mut replica = slot.lt.clone();
                replica.id = sg.fresh_tensor_id();
                replica.layout = Layout::Any;
                let consumers = sg.value(value).consumers.clone();
                let (reorder, dense) = sg.add_node(
                    InternalKind::Reorder,
                    NodeAttrs::default(),
                    SmallVec::from_slice(&[value]),
                    replica,
                );
                for (consumer, port) in consumers {
                    if consumer != reorder {
                        sg.node_mut(consumer).inputs[port] = dense;
                    }
                }
                trace!(value, "inserted reorder after pinned external input");
                changed = true;
            }
            ValueKind::ExternalOutput(_) => {
                // producer writes a dense replica; reorder materializes the
                // pinned layout.
                let Some((producer, port)) = sg.value(value).producer else {
                    continue;
                };
                let mut replica = sg.value(value).lt.clone();
                replica.id = sg.fresh_tensor_id();
                replica.layout = Layout::Any;
                let dense = sg.new_value(replica, ValueKind::Internal);
                sg.node_mut(producer).outputs[port] = dense;
                sg.add_node_with_output(InternalKind::Reorder, NodeAttrs::default(), SmallVec::from_slice(&[dense]), value);
                trace!(value, "inserted reorder before pinned external output");
                changed = true;
            }
            ValueKind::Internal => {}
        }
    }
    if changed {
        sg.rebuild_links();
    }
    Ok(())
}

fn pinned_non_contiguous(slot: &crate::ir::ValueSlot) -> bool {
    match &slot.lt.layout {
        Layout::Strided(strides) => {
            !slot.lt.has_unknown_dims() && strides.as_slice() != contiguous_strides(&slot.lt.dims).as_slice()
        }
        _ => false,
    }
}
