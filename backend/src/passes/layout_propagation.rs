//! Assign a concrete memory descriptor to every value.
//!
//! Walks the subgraph in topological order. Caller-pinned strided layouts are
//! honored as-is, opaque layout ids resolve through the backend's layout-id
//! manager, and everything left unspecified takes the primitive library's
//! preferred (dense) form. After this pass no value is layout-less; the
//! memory planner depends on that.

use fusor_graph::Layout;
use fusor_graph::error::{InternalSnafu, Result};
use fusor_primitive::preferred_dst_desc;
use tracing::trace;

use crate::backend::FusorBackend;
use crate::desc::make_memory_desc;
use crate::ir::{Subgraph, ValueId};

pub fn layout_propagation(sg: &mut Subgraph) -> Result<()> {
    let order = sg.topo_order()?;
    let mut worklist: Vec<ValueId> = Vec::new();
    for &op in &order {
        let node = sg.node(op);
        worklist.extend(node.inputs.iter().copied());
        worklist.extend(node.outputs.iter().copied());
    }
    // Externals nothing consumes still need descriptors for back-fill.
    worklist.extend(sg.input_values().iter().copied());
    worklist.extend(sg.output_values().iter().copied());

    for value in worklist {
        if sg.value(value).desc.is_some() {
            continue;
        }
        let lt = &sg.value(value).lt;
        snafu::ensure!(
            !lt.has_unknown_dims(),
            InternalSnafu { reason: format!("value of tensor {} reached layout propagation with unknown dims", lt.id) }
        );
        let desc = match &lt.layout {
            Layout::Any => preferred_dst_desc(&lt.dims, lt.dtype),
            _ => make_memory_desc(lt, FusorBackend::get().layout_ids())?,
        };
        trace!(tensor = lt.id, dims = ?desc.dims, "assigned memory descriptor");
        sg.value_mut(value).desc = Some(desc);
    }
    Ok(())
}
