//! Logical tensor to memory descriptor conversion.
//!
//! Every size or equality question about a logical tensor is answered by
//! converting it to a concrete [`Desc`] first; opaque layouts round-trip
//! through the layout-id manager.

use fusor_graph::error::{InvalidArgumentsSnafu, Result};
use fusor_graph::{Layout, LogicalTensor};
use fusor_primitive::memory::Desc;

use crate::layout_id::{LayoutId, LayoutIdManager};

/// Concretize a logical tensor into a memory descriptor.
pub fn make_memory_desc(lt: &LogicalTensor, layouts: &LayoutIdManager) -> Result<Desc> {
    snafu::ensure!(
        !lt.has_unknown_dims(),
        InvalidArgumentsSnafu { reason: format!("tensor {} has unknown dims {:?}", lt.id, lt.dims) }
    );

    match &lt.layout {
        Layout::Any => Ok(Desc::contiguous(&lt.dims, lt.dtype)),
        Layout::Strided(strides) => {
            snafu::ensure!(
                strides.len() == lt.dims.len(),
                InvalidArgumentsSnafu {
                    reason: format!("tensor {}: {} strides for {} dims", lt.id, strides.len(), lt.dims.len()),
                }
            );
            Ok(Desc::strided(&lt.dims, strides, lt.dtype))
        }
        Layout::Opaque(id) => resolve_opaque(lt, LayoutId(*id), layouts),
    }
}

#[cfg(not(feature = "layout-debug"))]
fn resolve_opaque(lt: &LogicalTensor, id: LayoutId, layouts: &LayoutIdManager) -> Result<Desc> {
    match layouts.lookup(id) {
        Some(desc) => Ok(desc),
        None => InvalidArgumentsSnafu { reason: format!("tensor {} references unknown layout id {}", lt.id, id.0) }
            .fail(),
    }
}

/// With tag-biased ids, small ids are plain tags reconstructed against the
/// tensor's own dims; everything else resolves through the manager.
#[cfg(feature = "layout-debug")]
fn resolve_opaque(lt: &LogicalTensor, id: LayoutId, layouts: &LayoutIdManager) -> Result<Desc> {
    use fusor_primitive::memory::FormatTag;

    if let Some(desc) = layouts.lookup(id) {
        return Ok(desc);
    }
    if let Some(tag) = FormatTag::from_index(id.0 as usize)
        && tag != FormatTag::Undef
        && let Ok(desc) = Desc::with_tag(&lt.dims, lt.dtype, tag)
    {
        return Ok(desc);
    }
    InvalidArgumentsSnafu { reason: format!("tensor {} references unknown layout id {}", lt.id, id.0) }.fail()
}

/// Return a copy of `lt` with dims and layout filled from the concrete
/// descriptor the backend chose. A caller-pinned layout is left untouched;
/// an unspecified one becomes strided, or an interned opaque id when the
/// blocked-layout policy asks for ids (or the format has no strides at all).
pub fn fill_logical_tensor(
    lt: &LogicalTensor,
    desc: &Desc,
    prefer_opaque: bool,
    layouts: &LayoutIdManager,
) -> LogicalTensor {
    let mut filled = lt.clone();
    filled.dims = desc.dims.clone();
    if matches!(lt.layout, Layout::Any) {
        filled.layout = match desc.strides() {
            Some(strides) if !prefer_opaque => Layout::Strided(strides.into()),
            _ => Layout::Opaque(layouts.intern(desc).0),
        };
    }
    filled
}
