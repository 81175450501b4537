//! Reference compute primitives.
//!
//! Every primitive validates its descriptors at construction and executes a
//! straightforward strided f32 loop. Construction failure maps onto the
//! backend's invalid-argument / unimplemented taxonomy; execution assumes a
//! successfully constructed primitive and valid pointers.

mod binary;
mod conv;
mod eltwise;
mod matmul;
mod pool;
mod reorder;
mod softmax;
mod sum;

use fusor_dtype::DType;
use smallvec::SmallVec;

pub use binary::{BinaryAlg, BinaryPrimitive};
pub use conv::{ConvDesc, ConvPrimitive, conv_out_dim};
pub use eltwise::{EltwiseAlg, EltwisePrimitive};
pub use matmul::MatmulPrimitive;
pub use pool::{PoolAlg, PoolDesc, PoolPrimitive};
pub use reorder::ReorderPrimitive;
pub use softmax::SoftmaxPrimitive;
pub use sum::SumPrimitive;

use crate::args::{ArgSlot, ExecArgs, MemArg};
use crate::error::{BlockedLayoutUnsupportedSnafu, Result, UnsupportedDTypeSnafu};
use crate::memory::Desc;
use crate::stream::Stream;

/// A compute primitive prepared against concrete descriptors.
pub trait Primitive: std::fmt::Debug + Send + Sync {
    fn kind_name(&self) -> &'static str;

    /// Run the primitive on the given stream.
    ///
    /// # Safety
    ///
    /// Every pointer bound in `args` must be valid for the extent of its
    /// descriptor for the duration of the call, and destination regions must
    /// not be aliased by other threads.
    unsafe fn execute(&self, stream: &Stream, args: &ExecArgs) -> Result<()>;

    /// `(src, dst)` pair where dst may be written into src's buffer.
    fn inplace_candidate(&self) -> Option<(ArgSlot, ArgSlot)> {
        None
    }
}

/// Post-operation fused onto a conv/matmul accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    Eltwise(EltwiseAlg),
    /// Elementwise addition of an extra source bound at
    /// [`ArgSlot::PostOpBinary`] with the slot index equal to the number of
    /// preceding binary post-ops in the chain.
    BinaryAdd,
}

/// The layout this library prefers to compute in.
pub fn preferred_dst_desc(dims: &[i64], dtype: DType) -> Desc {
    Desc::contiguous(dims, dtype)
}

/// Reject dtypes and layouts the reference loops cannot execute.
pub(crate) fn check_executable(desc: &Desc, what: &'static str) -> Result<()> {
    if desc.dtype != DType::F32 {
        return UnsupportedDTypeSnafu { dtype: desc.dtype, what }.fail();
    }
    if desc.is_blocked() {
        return BlockedLayoutUnsupportedSnafu { what }.fail();
    }
    Ok(())
}

/// Odometer increment over `dims`. Returns false when the coordinate wraps
/// back to all-zeros (iteration finished).
pub(crate) fn next_coord(coord: &mut [i64], dims: &[i64]) -> bool {
    for axis in (0..dims.len()).rev() {
        coord[axis] += 1;
        if coord[axis] < dims[axis] {
            return true;
        }
        coord[axis] = 0;
    }
    false
}

pub(crate) unsafe fn read_f32(arg: &MemArg, coord: &[i64]) -> f32 {
    unsafe { *arg.f32_ptr().offset(arg.desc.offset_of(coord) as isize) }
}

pub(crate) unsafe fn write_f32(arg: &MemArg, coord: &[i64], value: f32) {
    unsafe { *arg.f32_ptr().offset(arg.desc.offset_of(coord) as isize) = value }
}

/// Map a destination coordinate onto a (possibly lower-rank, possibly
/// size-1-dim) source, numpy trailing-alignment style.
pub(crate) fn broadcast_coord(dst_coord: &[i64], src_dims: &[i64]) -> SmallVec<[i64; 6]> {
    let shift = dst_coord.len() - src_dims.len();
    src_dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if dim == 1 { 0 } else { dst_coord[axis + shift] })
        .collect()
}

/// Broadcast-read a source at a destination coordinate.
pub(crate) unsafe fn read_broadcast_f32(arg: &MemArg, dst_coord: &[i64]) -> f32 {
    let coord = broadcast_coord(dst_coord, &arg.desc.dims);
    unsafe { read_f32(arg, &coord) }
}

/// Apply a post-op chain to an accumulated value at `dst_coord`.
pub(crate) unsafe fn apply_post_ops(post_ops: &[PostOp], args: &ExecArgs, dst_coord: &[i64], acc: f32) -> Result<f32> {
    let mut value = acc;
    let mut binary_idx = 0usize;
    for post_op in post_ops {
        match post_op {
            PostOp::Eltwise(alg) => value = alg.apply(value),
            PostOp::BinaryAdd => {
                let extra = args.required(ArgSlot::PostOpBinary(binary_idx))?;
                value += unsafe { read_broadcast_f32(extra, dst_coord) };
                binary_idx += 1;
            }
        }
    }
    Ok(value)
}

/// Whether `src_dims` broadcasts to `dst_dims` with trailing alignment.
pub(crate) fn broadcastable(src_dims: &[i64], dst_dims: &[i64]) -> bool {
    if src_dims.len() > dst_dims.len() {
        return false;
    }
    let shift = dst_dims.len() - src_dims.len();
    src_dims.iter().enumerate().all(|(axis, &dim)| dim == 1 || dim == dst_dims[axis + shift])
}
