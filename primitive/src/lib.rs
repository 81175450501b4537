//! The primitive library: concrete memory descriptors, engines, streams and
//! reference compute primitives.
//!
//! The graph backend sits on top of this crate the way it would sit on a
//! vendor BLAS/DNN library: it converts logical tensors into [`memory::Desc`]s,
//! instantiates primitives against an [`Engine`], and submits them to a
//! [`Stream`]. The primitives here are deliberately naive single-threaded f32
//! implementations - correct reference semantics, not performance.

pub mod args;
pub mod engine;
pub mod error;
pub mod memory;
pub mod primitives;
pub mod stream;

pub use args::{ArgSlot, ExecArgs, MemArg};
pub use engine::{Allocation, Allocator, Engine, SystemAllocator};
pub use error::{Error, Result};
pub use primitives::{
    BinaryAlg, BinaryPrimitive, ConvDesc, ConvPrimitive, EltwiseAlg, EltwisePrimitive, MatmulPrimitive, PoolAlg,
    PoolDesc, PoolPrimitive, PostOp, Primitive, ReorderPrimitive, SoftmaxPrimitive, SumPrimitive, conv_out_dim,
    preferred_dst_desc,
};
pub use stream::{CompletionToken, Stream};
