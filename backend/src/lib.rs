//! The fusor compilation backend.
//!
//! Given a user graph, the backend discovers fusable subgraphs through a
//! priority-ordered pattern registry, hands them back as partitions, and
//! compiles each partition through a fixed pass pipeline - lowering, fusion,
//! reorder insertion, layout propagation, memory planning, op compilation -
//! into a kernel that executes the whole partition as a chain of primitives.
//!
//! # Module Organization
//!
//! - [`layout_id`] - interning of opaque memory descriptors behind stable ids
//! - [`ir`] - the mutable per-partition subgraph representation
//! - [`op_schema`] - internal op vocabulary: arities, dtypes, shape inference
//! - [`patterns`] - pattern templates, registry and the greedy matcher
//! - [`pass_manager`] - policy-driven pattern application over a user graph
//! - [`passes`] - the subgraph pass pipeline
//! - [`kernels`] - the compile/execute kernel machinery
//! - [`backend`] - the facade registered with the process-wide registry

pub mod backend;
pub mod desc;
pub mod ir;
pub mod kernels;
pub mod layout_id;
pub mod op_schema;
pub mod partition;
pub mod pass_manager;
pub mod passes;
pub mod patterns;

#[cfg(test)]
pub mod test;

pub use backend::{FusorBackend, register_fusor_backend};
pub use kernels::{KernelKind, SubgraphKernel, set_constant_cache_enabled};
pub use layout_id::{LayoutId, LayoutIdManager};
pub use partition::FusorPartition;
