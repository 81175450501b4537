//! Partitions: contiguous subgraphs claimed by a backend as one execution
//! unit, and the compiled artifacts they turn into.

use std::sync::Arc;

use fusor_dtype::EngineKind;
use fusor_primitive::{CompletionToken, Engine, Stream};

use crate::error::Result;
use crate::logical_tensor::LogicalTensor;
use crate::tensor::Tensor;

/// How aggressively the pass manager fuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Full fusion: every pattern the backend registered is in play.
    Fusion,
    /// Each recognized op becomes its own partition.
    Debug,
}

/// A subgraph claimed by one backend. Concrete types live in the backend that
/// produced the partition.
pub trait Partition: Send + Sync + std::fmt::Debug {
    fn id(&self) -> usize;
    /// Ids of the original graph ops this partition carved out.
    fn op_ids(&self) -> &[u64];
    fn inputs(&self) -> &[LogicalTensor];
    fn outputs(&self) -> &[LogicalTensor];
    fn engine_kind(&self) -> EngineKind;
    fn backend_name(&self) -> &str;

    /// Compile against an engine. The returned partition carries logical
    /// tensors with previously-unknown dims and layouts filled in.
    fn compile(&self, inputs: &[LogicalTensor], outputs: &[LogicalTensor], engine: &Engine)
    -> Result<CompiledPartition>;
}

/// Execution surface of a compiled partition. Implemented by backend kernels.
pub trait CompiledKernel: Send + Sync {
    /// Submit all work to the stream and block until submission completes.
    fn execute(&self, stream: &Stream, inputs: &[Tensor], outputs: &[Tensor]) -> Result<()>;

    /// Asynchronous variant: chain after `deps`, return a token covering all
    /// submitted work.
    fn execute_async(
        &self,
        stream: &Stream,
        inputs: &[Tensor],
        outputs: &[Tensor],
        deps: &[CompletionToken],
    ) -> Result<CompletionToken>;

    /// `(input tensor id, output tensor id)` pairs where the output may share
    /// the input's buffer.
    fn inplace_pairs(&self) -> &[(u64, u64)] {
        &[]
    }
}

/// A compiled partition: filled logical tensors plus the kernel to run.
#[derive(Clone)]
pub struct CompiledPartition {
    inputs: Vec<LogicalTensor>,
    outputs: Vec<LogicalTensor>,
    kernel: Arc<dyn CompiledKernel>,
}

impl CompiledPartition {
    pub fn new(inputs: Vec<LogicalTensor>, outputs: Vec<LogicalTensor>, kernel: Arc<dyn CompiledKernel>) -> Self {
        Self { inputs, outputs, kernel }
    }

    /// Input logical tensors with backend-filled dims/layouts.
    pub fn inputs(&self) -> &[LogicalTensor] {
        &self.inputs
    }

    /// Output logical tensors with backend-filled dims/layouts.
    pub fn outputs(&self) -> &[LogicalTensor] {
        &self.outputs
    }

    pub fn inplace_pairs(&self) -> &[(u64, u64)] {
        self.kernel.inplace_pairs()
    }

    pub fn execute(&self, stream: &Stream, inputs: &[Tensor], outputs: &[Tensor]) -> Result<()> {
        self.kernel.execute(stream, inputs, outputs)
    }

    pub fn execute_async(
        &self,
        stream: &Stream,
        inputs: &[Tensor],
        outputs: &[Tensor],
        deps: &[CompletionToken],
    ) -> Result<CompletionToken> {
        self.kernel.execute_async(stream, inputs, outputs, deps)
    }
}

impl std::fmt::Debug for CompiledPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPartition")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
