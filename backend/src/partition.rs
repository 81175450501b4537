//! The backend's partition type: a matched op set plus the kernel kind that
//! will execute it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fusor_dtype::EngineKind;
use fusor_graph::error::Result;
use fusor_graph::{CompiledPartition, Engine, LogicalTensor, Op, Partition};

use crate::ir::FpMathMode;
use crate::kernels::{KernelKind, SubgraphKernel};

static PARTITION_IDS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub struct FusorPartition {
    id: usize,
    kernel: KernelKind,
    pattern_name: &'static str,
    ops: Vec<Op>,
    op_ids: Vec<u64>,
    inputs: Vec<LogicalTensor>,
    outputs: Vec<LogicalTensor>,
    engine_kind: EngineKind,
    fpmath: FpMathMode,
    use_blocked_layout: bool,
}

impl FusorPartition {
    pub fn new(
        kernel: KernelKind,
        pattern_name: &'static str,
        ops: Vec<Op>,
        inputs: Vec<LogicalTensor>,
        outputs: Vec<LogicalTensor>,
        engine_kind: EngineKind,
    ) -> Self {
        let op_ids = ops.iter().map(|op| op.id).collect();
        Self {
            id: PARTITION_IDS.fetch_add(1, Ordering::Relaxed),
            kernel,
            pattern_name,
            ops,
            op_ids,
            inputs,
            outputs,
            engine_kind,
            fpmath: FpMathMode::Strict,
            use_blocked_layout: false,
        }
    }

    pub fn kernel_kind(&self) -> KernelKind {
        self.kernel
    }

    /// Name of the pattern that carved this partition out.
    pub fn pattern_name(&self) -> &'static str {
        self.pattern_name
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn fpmath(&self) -> FpMathMode {
        self.fpmath
    }

    pub fn with_fpmath(mut self, fpmath: FpMathMode) -> Self {
        self.fpmath = fpmath;
        self
    }

    pub fn use_blocked_layout(&self) -> bool {
        self.use_blocked_layout
    }

    /// Ask compile to report unspecified output layouts as opaque layout ids
    /// instead of strides.
    pub fn with_blocked_layout(mut self) -> Self {
        self.use_blocked_layout = true;
        self
    }
}

impl Partition for FusorPartition {
    fn id(&self) -> usize {
        self.id
    }

    fn op_ids(&self) -> &[u64] {
        &self.op_ids
    }

    fn inputs(&self) -> &[LogicalTensor] {
        &self.inputs
    }

    fn outputs(&self) -> &[LogicalTensor] {
        &self.outputs
    }

    fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    fn backend_name(&self) -> &str {
        crate::backend::FusorBackend::NAME
    }

    fn compile(
        &self,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
        engine: &Engine,
    ) -> Result<CompiledPartition> {
        let mut kernel = SubgraphKernel::new(self.kernel);
        kernel.compile(self, engine, inputs, outputs)?;
        Ok(CompiledPartition::new(
            kernel.compiled_inputs().to_vec(),
            kernel.compiled_outputs().to_vec(),
            Arc::new(kernel),
        ))
    }
}
