//! Kernels: the artifact a partition compiles into.
//!
//! Every kernel kind shares the same machinery - build a subgraph from the
//! partition, run a pass pipeline over it, then execute the compiled
//! executables in topological order against per-thread cached resources and
//! a per-call scratchpad. Kinds differ only in which fusion passes the
//! pipeline runs.

pub mod constant_cache;
pub mod thread_cache;

use std::sync::Arc;

use fusor_graph::error::{InternalSnafu, InvalidArgumentsSnafu, OutOfMemorySnafu, Result};
use fusor_graph::{CompiledKernel, LogicalTensor, Partition, Tensor};
use fusor_primitive::{Allocation, CompletionToken, Engine, Stream};
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::backend::FusorBackend;
use crate::desc::fill_logical_tensor;
use crate::ir::Subgraph;
use crate::partition::FusorPartition;
use crate::passes::{
    ExecResource, MemoryPlan, MemoryPlanner, PassPipeline, SubgraphVisualizer, compile_ops, fuse_post_ops,
    fuse_to_sum, insert_reorders, layout_propagation, lower_down,
};

pub use constant_cache::{constant_cache_enabled, constant_cache_enabled_for, set_constant_cache_enabled};
pub use thread_cache::KernelId;

/// Which fused kernel executes a matched pattern. Kinds share the execute
/// machinery and differ in the fusion passes their pipelines invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum KernelKind {
    Conv,
    Matmul,
    Binary,
    Eltwise,
    Sum,
    Pool,
    Softmax,
    Reorder,
    LargePartition,
}

/// A compiled partition kernel.
///
/// `compile` is single-threaded per kernel; after it succeeds the subgraph is
/// frozen and `execute` is safe from any number of threads, provided each
/// caller brings its own tensors and stream.
pub struct SubgraphKernel {
    kind: KernelKind,
    id: KernelId,
    engine: Option<Engine>,
    subgraph: Option<Arc<Subgraph>>,
    plan: Option<Arc<MemoryPlan>>,
    /// Persistent constant region, populated on first execute.
    constants: OnceCell<Allocation>,
    compiled_inputs: Vec<LogicalTensor>,
    compiled_outputs: Vec<LogicalTensor>,
}

impl SubgraphKernel {
    pub fn new(kind: KernelKind) -> Self {
        Self {
            kind,
            id: KernelId::fresh(),
            engine: None,
            subgraph: None,
            plan: None,
            constants: OnceCell::new(),
            compiled_inputs: Vec::new(),
            compiled_outputs: Vec::new(),
        }
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    /// Input logical tensors with backend-filled dims and layouts.
    pub fn compiled_inputs(&self) -> &[LogicalTensor] {
        &self.compiled_inputs
    }

    pub fn compiled_outputs(&self) -> &[LogicalTensor] {
        &self.compiled_outputs
    }

    pub fn subgraph(&self) -> Option<&Arc<Subgraph>> {
        self.subgraph.as_ref()
    }

    pub fn compile(
        &mut self,
        partition: &FusorPartition,
        engine: &Engine,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
    ) -> Result<()> {
        snafu::ensure!(
            engine.kind() == partition.engine_kind(),
            InvalidArgumentsSnafu {
                reason: format!("partition targets {} but engine is {}", partition.engine_kind(), engine.kind()),
            }
        );

        let mut sg = Subgraph::new(
            partition.ops().to_vec(),
            inputs,
            outputs,
            engine.clone(),
            partition.fpmath(),
            partition.use_blocked_layout(),
        )?;

        let mut planner = MemoryPlanner::new(constant_cache_enabled_for(engine.kind()));
        let visualizer = SubgraphVisualizer::new(partition.id());
        let mut pipeline = PassPipeline::new(Some(visualizer)).add("lower_down", lower_down);
        match self.kind {
            KernelKind::Sum => {
                pipeline = pipeline.add("fuse_to_sum", fuse_to_sum);
            }
            KernelKind::Conv | KernelKind::Matmul | KernelKind::Binary => {
                pipeline = pipeline.add("fuse_post_ops", fuse_post_ops);
            }
            KernelKind::LargePartition => {
                pipeline = pipeline.add("fuse_post_ops", fuse_post_ops).add("fuse_to_sum", fuse_to_sum);
            }
            KernelKind::Eltwise | KernelKind::Pool | KernelKind::Softmax | KernelKind::Reorder => {}
        }
        pipeline = pipeline
            .add("insert_reorders", insert_reorders)
            .add("layout_propagation", layout_propagation)
            .add("memory_planning", |sg: &mut Subgraph| planner.run(sg))
            .add("compile_ops", compile_ops);
        pipeline.run(&mut sg)?;

        let layouts = FusorBackend::get().layout_ids();
        self.compiled_inputs = sg
            .input_values()
            .iter()
            .zip(inputs)
            .map(|(&value, lt)| {
                let desc = sg.value(value).desc.as_ref().expect("layout propagation covered externals");
                fill_logical_tensor(lt, desc, false, layouts)
            })
            .collect();
        self.compiled_outputs = sg
            .output_values()
            .iter()
            .zip(outputs)
            .map(|(&value, lt)| {
                let desc = sg.value(value).desc.as_ref().expect("layout propagation covered externals");
                fill_logical_tensor(lt, desc, sg.use_blocked_layout, layouts)
            })
            .collect();

        let plan = match planner.take_plan() {
            Some(plan) => plan,
            None => return InternalSnafu { reason: "memory planner produced no plan".to_string() }.fail(),
        };
        debug!(
            kernel = %self.kind,
            executables = sg.executables().len(),
            scratchpad = plan.total_internal_bytes,
            "kernel compiled"
        );
        self.engine = Some(engine.clone());
        self.plan = Some(Arc::new(plan));
        self.subgraph = Some(Arc::new(sg));
        Ok(())
    }

    fn compiled_state(&self) -> Result<(&Engine, &Arc<Subgraph>, &Arc<MemoryPlan>)> {
        match (&self.engine, &self.subgraph, &self.plan) {
            (Some(engine), Some(sg), Some(plan)) => Ok((engine, sg, plan)),
            _ => InternalSnafu { reason: "kernel executed before a successful compile".to_string() }.fail(),
        }
    }

    fn check_io(&self, stream: &Stream, inputs: &[Tensor], outputs: &[Tensor], engine: &Engine) -> Result<()> {
        snafu::ensure!(
            stream.engine().kind() == engine.kind(),
            InvalidArgumentsSnafu {
                reason: format!("stream engine kind {} does not match kernel's {}", stream.engine().kind(), engine.kind()),
            }
        );
        snafu::ensure!(
            inputs.len() == self.compiled_inputs.len() && outputs.len() == self.compiled_outputs.len(),
            InvalidArgumentsSnafu {
                reason: format!(
                    "tensor counts {}/{} do not match compiled {}/{}",
                    inputs.len(),
                    outputs.len(),
                    self.compiled_inputs.len(),
                    self.compiled_outputs.len()
                ),
            }
        );
        for (tensor, compiled) in inputs.iter().zip(&self.compiled_inputs).chain(outputs.iter().zip(&self.compiled_outputs)) {
            debug_assert_eq!(
                tensor.logical_tensor().dims,
                compiled.dims,
                "tensor {} shape drifted from its compiled shape",
                compiled.id
            );
        }
        Ok(())
    }

    /// Allocate the per-call scratchpad.
    fn scratchpad(&self, engine: &Engine, plan: &MemoryPlan) -> Result<Allocation> {
        engine.allocator().allocate(plan.total_internal_bytes).map_err(|_| {
            OutOfMemorySnafu { reason: format!("scratchpad of {} bytes", plan.total_internal_bytes) }.build()
        })
    }

    /// The persistent constant region, copying the seeds on first call.
    fn constant_base(&self, engine: &Engine, plan: &MemoryPlan, inputs: &[Tensor]) -> Result<Option<*mut u8>> {
        if plan.total_constant_bytes == 0 {
            return Ok(None);
        }
        let allocation = self.constants.get_or_try_init(|| -> Result<Allocation> {
            let allocation = engine.allocator().allocate(plan.total_constant_bytes).map_err(|_| {
                OutOfMemorySnafu { reason: format!("constant cache of {} bytes", plan.total_constant_bytes) }.build()
            })?;
            for &(input_idx, offset, bytes) in &plan.constant_inputs {
                // SAFETY: the region was sized to hold every seed; the caller
                // guarantees input pointers cover their descriptors.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        inputs[input_idx].data_ptr(),
                        allocation.base_ptr().add(offset),
                        bytes,
                    );
                }
            }
            debug!(bytes = plan.total_constant_bytes, seeds = plan.constant_inputs.len(), "constant cache populated");
            Ok(allocation)
        })?;
        Ok(Some(allocation.base_ptr()))
    }

    /// Rebind the per-thread resource and submit every executable in order.
    /// With `chain`, submissions are serially chained behind `deps` and the
    /// final completion token is returned.
    fn execute_inner(
        &self,
        stream: &Stream,
        inputs: &[Tensor],
        outputs: &[Tensor],
        deps: &[CompletionToken],
        chain: bool,
    ) -> Result<Option<CompletionToken>> {
        let (engine, sg, plan) = self.compiled_state()?;
        self.check_io(stream, inputs, outputs, engine)?;

        let resource = thread_cache::get_or_create(self.id, || plan.args_template.materialize());
        let scratchpad = self.scratchpad(engine, plan)?;
        let constant_base = self.constant_base(engine, plan, inputs)?;

        let mut resource = resource.borrow_mut();
        let ExecResource { args, external_inputs, external_outputs, internals, constants } = &mut *resource;
        for &(exec, slot, i) in external_inputs.iter() {
            args[exec].set_ptr(slot, inputs[i].data_ptr());
        }
        for &(exec, slot, j) in external_outputs.iter() {
            args[exec].set_ptr(slot, outputs[j].data_ptr());
        }
        for &(exec, slot, offset) in internals.iter() {
            // SAFETY: offsets were planned within total_internal_bytes.
            args[exec].set_ptr(slot, unsafe { scratchpad.base_ptr().add(offset) });
        }
        for &(exec, slot, offset) in constants.iter() {
            let base = constant_base.expect("constant bindings imply a constant region");
            args[exec].set_ptr(slot, unsafe { base.add(offset) });
        }

        let mut last: Vec<CompletionToken> = deps.to_vec();
        let mut token = None;
        for (i, executable) in sg.executables().iter().enumerate() {
            // SAFETY: every slot was rebound above to memory covering its
            // descriptor; callers guarantee the tensor pointers.
            if chain {
                let next = unsafe { stream.submit_chained(&*executable.primitive, &args[i], std::mem::take(&mut last)) }?;
                last = vec![next.clone()];
                token = Some(next);
            } else {
                unsafe { stream.submit(&*executable.primitive, &args[i]) }?;
            }
        }
        Ok(token)
    }
}

impl CompiledKernel for SubgraphKernel {
    fn execute(&self, stream: &Stream, inputs: &[Tensor], outputs: &[Tensor]) -> Result<()> {
        self.execute_inner(stream, inputs, outputs, &[], false)?;
        Ok(())
    }

    fn execute_async(
        &self,
        stream: &Stream,
        inputs: &[Tensor],
        outputs: &[Tensor],
        deps: &[CompletionToken],
    ) -> Result<CompletionToken> {
        let token = self.execute_inner(stream, inputs, outputs, deps, true)?;
        // A compiled subgraph always has at least one executable.
        match token {
            Some(token) => Ok(token),
            None => InternalSnafu { reason: "async execute submitted no executables".to_string() }.fail(),
        }
    }

    fn inplace_pairs(&self) -> &[(u64, u64)] {
        self.plan.as_ref().map_or(&[], |plan| &plan.inplace_pairs)
    }
}

impl Drop for SubgraphKernel {
    fn drop(&mut self) {
        thread_cache::retire(self.id);
    }
}

impl std::fmt::Debug for SubgraphKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphKernel")
            .field("kind", &self.kind)
            .field("compiled", &self.subgraph.is_some())
            .field("inputs", &self.compiled_inputs.len())
            .field("outputs", &self.compiled_outputs.len())
            .finish()
    }
}
