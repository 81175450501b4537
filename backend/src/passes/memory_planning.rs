//! Memory planning: bind every value of the subgraph to storage.
//!
//! External values bind to caller tensors. Internal temporaries get offsets
//! in a single scratchpad sized here; offsets are reused across values whose
//! lifetimes do not overlap. The planner also decides in-place aliases,
//! promotes constant inputs to a persistent region, and emits the
//! execution-args template the kernel instantiates per thread.
//!
//! # Algorithm
//!
//! 1. Fix the execution order (stable topological sort).
//! 2. Liveness: each internal value lives from its producing executable to
//!    its last consuming executable.
//! 3. Walk executables in order; at each step release dead blocks first, then
//!    try the in-place alias, then allocate from a free list preferring the
//!    most recently released block of sufficient size (cache locality), and
//!    only then grow the scratchpad.

use std::collections::{BTreeMap, HashMap};

use fusor_graph::Property;
use fusor_graph::error::{InternalSnafu, Result};
use fusor_primitive::memory::Desc;
use fusor_primitive::{ArgSlot, ExecArgs, MemArg};
use tracing::{debug, trace};

use crate::ir::{InternalKind, Node, Subgraph, ValueId, ValueKind, ValueRef, arg_slots};

/// Scratchpad slot granularity.
const ALIGNMENT: usize = 64;

fn align_up(size: usize) -> usize {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Storage decision for one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBinding {
    ExternalInput(usize),
    ExternalOutput(usize),
    Internal { offset: usize },
    Constant { offset: usize },
}

/// One slot of one executable in the args template.
#[derive(Debug, Clone)]
pub struct ArgBinding {
    pub slot: ArgSlot,
    pub desc: Desc,
    pub binding: MemBinding,
}

/// Argument-slot template for the whole compiled subgraph.
#[derive(Debug, Clone, Default)]
pub struct ExecArgsSet {
    pub per_exec: Vec<Vec<ArgBinding>>,
}

/// A materialized, pointer-bearing instance of the template. Confined to the
/// thread that owns it; rebound at every execute call.
#[derive(Debug, Default)]
pub struct ExecResource {
    pub args: Vec<ExecArgs>,
    /// (executable index, slot, external input index)
    pub external_inputs: Vec<(usize, ArgSlot, usize)>,
    /// (executable index, slot, external output index)
    pub external_outputs: Vec<(usize, ArgSlot, usize)>,
    /// (executable index, slot, scratchpad offset)
    pub internals: Vec<(usize, ArgSlot, usize)>,
    /// (executable index, slot, constant-region offset)
    pub constants: Vec<(usize, ArgSlot, usize)>,
}

impl ExecArgsSet {
    pub fn materialize(&self) -> ExecResource {
        let mut resource = ExecResource::default();
        for (exec_idx, bindings) in self.per_exec.iter().enumerate() {
            let mut args = ExecArgs::new();
            for binding in bindings {
                args.insert(binding.slot, MemArg::new(binding.desc.clone(), std::ptr::null_mut()));
                match binding.binding {
                    MemBinding::ExternalInput(i) => resource.external_inputs.push((exec_idx, binding.slot, i)),
                    MemBinding::ExternalOutput(j) => resource.external_outputs.push((exec_idx, binding.slot, j)),
                    MemBinding::Internal { offset } => resource.internals.push((exec_idx, binding.slot, offset)),
                    MemBinding::Constant { offset } => resource.constants.push((exec_idx, binding.slot, offset)),
                }
            }
            resource.args.push(args);
        }
        resource
    }
}

/// The planning outcome the kernel executes against.
#[derive(Debug, Default)]
pub struct MemoryPlan {
    pub total_internal_bytes: usize,
    pub total_constant_bytes: usize,
    /// Per-value storage decision (indexed by `ValueId`).
    pub bindings: Vec<Option<MemBinding>>,
    /// Per-value `[first_def, last_use]` in executable index space.
    pub lifetimes: Vec<Option<(usize, usize)>>,
    /// (external input index, constant-region offset, bytes) seeds copied on
    /// the first execute.
    pub constant_inputs: Vec<(usize, usize, usize)>,
    /// (input tensor id, output tensor id) pairs the caller may alias.
    pub inplace_pairs: Vec<(u64, u64)>,
    pub args_template: ExecArgsSet,
}

/// Runs once per kernel compile and keeps the plan for execution.
#[derive(Debug, Default)]
pub struct MemoryPlanner {
    constants_enabled: bool,
    plan: Option<MemoryPlan>,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    offset: usize,
    size: usize,
}

impl MemoryPlanner {
    pub fn new(constants_enabled: bool) -> Self {
        Self { constants_enabled, plan: None }
    }

    pub fn plan(&self) -> Option<&MemoryPlan> {
        self.plan.as_ref()
    }

    pub fn take_plan(&mut self) -> Option<MemoryPlan> {
        self.plan.take()
    }

    pub fn run(&mut self, sg: &mut Subgraph) -> Result<()> {
        let order = sg.topo_order()?;
        sg.exec_order = order.clone();

        // Liveness in executable index space.
        let mut first_def: HashMap<ValueId, usize> = HashMap::new();
        let mut last_use: HashMap<ValueId, usize> = HashMap::new();
        for (i, &op) in order.iter().enumerate() {
            let node = sg.node(op);
            for &v in &node.inputs {
                last_use.insert(v, i);
            }
            for &v in &node.outputs {
                first_def.entry(v).or_insert(i);
                last_use.entry(v).or_insert(i);
            }
        }

        let n_values = sg.values.len();
        let mut plan = MemoryPlan {
            bindings: vec![None; n_values],
            lifetimes: vec![None; n_values],
            ..Default::default()
        };

        // External and constant bindings are positional, no planning needed.
        for (v, slot) in sg.values.iter().enumerate() {
            match slot.kind {
                ValueKind::ExternalInput(i) => {
                    let is_cached_constant =
                        self.constants_enabled && slot.lt.property == Property::Constant && last_use.contains_key(&v);
                    if is_cached_constant {
                        let size = value_size(sg, v)?;
                        plan.bindings[v] = Some(MemBinding::Constant { offset: plan.total_constant_bytes });
                        plan.constant_inputs.push((i, plan.total_constant_bytes, size));
                        plan.total_constant_bytes += align_up(size);
                    } else {
                        plan.bindings[v] = Some(MemBinding::ExternalInput(i));
                    }
                }
                ValueKind::ExternalOutput(j) => plan.bindings[v] = Some(MemBinding::ExternalOutput(j)),
                ValueKind::Internal => {}
            }
        }

        // Internal temporaries: walk executables, free dead blocks, alias
        // in-place, then first-fit from the free stack.
        let mut free: Vec<Block> = Vec::new();
        let mut owned: BTreeMap<ValueId, Block> = BTreeMap::new();
        let mut total = 0usize;

        for (i, &op) in order.iter().enumerate() {
            let dead: Vec<ValueId> = owned.keys().copied().filter(|v| last_use[v] < i).collect();
            for v in dead {
                let block = owned.remove(&v).expect("dead value owns a block");
                trace!(value = v, offset = block.offset, "released scratchpad block");
                free.push(block);
            }

            let node = sg.node(op);
            if let Some((src, dst)) = inplace_candidate(sg, node)
                && plan.bindings[dst].is_none()
                && last_use.get(&src) == Some(&i)
                && owned.contains_key(&src)
                && sg.value(src).desc == sg.value(dst).desc
            {
                // The input dies here and the primitive may write its output
                // in place: hand the block over without touching the free
                // list.
                let block = owned.remove(&src).expect("checked above");
                plan.bindings[dst] = Some(MemBinding::Internal { offset: block.offset });
                owned.insert(dst, block);
                trace!(src, dst, offset = block.offset, "in-place alias");
            }

            let outputs: Vec<ValueId> = node.outputs.iter().copied().collect();
            for out in outputs {
                if plan.bindings[out].is_some() {
                    continue;
                }
                let size = align_up(value_size(sg, out)?);
                // Most recently released block of sufficient size first.
                let block = match free.iter().rposition(|b| b.size >= size) {
                    Some(pos) => free.remove(pos),
                    None => {
                        let block = Block { offset: total, size };
                        total += size;
                        block
                    }
                };
                trace!(value = out, offset = block.offset, size, "assigned scratchpad block");
                plan.bindings[out] = Some(MemBinding::Internal { offset: block.offset });
                owned.insert(out, block);
            }
        }
        plan.total_internal_bytes = total;

        for (v, binding) in plan.bindings.iter().enumerate() {
            if binding.is_some()
                && let (Some(&def), Some(&last)) = (first_def.get(&v), last_use.get(&v))
            {
                plan.lifetimes[v] = Some((def, last));
            }
        }

        plan.inplace_pairs = external_inplace_pairs(sg, &order);
        plan.args_template = build_template(sg, &order, &plan.bindings)?;

        debug!(
            executables = order.len(),
            scratchpad_bytes = plan.total_internal_bytes,
            constant_bytes = plan.total_constant_bytes,
            inplace = plan.inplace_pairs.len(),
            "memory plan complete"
        );
        self.plan = Some(plan);
        Ok(())
    }
}

fn value_size(sg: &Subgraph, v: ValueId) -> Result<usize> {
    match &sg.value(v).desc {
        Some(desc) => Ok(desc.size()),
        None => InternalSnafu { reason: format!("value {v} reached memory planning without a descriptor") }.fail(),
    }
}

/// Mirror of the primitives' in-place candidacy, in value terms.
fn inplace_candidate(sg: &Subgraph, node: &Node) -> Option<(ValueId, ValueId)> {
    let src = match node.kind {
        InternalKind::Eltwise | InternalKind::Binary => node.inputs[0],
        InternalKind::Sum => node.inputs[0],
        _ => return None,
    };
    // Broadcast sources never alias the output.
    if sg.value(src).lt.dims != sg.value(node.outputs[0]).lt.dims {
        return None;
    }
    Some((src, node.outputs[0]))
}

/// Caller-visible in-place opportunities: a single executable whose first
/// source is an external input dying into an identically-described external
/// output.
fn external_inplace_pairs(sg: &Subgraph, order: &[usize]) -> Vec<(u64, u64)> {
    let mut pairs = Vec::new();
    if let [only] = order {
        let node = sg.node(*only);
        if let Some((src, dst)) = inplace_candidate(sg, node) {
            let (src_slot, dst_slot) = (sg.value(src), sg.value(dst));
            let external = matches!(src_slot.kind, ValueKind::ExternalInput(_))
                && matches!(dst_slot.kind, ValueKind::ExternalOutput(_));
            if external && src_slot.desc == dst_slot.desc && src_slot.consumers.len() == 1 {
                pairs.push((src_slot.lt.id, dst_slot.lt.id));
            }
        }
    }
    pairs
}

fn build_template(sg: &Subgraph, order: &[usize], bindings: &[Option<MemBinding>]) -> Result<ExecArgsSet> {
    let mut per_exec = Vec::with_capacity(order.len());
    for &op in order {
        let node = sg.node(op);
        let mut exec_bindings = Vec::new();
        for (slot, vref) in arg_slots(node) {
            let value = match vref {
                ValueRef::In(k) => node.inputs[k],
                ValueRef::Out(k) => node.outputs[k],
            };
            let desc = sg.value(value).desc.clone();
            let (Some(desc), Some(binding)) = (desc, bindings[value]) else {
                return InternalSnafu { reason: format!("value {value} has no storage binding") }.fail();
            };
            exec_bindings.push(ArgBinding { slot, desc, binding });
        }
        per_exec.push(exec_bindings);
    }
    Ok(ExecArgsSet { per_exec })
}
