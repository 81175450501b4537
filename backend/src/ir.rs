//! The mutable subgraph representation used while compiling one partition.
//!
//! Ops and values live in arenas and reference each other by index: a value's
//! producer link is owning, consumer links are non-owning. This keeps the
//! producer/consumer cycle out of the ownership graph entirely. After
//! compilation the subgraph is frozen behind an `Arc` and shared immutably by
//! every thread executing the kernel.

use std::collections::HashMap;

use fusor_dtype::EngineKind;
use fusor_graph::error::{InternalSnafu, InvalidGraphSnafu, Result};
use fusor_graph::{LogicalTensor, Op};
use fusor_primitive::primitives::{BinaryAlg, EltwiseAlg, PoolAlg, PostOp, Primitive};
use fusor_primitive::{ArgSlot, Engine};
use smallvec::SmallVec;

pub type OpId = usize;
pub type ValueId = usize;

/// The internal op vocabulary. After lowering, only these kinds appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum InternalKind {
    Conv,
    Matmul,
    Eltwise,
    Binary,
    Sum,
    Pool,
    Softmax,
    Reorder,
}

/// Typed attributes of an internal node. Which fields are meaningful depends
/// on the kind; the op schema validates presence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAttrs {
    pub strides: Option<[i64; 2]>,
    pub pads_begin: Option<[i64; 2]>,
    pub pads_end: Option<[i64; 2]>,
    pub dilations: Option<[i64; 2]>,
    pub kernel: Option<[i64; 2]>,
    pub axis: Option<usize>,
    pub eltwise: Option<EltwiseAlg>,
    pub binary: Option<BinaryAlg>,
    pub pool: Option<PoolAlg>,
    /// Conv/Matmul: a bias input follows src and weights.
    pub with_bias: bool,
}

/// One internal op. Base inputs come first; each `PostOp::BinaryAdd` in the
/// chain appends one extra input after them.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: InternalKind,
    pub attrs: NodeAttrs,
    pub post_ops: Vec<PostOp>,
    pub inputs: SmallVec<[ValueId; 4]>,
    pub outputs: SmallVec<[ValueId; 2]>,
}

impl Node {
    /// Number of inputs before post-op extras.
    pub fn base_arity(&self) -> usize {
        match self.kind {
            InternalKind::Conv | InternalKind::Matmul => 2 + self.attrs.with_bias as usize,
            InternalKind::Binary => 2,
            InternalKind::Sum => self.inputs.len(),
            InternalKind::Eltwise | InternalKind::Pool | InternalKind::Softmax | InternalKind::Reorder => 1,
        }
    }

    pub fn n_binary_post_ops(&self) -> usize {
        self.post_ops.iter().filter(|p| matches!(p, PostOp::BinaryAdd)).count()
    }
}

/// How a value is bound at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// The i-th partition input.
    ExternalInput(usize),
    /// The j-th partition output.
    ExternalOutput(usize),
    /// Backed by the kernel scratchpad.
    Internal,
}

/// One edge of the subgraph: a logical tensor plus its wiring and, once
/// layout propagation ran, the concrete descriptor.
#[derive(Debug, Clone)]
pub struct ValueSlot {
    pub lt: LogicalTensor,
    pub desc: Option<fusor_primitive::memory::Desc>,
    pub producer: Option<(OpId, usize)>,
    pub consumers: SmallVec<[(OpId, usize); 4]>,
    pub kind: ValueKind,
}

/// Floating-point contraction mode of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FpMathMode {
    #[default]
    Strict,
    /// Allow downcasting intermediates to bf16. Recorded; the reference
    /// primitives compute in f32 regardless.
    Bf16Relaxed,
}

/// A compiled primitive paired with the node it implements.
#[derive(Debug)]
pub struct Executable {
    pub node: OpId,
    pub primitive: Box<dyn Primitive>,
}

/// Which node value an argument slot binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    In(usize),
    Out(usize),
}

/// Slot wiring of a node: which value feeds which primitive argument.
pub fn arg_slots(node: &Node) -> SmallVec<[(ArgSlot, ValueRef); 8]> {
    let mut slots: SmallVec<[(ArgSlot, ValueRef); 8]> = SmallVec::new();
    match node.kind {
        InternalKind::Conv | InternalKind::Matmul => {
            slots.push((ArgSlot::Src(0), ValueRef::In(0)));
            slots.push((ArgSlot::Weights, ValueRef::In(1)));
            if node.attrs.with_bias {
                slots.push((ArgSlot::Bias, ValueRef::In(2)));
            }
        }
        InternalKind::Binary => {
            slots.push((ArgSlot::Src(0), ValueRef::In(0)));
            slots.push((ArgSlot::Src(1), ValueRef::In(1)));
        }
        InternalKind::Sum => {
            for i in 0..node.inputs.len() {
                slots.push((ArgSlot::MultiSrc(i), ValueRef::In(i)));
            }
        }
        InternalKind::Eltwise | InternalKind::Pool | InternalKind::Softmax | InternalKind::Reorder => {
            slots.push((ArgSlot::Src(0), ValueRef::In(0)));
        }
    }
    let base = node.base_arity();
    for i in 0..node.n_binary_post_ops() {
        slots.push((ArgSlot::PostOpBinary(i), ValueRef::In(base + i)));
    }
    slots.push((ArgSlot::Dst, ValueRef::Out(0)));
    slots
}

/// The per-partition intermediate representation.
#[derive(Debug)]
pub struct Subgraph {
    engine: Engine,
    pub fpmath: FpMathMode,
    pub use_blocked_layout: bool,

    /// Graph-level ops waiting for `lower_down`.
    pub(crate) pending_ops: Vec<Op>,
    /// Partition input/output tensors as given by the caller.
    pub(crate) given_inputs: Vec<LogicalTensor>,
    pub(crate) given_outputs: Vec<LogicalTensor>,

    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) values: Vec<ValueSlot>,
    pub(crate) tensor_to_value: HashMap<u64, ValueId>,
    /// External input/output values in caller order.
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) outputs: Vec<ValueId>,

    /// Execution order fixed by memory planning.
    pub(crate) exec_order: Vec<OpId>,
    pub(crate) executables: Vec<Executable>,
}

impl Subgraph {
    pub fn new(
        ops: Vec<Op>,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
        engine: Engine,
        fpmath: FpMathMode,
        use_blocked_layout: bool,
    ) -> Result<Self> {
        snafu::ensure!(!ops.is_empty(), InvalidGraphSnafu { reason: "partition has no ops".to_string() });
        let mut sg = Self {
            engine,
            fpmath,
            use_blocked_layout,
            pending_ops: ops,
            given_inputs: inputs.to_vec(),
            given_outputs: outputs.to_vec(),
            nodes: Vec::new(),
            values: Vec::new(),
            tensor_to_value: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            exec_order: Vec::new(),
            executables: Vec::new(),
        };
        for (i, lt) in sg.given_inputs.clone().iter().enumerate() {
            let value = sg.new_value(lt.clone(), ValueKind::ExternalInput(i));
            sg.inputs.push(value);
        }
        Ok(sg)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub(crate) fn new_value(&mut self, lt: LogicalTensor, kind: ValueKind) -> ValueId {
        let id = self.values.len();
        self.tensor_to_value.insert(lt.id, id);
        self.values.push(ValueSlot { lt, desc: None, producer: None, consumers: SmallVec::new(), kind });
        id
    }

    pub(crate) fn value_of_tensor(&self, tensor_id: u64) -> Option<ValueId> {
        self.tensor_to_value.get(&tensor_id).copied()
    }

    pub fn value(&self, id: ValueId) -> &ValueSlot {
        &self.values[id]
    }

    pub(crate) fn value_mut(&mut self, id: ValueId) -> &mut ValueSlot {
        &mut self.values[id]
    }

    /// Append a node producing one fresh value.
    pub(crate) fn add_node(
        &mut self,
        kind: InternalKind,
        attrs: NodeAttrs,
        inputs: SmallVec<[ValueId; 4]>,
        output_lt: LogicalTensor,
    ) -> (OpId, ValueId) {
        let out = self.new_value(output_lt, ValueKind::Internal);
        let op = self.nodes.len();
        self.nodes.push(Some(Node { kind, attrs, post_ops: Vec::new(), inputs, outputs: SmallVec::from_slice(&[out]) }));
        self.values[out].producer = Some((op, 0));
        (op, out)
    }

    /// Append a node writing into an existing value (used when a pass
    /// replaces the producer of a value).
    pub(crate) fn add_node_with_output(
        &mut self,
        kind: InternalKind,
        attrs: NodeAttrs,
        inputs: SmallVec<[ValueId; 4]>,
        output: ValueId,
    ) -> OpId {
        let op = self.nodes.len();
        self.nodes.push(Some(Node {
            kind,
            attrs,
            post_ops: Vec::new(),
            inputs,
            outputs: SmallVec::from_slice(&[output]),
        }));
        self.values[output].producer = Some((op, 0));
        op
    }

    /// A tensor id unused by any value in this subgraph, for values passes
    /// introduce out of thin air.
    pub(crate) fn fresh_tensor_id(&mut self) -> u64 {
        self.tensor_to_value.keys().max().map_or(1_000_000, |max| max + 1)
    }

    pub fn node(&self, id: OpId) -> &Node {
        self.nodes[id].as_ref().expect("dead node referenced")
    }

    pub(crate) fn node_mut(&mut self, id: OpId) -> &mut Node {
        self.nodes[id].as_mut().expect("dead node referenced")
    }

    pub(crate) fn remove_node(&mut self, id: OpId) {
        self.nodes[id] = None;
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (OpId, &Node)> {
        self.nodes.iter().enumerate().filter_map(|(id, node)| node.as_ref().map(|n| (id, n)))
    }

    pub fn n_live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn input_values(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn output_values(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn executables(&self) -> &[Executable] {
        &self.executables
    }

    pub fn exec_order(&self) -> &[OpId] {
        &self.exec_order
    }

    /// Recompute every producer/consumer link from the live nodes. Structural
    /// passes call this after rewiring instead of patching links one by one.
    pub(crate) fn rebuild_links(&mut self) {
        for value in &mut self.values {
            value.producer = None;
            value.consumers.clear();
        }
        let wiring: Vec<(OpId, SmallVec<[ValueId; 4]>, SmallVec<[ValueId; 2]>)> = self
            .live_nodes()
            .map(|(id, node)| (id, node.inputs.clone(), node.outputs.clone()))
            .collect();
        for (op, inputs, outputs) in wiring {
            for (port, value) in inputs.into_iter().enumerate() {
                self.values[value].consumers.push((op, port));
            }
            for (port, value) in outputs.into_iter().enumerate() {
                self.values[value].producer = Some((op, port));
            }
        }
    }

    /// Stable topological order over live nodes: ready nodes are processed in
    /// ascending arena index, so the order is deterministic for a given
    /// subgraph shape.
    pub fn topo_order(&self) -> Result<Vec<OpId>> {
        let mut indegree: HashMap<OpId, usize> = HashMap::new();
        for (id, node) in self.live_nodes() {
            let internal_preds = node
                .inputs
                .iter()
                .filter(|&&v| self.values[v].producer.is_some_and(|(p, _)| self.nodes[p].is_some()))
                .count();
            indegree.insert(id, internal_preds);
        }

        let mut ready: Vec<OpId> = indegree.iter().filter(|&(_, &d)| d == 0).map(|(&id, _)| id).collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            order.push(id);
            let node = self.node(id);
            let mut unlocked: Vec<OpId> = Vec::new();
            for &out in &node.outputs {
                for &(consumer, _) in &self.values[out].consumers {
                    if self.nodes[consumer].is_none() {
                        continue;
                    }
                    let d = indegree.get_mut(&consumer).expect("consumer must be live");
                    *d -= 1;
                    if *d == 0 {
                        unlocked.push(consumer);
                    }
                }
            }
            for id in unlocked {
                let pos = ready.binary_search(&id).unwrap_or_else(|p| p);
                ready.insert(pos, id);
            }
        }

        snafu::ensure!(
            order.len() == indegree.len(),
            InternalSnafu { reason: "cycle in subgraph".to_string() }
        );
        Ok(order)
    }
}
