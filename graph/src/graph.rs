//! The user-facing graph: a bag of ops wired by tensor ids, plus the
//! partitions backends have carved out of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fusor_dtype::EngineKind;
use tracing::debug;

use crate::error::{InvalidGraphSnafu, Result};
use crate::op::Op;
use crate::partition::{Partition, PartitionPolicy};
use crate::registry::registry;

#[derive(Debug)]
pub struct Graph {
    engine_kind: EngineKind,
    ops: Vec<Op>,
    partitions: Vec<Arc<dyn Partition>>,
    /// Ops already claimed by some backend's partition.
    claimed: HashSet<u64>,
    finalized: bool,
}

impl Graph {
    pub fn new(engine_kind: EngineKind) -> Self {
        Self { engine_kind, ops: Vec::new(), partitions: Vec::new(), claimed: HashSet::new(), finalized: false }
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn add_op(&mut self, op: Op) -> Result<()> {
        snafu::ensure!(!self.finalized, InvalidGraphSnafu { reason: "graph is finalized".to_string() });
        snafu::ensure!(
            self.ops.iter().all(|existing| existing.id != op.id),
            InvalidGraphSnafu { reason: format!("duplicate op id {}", op.id) }
        );
        self.ops.push(op);
        Ok(())
    }

    /// Validate wiring: every tensor id has at most one producer, and each
    /// op's port lists are non-empty where required.
    pub fn finalize(&mut self) -> Result<()> {
        let mut producers: HashMap<u64, u64> = HashMap::new();
        for op in &self.ops {
            for out in &op.outputs {
                if let Some(prev) = producers.insert(out.id, op.id) {
                    return InvalidGraphSnafu {
                        reason: format!("tensor {} produced by both op {prev} and op {}", out.id, op.id),
                    }
                    .fail();
                }
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Ask every registered backend (highest priority first) to carve
    /// partitions out of this graph.
    pub fn get_partitions(&mut self, policy: PartitionPolicy) -> Result<()> {
        if !self.finalized {
            self.finalize()?;
        }
        for backend in registry().backends() {
            if !backend.support_engine_kind(self.engine_kind) {
                continue;
            }
            debug!(backend = backend.name(), ?policy, "requesting partitions");
            backend.get_partitions(self, policy)?;
        }
        Ok(())
    }

    pub fn partitions(&self) -> &[Arc<dyn Partition>] {
        &self.partitions
    }

    /// Record a partition and mark its ops as claimed. Called by backends.
    pub fn add_partition(&mut self, partition: Arc<dyn Partition>) {
        self.claimed.extend(partition.op_ids().iter().copied());
        self.partitions.push(partition);
    }

    pub fn is_claimed(&self, op_id: u64) -> bool {
        self.claimed.contains(&op_id)
    }
}

#[cfg(test)]
mod tests {
    use fusor_dtype::DType;

    use super::*;
    use crate::logical_tensor::LogicalTensor;
    use crate::op::OpKind;

    #[test]
    fn duplicate_op_ids_are_rejected() {
        let mut graph = Graph::new(EngineKind::Cpu);
        graph.add_op(Op::new(1, OpKind::Relu, "a")).unwrap();
        assert!(graph.add_op(Op::new(1, OpKind::Relu, "b")).is_err());
    }

    #[test]
    fn double_producer_fails_finalize() {
        let out = LogicalTensor::new(10, DType::F32).with_dims(&[4]);
        let mut graph = Graph::new(EngineKind::Cpu);
        graph.add_op(Op::new(1, OpKind::Relu, "a").with_output(out.clone())).unwrap();
        graph.add_op(Op::new(2, OpKind::Tanh, "b").with_output(out)).unwrap();
        assert!(graph.finalize().is_err());
    }
}
