//! Greedy, non-backtracking pattern application over a user graph.
//!
//! "Non-backtracking" is across patterns: once a pattern claims ops they stay
//! claimed; later patterns only see what is left. Within a single pattern the
//! matcher does try alternative candidates before giving up on an anchor.

use std::collections::{HashMap, HashSet};

use fusor_graph::error::{InternalSnafu, Result};
use fusor_graph::{Graph, LogicalTensor, Op};
use itertools::Itertools;
use tracing::trace;

use super::Pattern;

/// Producer/consumer view over a graph's ops.
pub struct GraphView<'g> {
    ops: &'g [Op],
    /// tensor id -> index of the producing op.
    producer: HashMap<u64, usize>,
    /// tensor id -> indices of consuming ops.
    consumers: HashMap<u64, Vec<usize>>,
}

impl<'g> GraphView<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        let ops = graph.ops();
        let mut producer = HashMap::new();
        let mut consumers: HashMap<u64, Vec<usize>> = HashMap::new();
        for (idx, op) in ops.iter().enumerate() {
            for out in &op.outputs {
                producer.insert(out.id, idx);
            }
            for input in &op.inputs {
                consumers.entry(input.id).or_default().push(idx);
            }
        }
        Self { ops, producer, consumers }
    }

    pub fn ops(&self) -> &[Op] {
        self.ops
    }

    pub fn n_consumers(&self, tensor_id: u64) -> usize {
        self.consumers.get(&tensor_id).map_or(0, |c| c.len())
    }

    fn consumers_of_op(&self, op_idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.ops[op_idx]
            .outputs
            .iter()
            .flat_map(|out| self.consumers.get(&out.id).into_iter().flatten().copied())
    }

    /// The tensor connecting `producer_op` to `consumer_op`, if any.
    fn connecting_tensor(&self, producer_op: usize, consumer_op: usize, port: Option<usize>) -> Option<u64> {
        let consumer = &self.ops[consumer_op];
        let produced: HashSet<u64> = self.ops[producer_op].outputs.iter().map(|o| o.id).collect();
        match port {
            Some(port) => consumer.inputs.get(port).filter(|lt| produced.contains(&lt.id)).map(|lt| lt.id),
            None => consumer.inputs.iter().find(|lt| produced.contains(&lt.id)).map(|lt| lt.id),
        }
    }
}

/// A successful match: pattern placeholder i is graph op `op_indices[i]`.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub op_indices: Vec<usize>,
}

/// Find one match of `pattern` among unclaimed ops, or `None`.
pub fn find_match(view: &GraphView<'_>, pattern: &Pattern, claimed: &HashSet<usize>) -> Option<PatternMatch> {
    let anchor = &pattern.nodes[0];
    for (idx, op) in view.ops().iter().enumerate() {
        if claimed.contains(&idx) || !anchor.kinds.contains(&op.kind) {
            continue;
        }
        if let Some(constraint) = anchor.constraint
            && !constraint(op)
        {
            continue;
        }
        let mut assignment = vec![usize::MAX; pattern.nodes.len()];
        assignment[0] = idx;
        if extend(view, pattern, claimed, &mut assignment, 1) {
            trace!(pattern = pattern.name, ?assignment, "pattern matched");
            return Some(PatternMatch { op_indices: assignment });
        }
    }
    None
}

fn extend(
    view: &GraphView<'_>,
    pattern: &Pattern,
    claimed: &HashSet<usize>,
    assignment: &mut Vec<usize>,
    depth: usize,
) -> bool {
    if depth == pattern.nodes.len() {
        return true;
    }
    let placeholder = &pattern.nodes[depth];
    debug_assert!(!placeholder.edges.is_empty(), "non-anchor placeholder without edges");

    let first_edge = placeholder.edges[0];
    let seed = assignment[first_edge.producer];
    let candidates = view.consumers_of_op(seed).sorted_unstable().dedup();

    'candidates: for candidate in candidates {
        if claimed.contains(&candidate)
            || assignment[..depth].contains(&candidate)
            || !placeholder.kinds.contains(&view.ops()[candidate].kind)
        {
            continue;
        }
        if let Some(constraint) = placeholder.constraint
            && !constraint(&view.ops()[candidate])
        {
            continue;
        }
        // Every declared edge must connect, and each connecting tensor must
        // have this candidate as its only consumer: fusing across a value
        // that other ops also read would change their operand.
        for edge in &placeholder.edges {
            match view.connecting_tensor(assignment[edge.producer], candidate, edge.port) {
                Some(tensor) if view.n_consumers(tensor) == 1 => {}
                _ => continue 'candidates,
            }
        }

        assignment[depth] = candidate;
        if extend(view, pattern, claimed, assignment, depth + 1) {
            return true;
        }
        assignment[depth] = usize::MAX;
    }
    false
}

/// External inputs and outputs of a matched op set, in deterministic
/// (op-position, port-position) order.
///
/// Returns `None` when the match is invalid as a partition: some op other
/// than the designated output op leaks a value to the outside.
pub fn partition_io(
    view: &GraphView<'_>,
    matched: &PatternMatch,
    output_node: usize,
) -> Option<(Vec<LogicalTensor>, Vec<LogicalTensor>)> {
    let member: HashSet<usize> = matched.op_indices.iter().copied().collect();
    let produced: HashMap<u64, usize> = matched
        .op_indices
        .iter()
        .flat_map(|&idx| view.ops()[idx].outputs.iter().map(move |out| (out.id, idx)))
        .collect();

    let mut inputs: Vec<LogicalTensor> = Vec::new();
    let mut seen = HashSet::new();
    for &idx in &matched.op_indices {
        for input in &view.ops()[idx].inputs {
            if !produced.contains_key(&input.id) && seen.insert(input.id) {
                inputs.push(input.clone());
            }
        }
    }

    let output_op = matched.op_indices[output_node];
    let mut outputs: Vec<LogicalTensor> = Vec::new();
    for &idx in &matched.op_indices {
        for out in &view.ops()[idx].outputs {
            let escapes = view
                .consumers
                .get(&out.id)
                .is_none_or(|consumers| consumers.iter().any(|c| !member.contains(c)));
            if escapes {
                if idx != output_op {
                    // A non-output op leaks a value; this shape cannot be a
                    // single-exit partition.
                    return None;
                }
                outputs.push(out.clone());
            }
        }
    }
    // The designated output op's unconsumed outputs count even if every
    // consumer is internal-only elsewhere.
    if outputs.is_empty() {
        outputs.extend(view.ops()[output_op].outputs.iter().cloned());
    }
    Some((inputs, outputs))
}

/// Apply one pattern repeatedly, claiming matched ops, until it stops
/// matching. Returns the matches in discovery order.
pub fn apply_pattern(
    view: &GraphView<'_>,
    pattern: &Pattern,
    claimed: &mut HashSet<usize>,
) -> Result<Vec<PatternMatch>> {
    let mut matches = Vec::new();
    loop {
        let Some(matched) = find_match(view, pattern, claimed) else {
            break;
        };
        // A match may still be rejected as a partition (leaking values); in
        // that case the anchor must not be retried forever.
        if partition_io(view, &matched, pattern.output_node()).is_none() {
            trace!(pattern = pattern.name, "match rejected: values escape from a non-output op");
            // Claiming nothing would loop on the same anchor. Rejecting the
            // match while leaving ops unclaimed is correct because the next
            // find_match call starts from the same deterministic state; bail
            // out of this pattern instead.
            break;
        }
        for &idx in &matched.op_indices {
            snafu::ensure!(
                claimed.insert(idx),
                InternalSnafu { reason: format!("pattern {} double-claimed op {idx}", pattern.name) }
            );
        }
        matches.push(matched);
    }
    Ok(matches)
}
