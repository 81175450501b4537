//! Graph patterns: declarative templates over op kinds and edges.
//!
//! A pattern is a small DAG of typed op placeholders plus a priority and the
//! kernel kind that will execute a match. Priority bands encode policy:
//! above 20 are large multi-stage fusions, (8, 20] are normal single-anchor
//! fusions, 8 and below are the debug single-op pass-throughs.

pub mod fusions;
pub mod matcher;
pub mod registry;

use fusor_graph::{Op, OpKind};
use smallvec::SmallVec;

use crate::kernels::KernelKind;

pub use matcher::{GraphView, PatternMatch};
pub use registry::PatternRegistry;

/// A required edge: this placeholder consumes an output of `producer`
/// (another placeholder), optionally at a fixed input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEdge {
    pub producer: usize,
    pub port: Option<usize>,
}

/// One op placeholder of a pattern.
#[derive(Clone)]
pub struct PatNode {
    /// Acceptable op kinds (alternatives).
    pub kinds: SmallVec<[OpKind; 4]>,
    /// Edges to earlier placeholders. Empty only for the anchor.
    pub edges: SmallVec<[PatEdge; 2]>,
    /// Extra attribute/shape predicate.
    pub constraint: Option<fn(&Op) -> bool>,
}

impl std::fmt::Debug for PatNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatNode")
            .field("kinds", &self.kinds)
            .field("edges", &self.edges)
            .field("constrained", &self.constraint.is_some())
            .finish()
    }
}

/// A registered pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: &'static str,
    pub priority: f32,
    pub kernel: KernelKind,
    pub nodes: Vec<PatNode>,
    /// Placeholder whose outputs become the partition outputs. `None` means
    /// the last placeholder.
    pub output_node: Option<usize>,
}

impl Pattern {
    pub fn def(name: &'static str, priority: f32, kernel: KernelKind) -> PatternBuilder {
        PatternBuilder { pattern: Pattern { name, priority, kernel, nodes: Vec::new(), output_node: None } }
    }

    pub fn output_node(&self) -> usize {
        self.output_node.unwrap_or(self.nodes.len() - 1)
    }
}

/// Fluent construction of pattern DAGs. Placeholders must be added in
/// topological order: edges only point at earlier placeholders.
pub struct PatternBuilder {
    pattern: Pattern,
}

impl PatternBuilder {
    /// Append an anchor placeholder (no edges).
    pub fn op(self, kinds: &[OpKind]) -> Self {
        self.op_from(kinds, &[])
    }

    /// Append a placeholder consuming outputs of the given earlier ones.
    pub fn op_from(mut self, kinds: &[OpKind], producers: &[usize]) -> Self {
        debug_assert!(producers.iter().all(|&p| p < self.pattern.nodes.len()), "edges must point at earlier nodes");
        self.pattern.nodes.push(PatNode {
            kinds: SmallVec::from_slice(kinds),
            edges: producers.iter().map(|&producer| PatEdge { producer, port: None }).collect(),
            constraint: None,
        });
        self
    }

    /// Constrain the most recently added placeholder.
    pub fn check(mut self, constraint: fn(&Op) -> bool) -> Self {
        self.pattern.nodes.last_mut().expect("check() before any op()").constraint = Some(constraint);
        self
    }

    /// Mark the placeholder supplying the partition outputs.
    pub fn output(mut self, node: usize) -> Self {
        self.pattern.output_node = Some(node);
        self
    }

    pub fn build(self) -> Pattern {
        debug_assert!(!self.pattern.nodes.is_empty(), "pattern without placeholders");
        self.pattern
    }
}
