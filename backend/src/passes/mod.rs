//! The subgraph pass pipeline.
//!
//! Each pass is a function from subgraph to subgraph, run in a fixed order
//! with short-circuiting on the first failure. Ordering is a contract, not a
//! runtime condition: lowering precedes fusion, fusion precedes layout
//! propagation, layouts precede memory planning, planning precedes op
//! compilation.

pub mod compile_ops;
pub mod fuse;
pub mod insert_reorders;
pub mod layout_propagation;
pub mod lower;
pub mod memory_planning;

use fusor_graph::error::Result;
use tracing::{debug, trace};

use crate::ir::Subgraph;

pub use compile_ops::compile_ops;
pub use fuse::{fuse_post_ops, fuse_to_sum};
pub use insert_reorders::insert_reorders;
pub use layout_propagation::layout_propagation;
pub use lower::lower_down;
pub use memory_planning::{ExecArgsSet, ExecResource, MemBinding, MemoryPlan, MemoryPlanner};

type PassFn<'a> = Box<dyn FnMut(&mut Subgraph) -> Result<()> + 'a>;

/// Named passes run in order; an optional visualizer sink fires between
/// passes. Visualization is diagnostic only and never touches the
/// computation.
pub struct PassPipeline<'a> {
    passes: Vec<(&'static str, PassFn<'a>)>,
    visualizer: Option<SubgraphVisualizer>,
}

impl<'a> PassPipeline<'a> {
    pub fn new(visualizer: Option<SubgraphVisualizer>) -> Self {
        Self { passes: Vec::new(), visualizer }
    }

    pub fn add(mut self, name: &'static str, pass: impl FnMut(&mut Subgraph) -> Result<()> + 'a) -> Self {
        self.passes.push((name, Box::new(pass)));
        self
    }

    pub fn run(mut self, sg: &mut Subgraph) -> Result<()> {
        for (name, pass) in &mut self.passes {
            debug!(pass = *name, "running subgraph pass");
            pass(sg)?;
            if let Some(vis) = &self.visualizer {
                vis.emit(sg, name);
            }
        }
        Ok(())
    }
}

/// DOT dumper for per-pass subgraph snapshots, routed through the
/// `fusor::visualize` trace target.
#[derive(Debug, Clone)]
pub struct SubgraphVisualizer {
    partition_id: usize,
}

impl SubgraphVisualizer {
    pub fn new(partition_id: usize) -> Self {
        Self { partition_id }
    }

    fn emit(&self, sg: &Subgraph, pass_name: &str) {
        if !tracing::enabled!(target: "fusor::visualize", tracing::Level::TRACE) {
            return;
        }
        let mut dot = String::new();
        dot.push_str(&format!("digraph \"p{}_{}\" {{\n", self.partition_id, pass_name));
        for (id, node) in sg.live_nodes() {
            dot.push_str(&format!("  n{id} [label=\"{} (+{} post-ops)\"];\n", node.kind, node.post_ops.len()));
            for &input in &node.inputs {
                let slot = sg.value(input);
                let label = match &slot.desc {
                    Some(desc) => format!("{:?}", desc.dims),
                    None => format!("{:?}", slot.lt.dims),
                };
                match slot.producer {
                    Some((producer, _)) => {
                        dot.push_str(&format!("  n{producer} -> n{id} [label=\"{label}\"];\n"));
                    }
                    None => {
                        dot.push_str(&format!("  v{input} -> n{id} [label=\"{label}\"];\n"));
                    }
                }
            }
        }
        dot.push_str("}\n");
        trace!(target: "fusor::visualize", partition = self.partition_id, pass = pass_name, dot = %dot);
    }
}
