//! Policy-driven application of the pattern registry to a user graph.
//!
//! The pass manager walks a (threshold-filtered, priority-sorted) pattern
//! list, greedily carves matches out of the graph, and records each as a
//! partition. An on-disk pattern-configuration document, when present,
//! replaces the list entirely: exactly the named patterns run, in the
//! document's order.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use fusor_graph::Graph;
use fusor_graph::error::{InvalidArgumentsSnafu, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::partition::FusorPartition;
use crate::patterns::matcher::{GraphView, apply_pattern, partition_io};
use crate::patterns::{Pattern, PatternRegistry};

/// The pattern-configuration document next to the process working directory.
pub const PATTERN_CONFIG_FILE: &str = "fusor_graph_passes.json";

/// Ordered list of pattern names; serialized form of the effective pattern
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub passes: Vec<String>,
}

pub struct PassManager {
    registry: PatternRegistry,
}

impl PassManager {
    pub fn new(registry: PatternRegistry) -> Self {
        debug_assert!(registry.is_sorted(), "pass manager needs a sorted registry");
        Self { registry }
    }

    /// Run the registry order.
    pub fn run(&self, graph: &mut Graph) -> Result<()> {
        let order: Vec<Arc<Pattern>> = self.registry.iter().cloned().collect();
        self.run_patterns(graph, &order)
    }

    /// Run exactly the configured patterns, in configured order. Names the
    /// registry does not know (or the threshold filtered away) are skipped
    /// with a warning.
    pub fn run_with_config(&self, graph: &mut Graph, config: &PatternConfig) -> Result<()> {
        let order: Vec<Arc<Pattern>> = config
            .passes
            .iter()
            .filter_map(|name| {
                let pattern = self.registry.find(name).cloned();
                if pattern.is_none() {
                    warn!(pattern = %name, "configured pattern is not registered, skipping");
                }
                pattern
            })
            .collect();
        self.run_patterns(graph, &order)
    }

    fn run_patterns(&self, graph: &mut Graph, patterns: &[Arc<Pattern>]) -> Result<()> {
        let engine_kind = graph.engine_kind();
        let mut partitions: Vec<FusorPartition> = Vec::new();
        {
            let view = GraphView::new(graph);
            // Ops other backends already own are off limits.
            let mut claimed: HashSet<usize> = view
                .ops()
                .iter()
                .enumerate()
                .filter(|(_, op)| graph.is_claimed(op.id))
                .map(|(idx, _)| idx)
                .collect();

            for pattern in patterns {
                for matched in apply_pattern(&view, pattern, &mut claimed)? {
                    let (inputs, outputs) = partition_io(&view, &matched, pattern.output_node())
                        .expect("apply_pattern only yields valid partitions");
                    let ops = matched.op_indices.iter().map(|&idx| view.ops()[idx].clone()).collect();
                    debug!(
                        pattern = pattern.name,
                        n_ops = matched.op_indices.len(),
                        "carving partition"
                    );
                    partitions.push(FusorPartition::new(
                        pattern.kernel,
                        pattern.name,
                        ops,
                        inputs,
                        outputs,
                        engine_kind,
                    ));
                }
            }
        }
        for partition in partitions {
            graph.add_partition(Arc::new(partition));
        }
        Ok(())
    }

    /// Read the pattern-configuration document if one exists.
    pub fn load_config(path: &Path) -> Result<Option<PatternConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|err| {
            InvalidArgumentsSnafu { reason: format!("cannot read {}: {err}", path.display()) }.build()
        })?;
        let config = serde_json::from_str(&text).map_err(|err| {
            InvalidArgumentsSnafu { reason: format!("malformed pattern config {}: {err}", path.display()) }.build()
        })?;
        info!(path = %path.display(), "loaded pattern configuration");
        Ok(Some(config))
    }

    /// Dump the effective pattern order for diagnosis.
    pub fn dump_patterns(&self, path: &Path) -> Result<()> {
        let config = PatternConfig { passes: self.registry.iter().map(|p| p.name.to_string()).collect() };
        let text = serde_json::to_string_pretty(&config).expect("pattern names always serialize");
        std::fs::write(path, text).map_err(|err| {
            InvalidArgumentsSnafu { reason: format!("cannot write {}: {err}", path.display()) }.build()
        })?;
        info!(path = %path.display(), "dumped effective pattern order");
        Ok(())
    }
}
