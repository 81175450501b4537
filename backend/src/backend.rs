//! The backend facade.
//!
//! A process-wide singleton owning the layout-id manager, the pattern
//! registry and the op schemas. [`register_fusor_backend`] plugs it into the
//! graph library's backend registry at startup; everything else flows
//! through the [`Backend`] trait.

use std::path::Path;
use std::sync::Arc;

use enumset::EnumSet;
use fusor_dtype::EngineKind;
use fusor_graph::error::Result;
use fusor_graph::{Backend, Graph, LogicalTensor, PartitionPolicy};
use fusor_primitive::memory::Desc;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::desc::make_memory_desc;
use crate::layout_id::{LayoutId, LayoutIdManager};
use crate::op_schema::OpSchemaRegistry;
use crate::pass_manager::{PATTERN_CONFIG_FILE, PassManager};
use crate::patterns::{PatternRegistry, fusions};

/// Non-zero: report success from get_partitions without creating any.
/// Internal, for tests.
const ENV_DISABLE_BACKEND: &str = "FUSOR_DISABLE_BACKEND";
/// Default 1: allow large fusion patterns under the fusion policy.
const ENV_ENABLE_LARGE_PARTITION: &str = "FUSOR_ENABLE_LARGE_PARTITION";
/// Non-zero or containing "pattern": dump the effective pattern order.
const ENV_GRAPH_DUMP: &str = "FUSOR_GRAPH_DUMP";

pub struct FusorBackend {
    layout_ids: LayoutIdManager,
    patterns: PatternRegistry,
    schemas: OpSchemaRegistry,
}

static BACKEND: Lazy<Arc<FusorBackend>> = Lazy::new(|| Arc::new(FusorBackend::build()));

impl FusorBackend {
    pub const NAME: &'static str = "fusor";
    pub const PRIORITY: f32 = 10.0;

    fn build() -> Self {
        let mut patterns = PatternRegistry::new();
        fusions::register_all(&mut patterns);
        Self { layout_ids: LayoutIdManager::new(), patterns, schemas: OpSchemaRegistry::new() }
    }

    /// The singleton instance.
    pub fn get() -> &'static Arc<FusorBackend> {
        &BACKEND
    }

    pub fn layout_ids(&self) -> &LayoutIdManager {
        &self.layout_ids
    }

    pub fn pattern_registry(&self) -> &PatternRegistry {
        &self.patterns
    }

    pub fn op_schemas(&self) -> &OpSchemaRegistry {
        &self.schemas
    }

    pub fn intern_layout(&self, desc: &Desc) -> LayoutId {
        self.layout_ids.intern(desc)
    }

    pub fn lookup_layout(&self, id: LayoutId) -> Option<Desc> {
        self.layout_ids.lookup(id)
    }

    fn supported_kinds() -> EnumSet<EngineKind> {
        let mut kinds = EnumSet::new();
        kinds.insert(EngineKind::Cpu);
        #[cfg(feature = "gpu")]
        kinds.insert(EngineKind::Gpu);
        kinds
    }
}

impl std::fmt::Debug for FusorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusorBackend")
            .field("name", &Self::NAME)
            .field("priority", &Self::PRIORITY)
            .field("patterns", &self.patterns.len())
            .field("interned_layouts", &self.layout_ids.len())
            .finish()
    }
}

impl Backend for FusorBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> f32 {
        Self::PRIORITY
    }

    fn support_engine_kind(&self, kind: EngineKind) -> bool {
        Self::supported_kinds().contains(kind)
    }

    fn get_partitions(&self, graph: &mut Graph, policy: PartitionPolicy) -> Result<()> {
        if env_int(ENV_DISABLE_BACKEND, 0) > 0 {
            debug!("backend disabled by environment, yielding no partitions");
            return Ok(());
        }
        let enable_large = env_int(ENV_ENABLE_LARGE_PARTITION, 1) > 0;

        // - priority > 20: large fusion patterns
        // - 20 >= priority > 8: normal fusion patterns
        // - priority <= 8: debug patterns (single-op pass-through)
        let threshold = match policy {
            PartitionPolicy::Fusion if enable_large => f32::MAX,
            PartitionPolicy::Fusion => 20.0,
            PartitionPolicy::Debug => 8.0,
        };
        debug!(?policy, enable_large, threshold, "selecting patterns");

        let pm = PassManager::new(self.patterns.filtered(threshold));
        let config_path = Path::new(PATTERN_CONFIG_FILE);
        match PassManager::load_config(config_path)? {
            Some(config) => pm.run_with_config(graph, &config),
            None => {
                if graph_dump_requested() {
                    pm.dump_patterns(config_path)?;
                }
                pm.run(graph)
            }
        }
    }

    fn get_mem_size(&self, lt: &LogicalTensor) -> Result<usize> {
        Ok(make_memory_desc(lt, &self.layout_ids)?.size())
    }

    fn compare_logical_tensor(&self, lhs: &LogicalTensor, rhs: &LogicalTensor) -> Result<bool> {
        Ok(make_memory_desc(lhs, &self.layout_ids)? == make_memory_desc(rhs, &self.layout_ids)?)
    }
}

/// Register the singleton with the process-wide backend registry. Called by
/// the embedding once at startup; repeated calls are no-ops.
pub fn register_fusor_backend() {
    fusor_graph::registry().register_backend(BACKEND.clone());
}

fn env_int(name: &str, default: i64) -> i64 {
    std::env::var(name).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn graph_dump_requested() -> bool {
    match std::env::var(ENV_GRAPH_DUMP) {
        Ok(value) => value.trim().parse::<i64>().map(|v| v > 0).unwrap_or(false) || value.contains("pattern"),
        Err(_) => false,
    }
}
