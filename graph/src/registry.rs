//! The process-wide backend registry.
//!
//! Backends register themselves once at startup; graphs walk the registry in
//! descending priority order when asked for partitions.

use std::sync::Arc;

use fusor_dtype::EngineKind;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use crate::error::Result;
use crate::graph::Graph;
use crate::logical_tensor::LogicalTensor;
use crate::partition::PartitionPolicy;

/// A plug-in implementation of operator execution below the partition
/// interface.
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Compared across backends; higher wins when several claim an op.
    fn priority(&self) -> f32;

    fn support_engine_kind(&self, kind: EngineKind) -> bool;

    /// Carve partitions out of `graph` and record them on it.
    fn get_partitions(&self, graph: &mut Graph, policy: PartitionPolicy) -> Result<()>;

    /// Size in bytes of the memory described by a logical tensor.
    fn get_mem_size(&self, lt: &LogicalTensor) -> Result<usize>;

    /// Whether two logical tensors describe bit-identical memory.
    fn compare_logical_tensor(&self, lhs: &LogicalTensor, rhs: &LogicalTensor) -> Result<bool>;
}

pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<dyn Backend>>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self { backends: RwLock::new(Vec::new()) }
    }

    /// Register a backend, keeping the list sorted by descending priority.
    /// Re-registration under the same name is a no-op.
    pub fn register_backend(&self, backend: Arc<dyn Backend>) {
        let mut backends = self.backends.write();
        if backends.iter().any(|existing| existing.name() == backend.name()) {
            return;
        }
        info!(name = backend.name(), priority = backend.priority(), "registering backend");
        backends.push(backend);
        backends.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
    }

    /// Snapshot of the registered backends, highest priority first.
    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.backends.read().clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().iter().find(|b| b.name() == name).cloned()
    }
}

static REGISTRY: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::new);

/// The process-wide registry instance.
pub fn registry() -> &'static BackendRegistry {
    &REGISTRY
}
