//! Constant-weight caching capability.
//!
//! A process-wide flag decides whether kernels may promote constant inputs
//! into a persistent buffer populated on first execute. Runtimes where
//! freeing such buffers at process exit is unsafe turn the capability off
//! through [`set_constant_cache_enabled`]; the per-engine-kind hook exists so
//! an embedding can veto specific device kinds without touching the rest.

use std::sync::atomic::{AtomicBool, Ordering};

use fusor_dtype::EngineKind;

static CONSTANT_CACHE_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_constant_cache_enabled(enabled: bool) {
    CONSTANT_CACHE_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn constant_cache_enabled() -> bool {
    CONSTANT_CACHE_ENABLED.load(Ordering::Relaxed)
}

/// Capability check a kernel makes for its own engine.
pub fn constant_cache_enabled_for(kind: EngineKind) -> bool {
    match kind {
        // No CPU runtime in this build needs the workaround.
        EngineKind::Cpu => constant_cache_enabled(),
        EngineKind::Gpu => constant_cache_enabled(),
    }
}
