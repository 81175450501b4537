//! The priority-ordered pattern collection.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use super::Pattern;

/// Registered patterns, keyed by name, sorted by descending priority once
/// [`PatternRegistry::sort`] ran. Ties keep registration order (the sort is
/// stable), which is the documented tie-break.
#[derive(Debug, Default, Clone)]
pub struct PatternRegistry {
    patterns: IndexMap<&'static str, Arc<Pattern>>,
    sorted: bool,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: Pattern) {
        debug_assert!(!self.patterns.contains_key(pattern.name), "duplicate pattern name {}", pattern.name);
        self.patterns.insert(pattern.name, Arc::new(pattern));
        self.sorted = false;
    }

    /// Stable sort by descending priority. Call once after registration.
    pub fn sort(&mut self) {
        self.patterns.sort_by(|_, a, _, b| b.priority.total_cmp(&a.priority));
        self.sorted = true;
        debug!(n_patterns = self.patterns.len(), "pattern registry sorted");
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// A registry holding only patterns with `priority <= threshold`,
    /// preserving order.
    pub fn filtered(&self, threshold: f32) -> Self {
        Self {
            patterns: self.patterns.iter().filter(|(_, p)| p.priority <= threshold).map(|(&k, v)| (k, v.clone())).collect(),
            sorted: self.sorted,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pattern>> {
        self.patterns.values()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Pattern>> {
        self.patterns.get(name)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use fusor_graph::OpKind;

    use super::*;
    use crate::kernels::KernelKind;

    fn pattern(name: &'static str, priority: f32) -> Pattern {
        Pattern::def(name, priority, KernelKind::Eltwise).op(&[OpKind::Relu]).build()
    }

    #[test]
    fn sort_orders_by_descending_priority() {
        let mut registry = PatternRegistry::new();
        registry.register(pattern("low", 8.0));
        registry.register(pattern("high", 21.0));
        registry.register(pattern("mid", 9.5));
        registry.sort();

        let names: Vec<_> = registry.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[test]
    fn equal_priorities_keep_registration_order() {
        let mut registry = PatternRegistry::new();
        registry.register(pattern("first", 9.0));
        registry.register(pattern("second", 9.0));
        registry.register(pattern("third", 9.0));
        registry.sort();

        let names: Vec<_> = registry.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn filtered_drops_large_patterns() {
        let mut registry = PatternRegistry::new();
        registry.register(pattern("large", 21.0));
        registry.register(pattern("normal", 9.5));
        registry.register(pattern("debug", 8.0));
        registry.sort();

        let fusion = registry.filtered(20.0);
        assert_eq!(fusion.len(), 2);
        assert!(fusion.find("large").is_none());

        let debug = registry.filtered(8.0);
        let names: Vec<_> = debug.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["debug"]);
    }
}
