//! Per-thread execution-resource cache.
//!
//! Execute must be allocation-free apart from the scratchpad, so each thread
//! keeps one materialized [`ExecResource`] per kernel, keyed by a stable
//! kernel id (never a pointer, ids are monotonic and never reused). A thread
//! cannot reach into another thread's map, so destruction goes through a
//! retired-id set each thread consults lazily on its next cache access.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::passes::memory_planning::ExecResource;

/// Stable identity of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(u64);

static KERNEL_IDS: AtomicU64 = AtomicU64::new(1);

impl KernelId {
    pub fn fresh() -> Self {
        Self(KERNEL_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

static RETIRED: Lazy<Mutex<HashSet<KernelId>>> = Lazy::new(|| Mutex::new(HashSet::new()));

thread_local! {
    static RESOURCES: RefCell<HashMap<KernelId, Rc<RefCell<ExecResource>>>> = RefCell::new(HashMap::new());
}

/// This thread's resource for the kernel, creating it on first use.
pub fn get_or_create(id: KernelId, ctor: impl FnOnce() -> ExecResource) -> Rc<RefCell<ExecResource>> {
    RESOURCES.with(|cell| {
        let mut map = cell.borrow_mut();
        if !map.is_empty() {
            let retired = RETIRED.lock();
            map.retain(|key, _| !retired.contains(key));
        }
        map.entry(id).or_insert_with(|| Rc::new(RefCell::new(ctor()))).clone()
    })
}

/// Mark a kernel id dead. Its entry is removed from this thread immediately
/// and from other threads on their next cache access.
pub fn retire(id: KernelId) {
    RETIRED.lock().insert(id);
    RESOURCES.with(|cell| {
        cell.borrow_mut().remove(&id);
    });
}

/// Number of resources cached on the calling thread.
#[cfg(test)]
pub fn cached_on_this_thread() -> usize {
    RESOURCES.with(|cell| cell.borrow().len())
}
