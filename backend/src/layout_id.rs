//! Interning of opaque memory descriptors.
//!
//! Logical tensors cannot carry a full [`Desc`] across the backend boundary,
//! so the backend mints small stable ids for them. Two ids compare equal iff
//! the underlying descriptors compare equal, bit-exact. Ids are dense indices
//! into a grown vector and are never reused.
//!
//! With the `layout-debug` feature, ids below [`FormatTag::LAST`] encode
//! well-known plain tags directly and interned ids are biased past them; a
//! descriptor is only stored when its tag encoding would be lossy.

use fusor_primitive::memory::Desc;
#[cfg(feature = "layout-debug")]
use fusor_primitive::memory::FormatTag;
use parking_lot::Mutex;

/// Stable identifier for an interned memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutId(pub u64);

/// Thread-safe injective interning of memory descriptors.
///
/// Both operations take the single mutex; interning is a compile-time path,
/// so the linear equality scan and the contention are acceptable.
#[derive(Debug, Default)]
pub struct LayoutIdManager {
    descs: Mutex<Vec<Desc>>,
}

impl LayoutIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of an equal descriptor, or append and return the new index.
    fn intern_raw(descs: &mut Vec<Desc>, desc: &Desc) -> u64 {
        match descs.iter().position(|cached| cached == desc) {
            Some(pos) => pos as u64,
            None => {
                descs.push(desc.clone());
                (descs.len() - 1) as u64
            }
        }
    }

    #[cfg(not(feature = "layout-debug"))]
    pub fn intern(&self, desc: &Desc) -> LayoutId {
        let mut descs = self.descs.lock();
        LayoutId(Self::intern_raw(&mut descs, desc))
    }

    #[cfg(not(feature = "layout-debug"))]
    pub fn lookup(&self, id: LayoutId) -> Option<Desc> {
        self.descs.lock().get(id.0 as usize).cloned()
    }

    /// Tag-biased intern: a descriptor fully described by (dims, dtype, tag)
    /// gets the tag value itself as its id and is not stored. Everything
    /// else - unknown tag, blocked format, extra flags - is interned and
    /// biased by [`FormatTag::LAST`].
    #[cfg(feature = "layout-debug")]
    pub fn intern(&self, desc: &Desc) -> LayoutId {
        if desc.extra.is_empty()
            && let Some(tag) = desc.tag()
            && tag != FormatTag::Undef
        {
            return LayoutId(tag as u64);
        }
        let mut descs = self.descs.lock();
        LayoutId(Self::intern_raw(&mut descs, desc) + FormatTag::LAST as u64)
    }

    /// Tag-biased lookup. Tag-valued ids cannot be resolved without the dims
    /// they were minted for, so only biased ids resolve to descriptors.
    #[cfg(feature = "layout-debug")]
    pub fn lookup(&self, id: LayoutId) -> Option<Desc> {
        let index = (id.0 as usize).checked_sub(FormatTag::LAST)?;
        self.descs.lock().get(index).cloned()
    }

    /// Number of stored descriptors.
    pub fn len(&self) -> usize {
        self.descs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.lock().is_empty()
    }
}
