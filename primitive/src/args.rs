//! Execution arguments.
//!
//! Primitives are invoked against an [`ExecArgs`] map from argument slot to a
//! bound memory region. The map holds raw pointers, so a populated `ExecArgs`
//! is confined to the thread that bound it; templates without pointers are
//! what crosses threads.

use std::collections::HashMap;

use crate::error::{MissingArgumentSnafu, Result};
use crate::memory::Desc;

/// Argument slot of a primitive invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgSlot {
    /// Positional source.
    Src(usize),
    Weights,
    Bias,
    Dst,
    /// N-ary source of a sum.
    MultiSrc(usize),
    /// Extra source consumed by the i-th binary post-op.
    PostOpBinary(usize),
}

/// A bound memory region: descriptor plus base pointer.
#[derive(Debug, Clone)]
pub struct MemArg {
    pub desc: Desc,
    pub ptr: *mut u8,
}

impl MemArg {
    pub fn new(desc: Desc, ptr: *mut u8) -> Self {
        Self { desc, ptr }
    }

    pub fn f32_ptr(&self) -> *mut f32 {
        self.ptr as *mut f32
    }
}

/// Slot-to-memory binding for one primitive invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    map: HashMap<ArgSlot, MemArg>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: ArgSlot, arg: MemArg) {
        self.map.insert(slot, arg);
    }

    pub fn get(&self, slot: ArgSlot) -> Option<&MemArg> {
        self.map.get(&slot)
    }

    /// Rebind the pointer of an already-present slot. Descriptors are baked
    /// at compile time; only pointers change between executions.
    pub fn set_ptr(&mut self, slot: ArgSlot, ptr: *mut u8) {
        if let Some(arg) = self.map.get_mut(&slot) {
            arg.ptr = ptr;
        }
    }

    pub fn required(&self, slot: ArgSlot) -> Result<&MemArg> {
        match self.map.get(&slot) {
            Some(arg) => Ok(arg),
            None => MissingArgumentSnafu { slot }.fail(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArgSlot, &MemArg)> {
        self.map.iter()
    }
}
