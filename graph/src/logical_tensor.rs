//! Logical tensors: the tensor descriptors that live on graph edges.

use fusor_dtype::DType;
use smallvec::SmallVec;

/// Marker for a dimension the user has not pinned yet. The backend fills
/// these during partition compilation.
pub const DIM_UNKNOWN: i64 = -1;

pub type Dims = SmallVec<[i64; 6]>;

/// How the bytes of a tensor are laid out.
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    /// Not specified; the backend is free to choose and report back.
    Any,
    /// Plain layout with explicit per-dim strides (in elements).
    Strided(Dims),
    /// Opaque layout referenced through a backend-minted layout id.
    Opaque(u64),
}

/// Whether the tensor content changes between executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Variable,
    Constant,
}

/// Descriptor of a tensor at a graph edge.
///
/// Immutable once handed to a backend: compilation returns *filled* copies
/// instead of mutating the caller's instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalTensor {
    pub id: u64,
    pub dtype: DType,
    pub dims: Dims,
    pub layout: Layout,
    pub property: Property,
}

impl LogicalTensor {
    pub fn new(id: u64, dtype: DType) -> Self {
        Self { id, dtype, dims: Dims::new(), layout: Layout::Any, property: Property::Variable }
    }

    pub fn with_dims(mut self, dims: &[i64]) -> Self {
        self.dims = SmallVec::from_slice(dims);
        self
    }

    /// Dense row-major strides for the current dims.
    pub fn contiguous(mut self) -> Self {
        self.layout = Layout::Strided(fusor_primitive::memory::contiguous_strides(&self.dims));
        self
    }

    pub fn with_strides(mut self, strides: &[i64]) -> Self {
        self.layout = Layout::Strided(SmallVec::from_slice(strides));
        self
    }

    pub fn with_layout_id(mut self, layout_id: u64) -> Self {
        self.layout = Layout::Opaque(layout_id);
        self
    }

    pub fn constant(mut self) -> Self {
        self.property = Property::Constant;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn has_unknown_dims(&self) -> bool {
        self.dims.iter().any(|&d| d == DIM_UNKNOWN)
    }

    pub fn nelems(&self) -> Option<i64> {
        if self.has_unknown_dims() { None } else { Some(self.dims.iter().product()) }
    }

    pub fn strides(&self) -> Option<&[i64]> {
        match &self.layout {
            Layout::Strided(strides) => Some(strides),
            _ => None,
        }
    }
}
