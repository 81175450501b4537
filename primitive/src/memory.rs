//! Concrete memory descriptors.
//!
//! A [`Desc`] is the primitive library's view of a tensor: dims, element type
//! and a memory format. Formats are either plain strided layouts or opaque
//! blocked layouts. Equality is bit-exact over all fields - two descriptors
//! that describe the same shape and dtype but different strides (or different
//! extra flags) are distinct. The layout-id manager above relies on this.

use fusor_dtype::DType;
use smallvec::SmallVec;

use crate::error::{Result, TagRankMismatchSnafu};

/// Tensor dims and strides. Inline up to 6 dims.
pub type Dims = SmallVec<[i64; 6]>;

/// Well-known plain format tags.
///
/// Letters name logical dims from outermost (largest stride) to innermost.
/// `Ab` is row-major 2-d, `Ba` column-major 2-d, `Acdb` is channels-last 4-d.
/// Numbered densely from 1 so a tag fits below [`FormatTag::LAST`] when layout
/// ids are tag-biased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter)]
#[repr(usize)]
pub enum FormatTag {
    Undef = 0,
    A = 1,
    Ab = 2,
    Ba = 3,
    Abc = 4,
    Abcd = 5,
    Acdb = 6,
    Abcde = 7,
}

impl FormatTag {
    /// One past the largest tag value. Layout ids at and above this are
    /// offsets into the interning vector when tag-biased ids are active.
    pub const LAST: usize = 8;

    /// Logical-axis order from outermost to innermost.
    pub const fn axis_order(self) -> &'static [usize] {
        match self {
            Self::Undef => &[],
            Self::A => &[0],
            Self::Ab => &[0, 1],
            Self::Ba => &[1, 0],
            Self::Abc => &[0, 1, 2],
            Self::Abcd => &[0, 1, 2, 3],
            Self::Acdb => &[0, 2, 3, 1],
            Self::Abcde => &[0, 1, 2, 3, 4],
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|tag| *tag as usize == index)
    }

    /// Dense strides realizing this tag for the given dims.
    pub fn strides(self, dims: &[i64]) -> Result<Dims> {
        let order = self.axis_order();
        if order.len() != dims.len() {
            return TagRankMismatchSnafu { tag: <&'static str>::from(self), rank: dims.len() }.fail();
        }
        let mut strides: Dims = SmallVec::from_elem(0, dims.len());
        let mut acc = 1i64;
        for &axis in order.iter().rev() {
            strides[axis] = acc;
            acc *= dims[axis].max(1);
        }
        Ok(strides)
    }
}

impl From<FormatTag> for &'static str {
    fn from(tag: FormatTag) -> Self {
        match tag {
            FormatTag::Undef => "undef",
            FormatTag::A => "a",
            FormatTag::Ab => "ab",
            FormatTag::Ba => "ba",
            FormatTag::Abc => "abc",
            FormatTag::Abcd => "abcd",
            FormatTag::Acdb => "acdb",
            FormatTag::Abcde => "abcde",
        }
    }
}

/// Memory format of a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    /// Plain layout described fully by per-dim strides (in elements).
    Strided(Dims),
    /// Opaque blocked layout. Outer strides address whole blocks; the inner
    /// blocks split the named logical dims. Referenced through layout ids,
    /// never through a plain tag.
    Blocked { outer_strides: Dims, inner_blocks: Dims, inner_idxs: Dims },
}

/// Flags that ride along a descriptor but are invisible to a plain format
/// tag. A descriptor carrying any of these cannot be reconstructed from a
/// (dims, dtype, tag) triple alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extra {
    pub scale_carrier: bool,
    pub zero_point_carrier: bool,
}

impl Extra {
    pub fn is_empty(&self) -> bool {
        !self.scale_carrier && !self.zero_point_carrier
    }
}

/// Concrete tensor descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Desc {
    pub dims: Dims,
    pub dtype: DType,
    pub format: Format,
    pub extra: Extra,
}

impl Desc {
    /// Dense row-major descriptor.
    pub fn contiguous(dims: &[i64], dtype: DType) -> Self {
        let strides = contiguous_strides(dims);
        Self { dims: SmallVec::from_slice(dims), dtype, format: Format::Strided(strides), extra: Extra::default() }
    }

    /// Descriptor realizing a well-known plain tag.
    pub fn with_tag(dims: &[i64], dtype: DType, tag: FormatTag) -> Result<Self> {
        let strides = tag.strides(dims)?;
        Ok(Self { dims: SmallVec::from_slice(dims), dtype, format: Format::Strided(strides), extra: Extra::default() })
    }

    pub fn strided(dims: &[i64], strides: &[i64], dtype: DType) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
            dtype,
            format: Format::Strided(SmallVec::from_slice(strides)),
            extra: Extra::default(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn nelems(&self) -> i64 {
        self.dims.iter().product::<i64>().max(0)
    }

    /// Strides when the format is plain.
    pub fn strides(&self) -> Option<&[i64]> {
        match &self.format {
            Format::Strided(strides) => Some(strides),
            Format::Blocked { .. } => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.format, Format::Blocked { .. })
    }

    /// Bytes spanned by the descriptor, padding included.
    pub fn size(&self) -> usize {
        if self.dims.iter().any(|&d| d == 0) {
            return 0;
        }
        let elems = match &self.format {
            Format::Strided(strides) => {
                // Last addressable element plus one.
                let span: i64 = self.dims.iter().zip(strides.iter()).map(|(&d, &s)| (d - 1) * s).sum();
                span + 1
            }
            Format::Blocked { .. } => {
                // Blocked layouts here are dense up to block padding.
                self.dims
                    .iter()
                    .enumerate()
                    .map(|(axis, &d)| {
                        let block = self.block_of(axis);
                        ((d + block - 1) / block) * block
                    })
                    .product()
            }
        };
        elems as usize * self.dtype.bytes()
    }

    fn block_of(&self, axis: usize) -> i64 {
        match &self.format {
            Format::Strided(_) => 1,
            Format::Blocked { inner_blocks, inner_idxs, .. } => inner_idxs
                .iter()
                .zip(inner_blocks.iter())
                .filter(|&(&idx, _)| idx as usize == axis)
                .map(|(_, &b)| b)
                .product::<i64>()
                .max(1),
        }
    }

    /// Recover a well-known plain tag from the strides, if one applies.
    pub fn tag(&self) -> Option<FormatTag> {
        use strum::IntoEnumIterator;
        let strides = self.strides()?;
        FormatTag::iter()
            .filter(|tag| *tag != FormatTag::Undef)
            .find(|tag| tag.strides(&self.dims).is_ok_and(|expected| expected.as_slice() == strides))
    }

    /// Linear element offset of a coordinate. Plain layouts only.
    pub fn offset_of(&self, coord: &[i64]) -> i64 {
        debug_assert_eq!(coord.len(), self.dims.len());
        match &self.format {
            Format::Strided(strides) => coord.iter().zip(strides.iter()).map(|(&c, &s)| c * s).sum(),
            Format::Blocked { .. } => unreachable!("blocked layouts are never addressed element-wise"),
        }
    }
}

/// Dense row-major strides for the given dims.
pub fn contiguous_strides(dims: &[i64]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(0, dims.len());
    let mut acc = 1i64;
    for axis in (0..dims.len()).rev() {
        strides[axis] = acc;
        acc *= dims[axis].max(1);
    }
    strides
}
