//! Element types and engine kinds shared across the fusor stack.
//!
//! This crate is the dependency leaf: both the outer graph library and the
//! primitive library speak in terms of [`DType`] and [`EngineKind`] without
//! depending on each other.

/// Element type of a tensor.
///
/// The set matches what the compute primitives can be asked for. Compute is
/// carried out in f32; the remaining types exist so descriptors, schemas and
/// layout interning can reason about them.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumCount, strum::EnumIter)]
#[derive(enumset::EnumSetType)]
#[derive(serde::Serialize, serde::Deserialize)]
#[enumset(repr = "u8")]
pub enum DType {
    F32 = 0,
    BF16 = 1,
    F16 = 2,
    S32 = 3,
    S8 = 4,
    U8 = 5,
}

impl DType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::F32 | Self::S32 => 4,
            Self::BF16 | Self::F16 => 2,
            Self::S8 | Self::U8 => 1,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::BF16 | Self::F16)
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::S32 | Self::S8 | Self::U8)
    }
}

/// Kind of compute device an engine is bound to.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumCount, strum::EnumIter)]
#[derive(enumset::EnumSetType)]
#[derive(serde::Serialize, serde::Deserialize)]
#[enumset(repr = "u8")]
pub enum EngineKind {
    Cpu = 0,
    Gpu = 1,
}
