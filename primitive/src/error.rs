use fusor_dtype::{DType, EngineKind};
use snafu::Snafu;

use crate::args::ArgSlot;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the primitive library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// No implementation for the requested dtype.
    #[snafu(display("unsupported data type {dtype} for {what}"))]
    UnsupportedDType { dtype: DType, what: &'static str },

    /// Descriptors handed to a primitive do not agree with each other.
    #[snafu(display("descriptor mismatch in {what}: {reason}"))]
    DescriptorMismatch { what: &'static str, reason: String },

    /// The reference primitives only execute plain strided layouts.
    #[snafu(display("{what} cannot execute a blocked layout"))]
    BlockedLayoutUnsupported { what: &'static str },

    /// A format tag cannot describe the requested dims.
    #[snafu(display("format tag {tag} does not apply to rank-{rank} dims"))]
    TagRankMismatch { tag: &'static str, rank: usize },

    /// An execution argument slot was not bound.
    #[snafu(display("missing execution argument {slot:?}"))]
    MissingArgument { slot: ArgSlot },

    /// Allocation failed.
    #[snafu(display("allocation of {size} bytes failed"))]
    AllocationFailed { size: usize },

    /// The engine kind is not available in this build.
    #[snafu(display("engine kind {kind} is not available in this build"))]
    EngineUnavailable { kind: EngineKind },
}
