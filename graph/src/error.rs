//! The status taxonomy every backend reports through.
//!
//! Success is `Ok(())`; everything else is one of five categories. Backends
//! never panic across this boundary.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A caller-provided shape, dtype or layout is inconsistent.
    #[snafu(display("invalid arguments: {reason}"))]
    InvalidArguments { reason: String },

    /// The graph itself is malformed (duplicate tensors, bad arity, ...).
    #[snafu(display("invalid graph: {reason}"))]
    InvalidGraph { reason: String },

    /// No backend implementation for the requested op/dtype/engine.
    #[snafu(display("unimplemented: {reason}"))]
    Unimplemented { reason: String },

    /// Scratchpad or interning allocation failed.
    #[snafu(display("out of memory: {reason}"))]
    OutOfMemory { reason: String },

    /// A backend invariant was violated.
    #[snafu(display("internal error: {reason}"))]
    Internal { reason: String },
}

impl From<fusor_primitive::Error> for Error {
    fn from(err: fusor_primitive::Error) -> Self {
        use fusor_primitive::Error as P;
        match err {
            P::UnsupportedDType { .. } | P::BlockedLayoutUnsupported { .. } | P::EngineUnavailable { .. } => {
                Self::Unimplemented { reason: err.to_string() }
            }
            P::DescriptorMismatch { .. } | P::TagRankMismatch { .. } => {
                Self::InvalidArguments { reason: err.to_string() }
            }
            P::AllocationFailed { .. } => Self::OutOfMemory { reason: err.to_string() },
            P::MissingArgument { .. } => Self::Internal { reason: err.to_string() },
        }
    }
}
