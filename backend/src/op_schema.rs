//! Schemas of the internal op vocabulary: arity, supported dtypes and shape
//! inference. Lowering validates every node it creates against these and uses
//! the inference functions to fill previously-unknown output dims.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use enumset::{EnumSet, enum_set};
use fusor_dtype::DType;
use fusor_graph::error::{InvalidArgumentsSnafu, Result, UnimplementedSnafu};
use fusor_graph::{DIM_UNKNOWN, Dims};
use fusor_primitive::conv_out_dim;
use smallvec::SmallVec;

use crate::ir::{InternalKind, NodeAttrs};

type InferFn = fn(&NodeAttrs, &[&[i64]]) -> Result<Dims>;

pub struct OpSchema {
    /// Allowed base input count (post-op extras not included).
    pub arity: RangeInclusive<usize>,
    pub dtypes: EnumSet<DType>,
    pub infer: InferFn,
}

pub struct OpSchemaRegistry {
    map: HashMap<InternalKind, OpSchema>,
}

impl Default for OpSchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpSchemaRegistry {
    pub fn new() -> Self {
        // The reference primitive set computes in f32 only.
        const F32_ONLY: EnumSet<DType> = enum_set!(DType::F32);

        let mut map = HashMap::new();
        map.insert(InternalKind::Conv, OpSchema { arity: 2..=3, dtypes: F32_ONLY, infer: infer_conv });
        map.insert(InternalKind::Matmul, OpSchema { arity: 2..=3, dtypes: F32_ONLY, infer: infer_matmul });
        map.insert(InternalKind::Binary, OpSchema { arity: 2..=2, dtypes: F32_ONLY, infer: infer_binary });
        map.insert(InternalKind::Eltwise, OpSchema { arity: 1..=1, dtypes: F32_ONLY, infer: infer_identity });
        map.insert(InternalKind::Sum, OpSchema { arity: 2..=usize::MAX, dtypes: F32_ONLY, infer: infer_sum });
        map.insert(InternalKind::Pool, OpSchema { arity: 1..=1, dtypes: F32_ONLY, infer: infer_pool });
        map.insert(InternalKind::Softmax, OpSchema { arity: 1..=1, dtypes: F32_ONLY, infer: infer_identity });
        map.insert(InternalKind::Reorder, OpSchema { arity: 1..=1, dtypes: F32_ONLY, infer: infer_identity });
        Self { map }
    }

    pub fn get(&self, kind: InternalKind) -> &OpSchema {
        // The registry covers the whole closed vocabulary.
        &self.map[&kind]
    }

    /// Check arity and dtypes, then infer the output dims.
    pub fn validate_and_infer(
        &self,
        kind: InternalKind,
        attrs: &NodeAttrs,
        input_dims: &[&[i64]],
        input_dtypes: &[DType],
    ) -> Result<Dims> {
        let schema = self.get(kind);
        snafu::ensure!(
            schema.arity.contains(&input_dims.len()),
            InvalidArgumentsSnafu { reason: format!("{kind} given {} inputs, expects {:?}", input_dims.len(), schema.arity) }
        );
        for dtype in input_dtypes {
            snafu::ensure!(
                schema.dtypes.contains(*dtype),
                UnimplementedSnafu { reason: format!("{kind} has no implementation for {dtype}") }
            );
        }
        for dims in input_dims {
            snafu::ensure!(
                dims.iter().all(|&d| d != DIM_UNKNOWN),
                InvalidArgumentsSnafu { reason: format!("{kind} input has unknown dims {dims:?}") }
            );
        }
        (schema.infer)(attrs, input_dims)
    }
}

fn rank_error(kind: &str, dims: &[i64]) -> Result<Dims> {
    InvalidArgumentsSnafu { reason: format!("{kind}: unexpected input rank for dims {dims:?}") }.fail()
}

fn infer_identity(_attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    Ok(SmallVec::from_slice(inputs[0]))
}

fn infer_sum(_attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    for dims in &inputs[1..] {
        snafu::ensure!(
            *dims == inputs[0],
            InvalidArgumentsSnafu { reason: format!("sum inputs disagree: {:?} vs {:?}", inputs[0], dims) }
        );
    }
    Ok(SmallVec::from_slice(inputs[0]))
}

/// Numpy trailing-alignment broadcast of two shapes.
pub fn broadcast_dims(a: &[i64], b: &[i64]) -> Result<Dims> {
    let rank = a.len().max(b.len());
    let mut out: Dims = SmallVec::with_capacity(rank);
    for axis in 0..rank {
        let da = if axis + a.len() >= rank { a[axis + a.len() - rank] } else { 1 };
        let db = if axis + b.len() >= rank { b[axis + b.len() - rank] } else { 1 };
        let dim = match (da, db) {
            _ if da == db => da,
            (1, d) | (d, 1) => d,
            _ => {
                return InvalidArgumentsSnafu { reason: format!("cannot broadcast dims {a:?} with {b:?}") }.fail();
            }
        };
        out.push(dim);
    }
    Ok(out)
}

fn infer_binary(_attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    broadcast_dims(inputs[0], inputs[1])
}

fn infer_matmul(_attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    let (src, weights) = (inputs[0], inputs[1]);
    if src.len() != 2 || weights.len() != 2 {
        return rank_error("matmul", src);
    }
    snafu::ensure!(
        src[1] == weights[0],
        InvalidArgumentsSnafu { reason: format!("matmul reduction dims disagree: {} vs {}", src[1], weights[0]) }
    );
    Ok(SmallVec::from_slice(&[src[0], weights[1]]))
}

fn infer_conv(attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    let (src, weights) = (inputs[0], inputs[1]);
    if src.len() != 4 || weights.len() != 4 {
        return rank_error("conv", src);
    }
    snafu::ensure!(
        weights[1] == src[1],
        InvalidArgumentsSnafu { reason: format!("conv channels disagree: src {} vs weights {}", src[1], weights[1]) }
    );
    let strides = attrs.strides.unwrap_or([1, 1]);
    let pads_begin = attrs.pads_begin.unwrap_or([0, 0]);
    let pads_end = attrs.pads_end.unwrap_or([0, 0]);
    let dilations = attrs.dilations.unwrap_or([1, 1]);

    let oh = conv_out_dim(src[2], weights[2], strides[0], pads_begin[0], pads_end[0], dilations[0]);
    let ow = conv_out_dim(src[3], weights[3], strides[1], pads_begin[1], pads_end[1], dilations[1]);
    snafu::ensure!(
        oh > 0 && ow > 0,
        InvalidArgumentsSnafu { reason: format!("conv window does not fit: output spatial dims [{oh}, {ow}]") }
    );
    Ok(SmallVec::from_slice(&[src[0], weights[0], oh, ow]))
}

fn infer_pool(attrs: &NodeAttrs, inputs: &[&[i64]]) -> Result<Dims> {
    let src = inputs[0];
    if src.len() != 4 {
        return rank_error("pool", src);
    }
    let kernel = match attrs.kernel {
        Some(kernel) => kernel,
        None => return InvalidArgumentsSnafu { reason: "pool is missing its kernel attribute".to_string() }.fail(),
    };
    let strides = attrs.strides.unwrap_or([1, 1]);
    let pads_begin = attrs.pads_begin.unwrap_or([0, 0]);
    let pads_end = attrs.pads_end.unwrap_or([0, 0]);

    let oh = conv_out_dim(src[2], kernel[0], strides[0], pads_begin[0], pads_end[0], 1);
    let ow = conv_out_dim(src[3], kernel[1], strides[1], pads_begin[1], pads_end[1], 1);
    snafu::ensure!(
        oh > 0 && ow > 0,
        InvalidArgumentsSnafu { reason: format!("pool window does not fit: output spatial dims [{oh}, {ow}]") }
    );
    Ok(SmallVec::from_slice(&[src[0], src[1], oh, ow]))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn conv_shape_matches_reference() {
        let registry = OpSchemaRegistry::new();
        let dims = registry
            .validate_and_infer(
                InternalKind::Conv,
                &NodeAttrs::default(),
                &[&[1, 3, 8, 8], &[16, 3, 3, 3]],
                &[DType::F32, DType::F32],
            )
            .unwrap();
        assert_eq!(dims.as_slice(), &[1, 16, 6, 6]);
    }

    #[test]
    fn bf16_conv_is_unimplemented() {
        let registry = OpSchemaRegistry::new();
        let err = registry
            .validate_and_infer(
                InternalKind::Conv,
                &NodeAttrs::default(),
                &[&[1, 3, 8, 8], &[16, 3, 3, 3]],
                &[DType::BF16, DType::BF16],
            )
            .unwrap_err();
        assert!(matches!(err, fusor_graph::Error::Unimplemented { .. }));
    }

    #[test_case(&[2, 3], &[3], &[2, 3]; "row broadcast")]
    #[test_case(&[4], &[1], &[4]; "scalar like")]
    #[test_case(&[1, 16, 6, 6], &[16, 1, 1], &[1, 16, 6, 6]; "channel broadcast")]
    fn broadcast_shapes(a: &[i64], b: &[i64], expected: &[i64]) {
        assert_eq!(broadcast_dims(a, b).unwrap().as_slice(), expected);
    }

    #[test]
    fn broadcast_mismatch_is_invalid() {
        assert!(broadcast_dims(&[3], &[4]).is_err());
    }

    #[test]
    fn matmul_reduction_must_agree() {
        let registry = OpSchemaRegistry::new();
        assert!(
            registry
                .validate_and_infer(
                    InternalKind::Matmul,
                    &NodeAttrs::default(),
                    &[&[2, 3], &[4, 2]],
                    &[DType::F32, DType::F32],
                )
                .is_err()
        );
    }

    #[test]
    fn unknown_input_dims_are_invalid() {
        let registry = OpSchemaRegistry::new();
        assert!(
            registry
                .validate_and_infer(InternalKind::Eltwise, &NodeAttrs::default(), &[&[2, DIM_UNKNOWN]], &[DType::F32])
                .is_err()
        );
    }
}
