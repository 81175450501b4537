use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{PostOp, Primitive, apply_post_ops, broadcastable, check_executable, read_broadcast_f32, read_f32,
            write_f32};

/// 2-d matrix multiply `dst[M,N] = src[M,K] x weights[K,N] (+ bias)` with a
/// fused post-op chain.
#[derive(Debug)]
pub struct MatmulPrimitive {
    src: Desc,
    has_bias: bool,
    dst: Desc,
    post_ops: Vec<PostOp>,
}

impl MatmulPrimitive {
    pub fn new(src: Desc, weights: Desc, bias: Option<Desc>, dst: Desc, post_ops: Vec<PostOp>) -> Result<Self> {
        check_executable(&src, "matmul")?;
        check_executable(&weights, "matmul")?;
        check_executable(&dst, "matmul")?;

        let mismatch = |reason: String| DescriptorMismatchSnafu { what: "matmul", reason }.fail();
        if src.rank() != 2 || weights.rank() != 2 || dst.rank() != 2 {
            return mismatch("expected rank-2 src, weights and dst".to_string());
        }
        let (m, k) = (src.dims[0], src.dims[1]);
        let (wk, n) = (weights.dims[0], weights.dims[1]);
        if wk != k {
            return mismatch(format!("weights rows {wk} != src columns {k}"));
        }
        if dst.dims.as_slice() != [m, n] {
            return mismatch(format!("dst dims {:?} != inferred [{m}, {n}]", dst.dims));
        }
        if let Some(bias) = &bias {
            check_executable(bias, "matmul")?;
            if !broadcastable(&bias.dims, &dst.dims) {
                return mismatch(format!("bias dims {:?} do not broadcast to [{m}, {n}]", bias.dims));
            }
        }

        Ok(Self { src, has_bias: bias.is_some(), dst, post_ops })
    }
}

impl Primitive for MatmulPrimitive {
    fn kind_name(&self) -> &'static str {
        "matmul"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let weights = args.required(ArgSlot::Weights)?;
        let bias = if self.has_bias { Some(args.required(ArgSlot::Bias)?) } else { None };
        let dst = args.required(ArgSlot::Dst)?;

        let (m, k) = (self.src.dims[0], self.src.dims[1]);
        let n = self.dst.dims[1];
        for mi in 0..m {
            for ni in 0..n {
                let mut acc = 0.0f32;
                for ki in 0..k {
                    acc += unsafe { read_f32(src, &[mi, ki]) * read_f32(weights, &[ki, ni]) };
                }
                let coord = [mi, ni];
                if let Some(bias) = bias {
                    acc += unsafe { read_broadcast_f32(bias, &coord) };
                }
                let value = unsafe { apply_post_ops(&self.post_ops, args, &coord, acc) }?;
                unsafe { write_f32(dst, &coord, value) };
            }
        }
        Ok(())
    }
}
