use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::conv::conv_out_dim;
use super::{Primitive, check_executable, read_f32, write_f32};

/// Pooling algorithm. Average pooling excludes padding from the divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum PoolAlg {
    Max,
    Avg,
}

/// Construction parameters of a 2-d pooling over NCHW.
#[derive(Debug, Clone, bon::Builder)]
pub struct PoolDesc {
    pub alg: PoolAlg,
    pub src: Desc,
    pub dst: Desc,
    pub kernel: [i64; 2],
    #[builder(default = [1, 1])]
    pub strides: [i64; 2],
    #[builder(default = [0, 0])]
    pub pads_begin: [i64; 2],
    #[builder(default = [0, 0])]
    pub pads_end: [i64; 2],
}

#[derive(Debug)]
pub struct PoolPrimitive {
    desc: PoolDesc,
}

impl PoolPrimitive {
    pub fn new(desc: PoolDesc) -> Result<Self> {
        check_executable(&desc.src, "pool")?;
        check_executable(&desc.dst, "pool")?;

        let mismatch = |reason: String| DescriptorMismatchSnafu { what: "pool", reason }.fail();
        if desc.src.rank() != 4 || desc.dst.rank() != 4 {
            return mismatch("expected rank-4 src and dst".to_string());
        }
        let [n, c, h, w] = [desc.src.dims[0], desc.src.dims[1], desc.src.dims[2], desc.src.dims[3]];
        let oh = conv_out_dim(h, desc.kernel[0], desc.strides[0], desc.pads_begin[0], desc.pads_end[0], 1);
        let ow = conv_out_dim(w, desc.kernel[1], desc.strides[1], desc.pads_begin[1], desc.pads_end[1], 1);
        if desc.dst.dims.as_slice() != [n, c, oh, ow] {
            return mismatch(format!("dst dims {:?} != inferred [{n}, {c}, {oh}, {ow}]", desc.dst.dims));
        }
        Ok(Self { desc })
    }
}

impl Primitive for PoolPrimitive {
    fn kind_name(&self) -> &'static str {
        "pool"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let dst = args.required(ArgSlot::Dst)?;

        let [h, w] = [self.desc.src.dims[2], self.desc.src.dims[3]];
        let [n, c, oh, ow] =
            [self.desc.dst.dims[0], self.desc.dst.dims[1], self.desc.dst.dims[2], self.desc.dst.dims[3]];
        let [kh, kw] = self.desc.kernel;
        let [sh, sw] = self.desc.strides;
        let [pbh, pbw] = self.desc.pads_begin;

        for ni in 0..n {
            for ci in 0..c {
                for ohi in 0..oh {
                    for owi in 0..ow {
                        let mut acc = match self.desc.alg {
                            PoolAlg::Max => f32::NEG_INFINITY,
                            PoolAlg::Avg => 0.0,
                        };
                        let mut count = 0i64;
                        for khi in 0..kh {
                            let ih = ohi * sh - pbh + khi;
                            if ih < 0 || ih >= h {
                                continue;
                            }
                            for kwi in 0..kw {
                                let iw = owi * sw - pbw + kwi;
                                if iw < 0 || iw >= w {
                                    continue;
                                }
                                let value = unsafe { read_f32(src, &[ni, ci, ih, iw]) };
                                match self.desc.alg {
                                    PoolAlg::Max => acc = acc.max(value),
                                    PoolAlg::Avg => acc += value,
                                }
                                count += 1;
                            }
                        }
                        let out = match self.desc.alg {
                            PoolAlg::Max => acc,
                            PoolAlg::Avg => acc / count.max(1) as f32,
                        };
                        unsafe { write_f32(dst, &[ni, ci, ohi, owi], out) };
                    }
                }
            }
        }
        Ok(())
    }
}
