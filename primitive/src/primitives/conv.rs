use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{PostOp, Primitive, apply_post_ops, check_executable, read_f32, write_f32};

/// Construction parameters of a 2-d convolution.
///
/// Layouts: src `[N, IC, H, W]`, weights `[OC, IC, KH, KW]`, bias `[OC]`,
/// dst `[N, OC, OH, OW]`.
#[derive(Debug, Clone, bon::Builder)]
pub struct ConvDesc {
    pub src: Desc,
    pub weights: Desc,
    pub bias: Option<Desc>,
    pub dst: Desc,
    #[builder(default = [1, 1])]
    pub strides: [i64; 2],
    #[builder(default = [0, 0])]
    pub pads_begin: [i64; 2],
    #[builder(default = [0, 0])]
    pub pads_end: [i64; 2],
    #[builder(default = [1, 1])]
    pub dilations: [i64; 2],
}

/// Direct NCHW convolution with optional bias and fused post-ops.
#[derive(Debug)]
pub struct ConvPrimitive {
    desc: ConvDesc,
    post_ops: Vec<PostOp>,
}

/// Output extent of one spatial axis.
pub fn conv_out_dim(in_dim: i64, kernel: i64, stride: i64, pad_begin: i64, pad_end: i64, dilation: i64) -> i64 {
    let effective_kernel = (kernel - 1) * dilation + 1;
    (in_dim + pad_begin + pad_end - effective_kernel) / stride + 1
}

impl ConvPrimitive {
    pub fn new(desc: ConvDesc, post_ops: Vec<PostOp>) -> Result<Self> {
        check_executable(&desc.src, "conv")?;
        check_executable(&desc.weights, "conv")?;
        check_executable(&desc.dst, "conv")?;
        if let Some(bias) = &desc.bias {
            check_executable(bias, "conv")?;
        }

        let mismatch = |reason: String| DescriptorMismatchSnafu { what: "conv", reason }.fail();
        if desc.src.rank() != 4 || desc.weights.rank() != 4 || desc.dst.rank() != 4 {
            return mismatch(format!(
                "expected rank-4 src/weights/dst, got {}/{}/{}",
                desc.src.rank(),
                desc.weights.rank(),
                desc.dst.rank()
            ));
        }

        let [n, ic, h, w] = [desc.src.dims[0], desc.src.dims[1], desc.src.dims[2], desc.src.dims[3]];
        let [oc, wic, kh, kw] =
            [desc.weights.dims[0], desc.weights.dims[1], desc.weights.dims[2], desc.weights.dims[3]];
        if wic != ic {
            return mismatch(format!("weights input channels {wic} != src channels {ic}"));
        }
        if let Some(bias) = &desc.bias
            && bias.dims.as_slice() != [oc]
        {
            return mismatch(format!("bias dims {:?} != [{oc}]", bias.dims));
        }

        let oh = conv_out_dim(h, kh, desc.strides[0], desc.pads_begin[0], desc.pads_end[0], desc.dilations[0]);
        let ow = conv_out_dim(w, kw, desc.strides[1], desc.pads_begin[1], desc.pads_end[1], desc.dilations[1]);
        if desc.dst.dims.as_slice() != [n, oc, oh, ow] {
            return mismatch(format!("dst dims {:?} != inferred [{n}, {oc}, {oh}, {ow}]", desc.dst.dims));
        }

        Ok(Self { desc, post_ops })
    }
}

impl Primitive for ConvPrimitive {
    fn kind_name(&self) -> &'static str {
        "conv"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let weights = args.required(ArgSlot::Weights)?;
        let bias = if self.desc.bias.is_some() { Some(args.required(ArgSlot::Bias)?) } else { None };
        let dst = args.required(ArgSlot::Dst)?;

        let [_, ic, h, w] = [self.desc.src.dims[0], self.desc.src.dims[1], self.desc.src.dims[2], self.desc.src.dims[3]];
        let [kh, kw] = [self.desc.weights.dims[2], self.desc.weights.dims[3]];
        let [n, oc, oh, ow] =
            [self.desc.dst.dims[0], self.desc.dst.dims[1], self.desc.dst.dims[2], self.desc.dst.dims[3]];
        let [sh, sw] = self.desc.strides;
        let [pbh, pbw] = self.desc.pads_begin;
        let [dh, dw] = self.desc.dilations;

        for on in 0..n {
            for oco in 0..oc {
                let bias_val = match bias {
                    Some(bias) => unsafe { read_f32(bias, &[oco]) },
                    None => 0.0,
                };
                for ohi in 0..oh {
                    for owi in 0..ow {
                        let mut acc = bias_val;
                        for ici in 0..ic {
                            for khi in 0..kh {
                                let ih = ohi * sh - pbh + khi * dh;
                                if ih < 0 || ih >= h {
                                    continue;
                                }
                                for kwi in 0..kw {
                                    let iw = owi * sw - pbw + kwi * dw;
                                    if iw < 0 || iw >= w {
                                        continue;
                                    }
                                    let s = unsafe { read_f32(src, &[on, ici, ih, iw]) };
                                    let k = unsafe { read_f32(weights, &[oco, ici, khi, kwi]) };
                                    acc += s * k;
                                }
                            }
                        }
                        let coord = [on, oco, ohi, owi];
                        let value = unsafe { apply_post_ops(&self.post_ops, args, &coord, acc) }?;
                        unsafe { write_f32(dst, &coord, value) };
                    }
                }
            }
        }
        Ok(())
    }
}
