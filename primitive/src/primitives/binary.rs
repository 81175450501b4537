use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{PostOp, Primitive, apply_post_ops, broadcastable, check_executable, next_coord, read_broadcast_f32,
            write_f32};

/// Elementwise binary algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum BinaryAlg {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
}

impl BinaryAlg {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Subtract => a - b,
            Self::Multiply => a * b,
            Self::Divide => a / b,
            Self::Maximum => a.max(b),
            Self::Minimum => a.min(b),
        }
    }
}

/// Elementwise binary with numpy-style broadcasting and an optional fused
/// post-op chain.
#[derive(Debug)]
pub struct BinaryPrimitive {
    alg: BinaryAlg,
    dst: Desc,
    post_ops: Vec<PostOp>,
}

impl BinaryPrimitive {
    pub fn new(alg: BinaryAlg, src0: Desc, src1: Desc, dst: Desc, post_ops: Vec<PostOp>) -> Result<Self> {
        check_executable(&src0, "binary")?;
        check_executable(&src1, "binary")?;
        check_executable(&dst, "binary")?;
        for (name, src) in [("src0", &src0), ("src1", &src1)] {
            if !broadcastable(&src.dims, &dst.dims) {
                return DescriptorMismatchSnafu {
                    what: "binary",
                    reason: format!("{name} dims {:?} do not broadcast to dst dims {:?}", src.dims, dst.dims),
                }
                .fail();
            }
        }
        Ok(Self { alg, dst, post_ops })
    }
}

impl Primitive for BinaryPrimitive {
    fn kind_name(&self) -> &'static str {
        "binary"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src0 = args.required(ArgSlot::Src(0))?;
        let src1 = args.required(ArgSlot::Src(1))?;
        let dst = args.required(ArgSlot::Dst)?;
        let mut coord = vec![0i64; self.dst.dims.len()];
        loop {
            let a = unsafe { read_broadcast_f32(src0, &coord) };
            let b = unsafe { read_broadcast_f32(src1, &coord) };
            let value = unsafe { apply_post_ops(&self.post_ops, args, &coord, self.alg.apply(a, b)) }?;
            unsafe { write_f32(dst, &coord, value) };
            if !next_coord(&mut coord, &self.dst.dims) {
                break;
            }
        }
        Ok(())
    }

    fn inplace_candidate(&self) -> Option<(ArgSlot, ArgSlot)> {
        Some((ArgSlot::Src(0), ArgSlot::Dst))
    }
}
