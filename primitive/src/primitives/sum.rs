use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{Primitive, check_executable, next_coord, read_f32, write_f32};

/// N-ary elementwise sum: `dst = src_0 + src_1 + ... + src_{n-1}`.
///
/// All sources share the destination's dims. This is the single fused
/// primitive a chain of additions collapses into.
#[derive(Debug)]
pub struct SumPrimitive {
    n_srcs: usize,
    dst: Desc,
}

impl SumPrimitive {
    pub fn new(srcs: &[Desc], dst: Desc) -> Result<Self> {
        if srcs.len() < 2 {
            return DescriptorMismatchSnafu { what: "sum", reason: format!("needs at least 2 sources, got {}", srcs.len()) }
                .fail();
        }
        check_executable(&dst, "sum")?;
        for (i, src) in srcs.iter().enumerate() {
            check_executable(src, "sum")?;
            if src.dims != dst.dims {
                return DescriptorMismatchSnafu {
                    what: "sum",
                    reason: format!("src {i} dims {:?} != dst dims {:?}", src.dims, dst.dims),
                }
                .fail();
            }
        }
        Ok(Self { n_srcs: srcs.len(), dst })
    }

    pub fn n_srcs(&self) -> usize {
        self.n_srcs
    }
}

impl Primitive for SumPrimitive {
    fn kind_name(&self) -> &'static str {
        "sum"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let dst = args.required(ArgSlot::Dst)?;
        let mut coord = vec![0i64; self.dst.dims.len()];
        loop {
            let mut acc = 0.0f32;
            for i in 0..self.n_srcs {
                let src = args.required(ArgSlot::MultiSrc(i))?;
                acc += unsafe { read_f32(src, &coord) };
            }
            unsafe { write_f32(dst, &coord, acc) };
            if !next_coord(&mut coord, &self.dst.dims) {
                break;
            }
        }
        Ok(())
    }

    fn inplace_candidate(&self) -> Option<(ArgSlot, ArgSlot)> {
        Some((ArgSlot::MultiSrc(0), ArgSlot::Dst))
    }
}
