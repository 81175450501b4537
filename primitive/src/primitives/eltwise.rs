use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{Primitive, check_executable, next_coord, read_f32, write_f32};

/// Elementwise activation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum EltwiseAlg {
    Relu,
    Sigmoid,
    Tanh,
}

impl EltwiseAlg {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }
}

/// Forward elementwise activation.
#[derive(Debug)]
pub struct EltwisePrimitive {
    alg: EltwiseAlg,
    src: Desc,
    dst: Desc,
}

impl EltwisePrimitive {
    pub fn new(alg: EltwiseAlg, src: Desc, dst: Desc) -> Result<Self> {
        check_executable(&src, "eltwise")?;
        check_executable(&dst, "eltwise")?;
        if src.dims != dst.dims {
            return DescriptorMismatchSnafu {
                what: "eltwise",
                reason: format!("src dims {:?} != dst dims {:?}", src.dims, dst.dims),
            }
            .fail();
        }
        Ok(Self { alg, src, dst })
    }
}

impl Primitive for EltwisePrimitive {
    fn kind_name(&self) -> &'static str {
        "eltwise"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let dst = args.required(ArgSlot::Dst)?;
        let mut coord = vec![0i64; self.dst.dims.len()];
        loop {
            let value = self.alg.apply(unsafe { read_f32(src, &coord) });
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
