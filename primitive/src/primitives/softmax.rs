use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{Primitive, check_executable, next_coord, read_f32, write_f32};

/// Softmax along one axis, max-subtracted for stability.
#[derive(Debug)]
pub struct SoftmaxPrimitive {
    dst: Desc,
    axis: usize,
}

impl SoftmaxPrimitive {
    pub fn new(src: Desc, dst: Desc, axis: usize) -> Result<Self> {
        check_executable(&src, "softmax")?;
        check_executable(&dst, "softmax")?;
        if src.dims != dst.dims {
            return DescriptorMismatchSnafu {
                what: "softmax",
                reason: format!("src dims {:?} != dst dims {:?}", src.dims, dst.dims),
            }
            .fail();
        }
        if axis >= dst.rank() {
            return DescriptorMismatchSnafu {
                what: "softmax",
                reason: format!("axis {axis} out of range for rank {}", dst.rank()),
            }
            .fail();
        }
        Ok(Self { dst, axis })
    }
}

impl Primitive for SoftmaxPrimitive {
    fn kind_name(&self) -> &'static str {
        "softmax"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let dst = args.required(ArgSlot::Dst)?;

        // Iterate lanes: every coordinate with the softmax axis pinned to 0.
        let mut lane_dims = self.dst.dims.clone();
        let axis_len = lane_dims[self.axis];
        lane_dims[self.axis] = 1;

        let mut coord = vec![0i64; self.dst.dims.len()];
        loop {
            let mut max = f32::NEG_INFINITY;
            for i in 0..axis_len {
                coord[self.axis] = i;
                max = max.max(unsafe { read_f32(src, &coord) });
            }
            let mut denom = 0.0f32;
            for i in 0..axis_len {
                coord[self.axis] = i;
                denom += (unsafe { read_f32(src, &coord) } - max).exp();
            }
            for i in 0..axis_len {
                coord[self.axis] = i;
                let value = (unsafe { read_f32(src, &coord) } - max).exp() / denom;
                unsafe { write_f32(dst, &coord, value) };
            }
            coord[self.axis] = 0;
            if !next_coord(&mut coord, &lane_dims) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fusor_dtype::DType;

    use super::super::tests_support::run_unary;
    use super::*;

    #[test]
    fn rows_sum_to_one() {
        let desc = Desc::contiguous(&[2, 3], DType::F32);
        let prim = SoftmaxPrimitive::new(desc.clone(), desc.clone(), 1).unwrap();
        let out = run_unary(&prim, &desc, &desc, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);

        let row0: f32 = out[..3].iter().sum();
        let row1: f32 = out[3..].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
        assert!((row1 - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn axis_out_of_range() {
        let desc = Desc::contiguous(&[2, 3], DType::F32);
        assert!(SoftmaxPrimitive::new(desc.clone(), desc, 2).is_err());
    }
}
