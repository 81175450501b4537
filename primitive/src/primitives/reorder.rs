use crate::args::{ArgSlot, ExecArgs};
use crate::error::{DescriptorMismatchSnafu, Result};
use crate::memory::Desc;
use crate::stream::Stream;

use super::{Primitive, check_executable, next_coord, read_f32, write_f32};

/// Layout conversion: copies every logical element from the source layout to
/// the destination layout. Dims and dtype must agree; strides may not.
#[derive(Debug)]
pub struct ReorderPrimitive {
    dst: Desc,
}

impl ReorderPrimitive {
    pub fn new(src: Desc, dst: Desc) -> Result<Self> {
        check_executable(&src, "reorder")?;
        check_executable(&dst, "reorder")?;
        if src.dims != dst.dims || src.dtype != dst.dtype {
            return DescriptorMismatchSnafu {
                what: "reorder",
                reason: format!("src {:?}/{} vs dst {:?}/{}", src.dims, src.dtype, dst.dims, dst.dtype),
            }
            .fail();
        }
        Ok(Self { dst })
    }
}

impl Primitive for ReorderPrimitive {
    fn kind_name(&self) -> &'static str {
        "reorder"
    }

    unsafe fn execute(&self, _stream: &Stream, args: &ExecArgs) -> Result<()> {
        let src = args.required(ArgSlot::Src(0))?;
        let dst = args.required(ArgSlot::Dst)?;
        let mut coord = vec![0i64; self.dst.dims.len()];
        loop {
            let value = unsafe { read_f32(src, &coord) };
            unsafe { write_f32(dst, &coord, value) };
            if !next_coord(&mut coord, &self.dst.dims) {
                break;
            }
        }
        Ok(())
    }
}
