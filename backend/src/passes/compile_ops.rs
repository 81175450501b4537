//! Instantiate a primitive for every node, in execution order.

use fusor_graph::error::{InternalSnafu, Result};
use fusor_primitive::memory::Desc;
use fusor_primitive::primitives::{
    BinaryPrimitive, ConvDesc, ConvPrimitive, EltwisePrimitive, MatmulPrimitive, PoolDesc, PoolPrimitive, Primitive,
    ReorderPrimitive, SoftmaxPrimitive, SumPrimitive,
};
use tracing::debug;

use crate::ir::{Executable, InternalKind, OpId, Subgraph};

pub fn compile_ops(sg: &mut Subgraph) -> Result<()> {
    snafu::ensure!(
        !sg.exec_order.is_empty(),
        InternalSnafu { reason: "compile_ops ran before memory planning fixed the execution order".to_string() }
    );

    let order = sg.exec_order.clone();
    let mut executables = Vec::with_capacity(order.len());
    for &op in &order {
        let primitive = build_primitive(sg, op)?;
        executables.push(Executable { node: op, primitive });
    }
    debug!(n_executables = executables.len(), "compiled all subgraph ops");
    sg.executables = executables;
    Ok(())
}

fn build_primitive(sg: &Subgraph, op: OpId) -> Result<Box<dyn Primitive>> {
    let node = sg.node(op);
    let in_desc = |k: usize| -> Result<Desc> {
        match sg.value(node.inputs[k]).desc.clone() {
            Some(desc) => Ok(desc),
            None => InternalSnafu { reason: format!("input {k} of {} has no descriptor", node.kind) }.fail(),
        }
    };
    let out_desc = match sg.value(node.outputs[0]).desc.clone() {
        Some(desc) => desc,
        None => {
            return InternalSnafu { reason: format!("output of {} has no descriptor", node.kind) }.fail();
        }
    };
    let missing_attr =
        |what: &str| InternalSnafu { reason: format!("{} node is missing its {what} attribute", node.kind) }.fail();

    let primitive: Box<dyn Primitive> = match node.kind {
        InternalKind::Conv => {
            let bias = if node.attrs.with_bias { Some(in_desc(2)?) } else { None };
            let desc = ConvDesc::builder()
                .src(in_desc(0)?)
                .weights(in_desc(1)?)
                .maybe_bias(bias)
                .dst(out_desc)
                .strides(node.attrs.strides.unwrap_or([1, 1]))
                .pads_begin(node.attrs.pads_begin.unwrap_or([0, 0]))
                .pads_end(node.attrs.pads_end.unwrap_or([0, 0]))
                .dilations(node.attrs.dilations.unwrap_or([1, 1]))
                .build();
            Box::new(ConvPrimitive::new(desc, node.post_ops.clone())?)
        }
        InternalKind::Matmul => {
            let bias = if node.attrs.with_bias { Some(in_desc(2)?) } else { None };
            Box::new(MatmulPrimitive::new(in_desc(0)?, in_desc(1)?, bias, out_desc, node.post_ops.clone())?)
        }
        InternalKind::Binary => {
            let Some(alg) = node.attrs.binary else {
                return missing_attr("algorithm");
            };
            Box::new(BinaryPrimitive::new(alg, in_desc(0)?, in_desc(1)?, out_desc, node.post_ops.clone())?)
        }
        InternalKind::Eltwise => {
            let Some(alg) = node.attrs.eltwise else {
                return missing_attr("algorithm");
            };
            Box::new(EltwisePrimitive::new(alg, in_desc(0)?, out_desc)?)
        }
        InternalKind::Sum => {
            let srcs: Vec<Desc> = (0..node.inputs.len()).map(in_desc).collect::<Result<_>>()?;
            Box::new(SumPrimitive::new(&srcs, out_desc)?)
        }
        InternalKind::Pool => {
            let Some(alg) = node.attrs.pool else {
                return missing_attr("algorithm");
            };
            let Some(kernel) = node.attrs.kernel else {
                return missing_attr("kernel");
            };
            let desc = PoolDesc::builder()
                .alg(alg)
                .src(in_desc(0)?)
                .dst(out_desc)
                .kernel(kernel)
                .strides(node.attrs.strides.unwrap_or([1, 1]))
                .pads_begin(node.attrs.pads_begin.unwrap_or([0, 0]))
                .pads_end(node.attrs.pads_end.unwrap_or([0, 0]))
                .build();
            Box::new(PoolPrimitive::new(desc)?)
        }
        InternalKind::Softmax => {
            let Some(axis) = node.attrs.axis else {
                return missing_attr("axis");
            };
            Box::new(SoftmaxPrimitive::new(in_desc(0)?, out_desc, axis)?)
        }
        InternalKind::Reorder => Box::new(ReorderPrimitive::new(in_desc(0)?, out_desc)?),
    };
    Ok(primitive)
}
