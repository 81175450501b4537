//! Framework-level ops and their attributes.

use indexmap::IndexMap;

use crate::logical_tensor::LogicalTensor;

/// The op vocabulary a graph is built from. This is what frameworks speak;
/// backends lower it to their own internal vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter)]
pub enum OpKind {
    Convolution,
    MatMul,
    BiasAdd,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    MaxPool,
    AvgPool,
    Reorder,
    /// Marks an output as intentionally unconsumed. Never partitioned.
    End,
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    I64(i64),
    F32(f32),
    Str(String),
    I64s(Vec<i64>),
}

/// Well-known attribute names.
pub mod attr {
    pub const STRIDES: &str = "strides";
    pub const PADS_BEGIN: &str = "pads_begin";
    pub const PADS_END: &str = "pads_end";
    pub const DILATIONS: &str = "dilations";
    pub const KERNEL: &str = "kernel";
    pub const AXIS: &str = "axis";
}

/// A node in the user graph. Edges are formed by logical-tensor id equality:
/// an op consuming tensor 5 is a consumer of whichever op produced tensor 5.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: u64,
    pub kind: OpKind,
    pub name: String,
    pub attrs: IndexMap<String, AttrValue>,
    pub inputs: Vec<LogicalTensor>,
    pub outputs: Vec<LogicalTensor>,
}

impl Op {
    pub fn new(id: u64, kind: OpKind, name: impl Into<String>) -> Self {
        Self { id, kind, name: name.into(), attrs: IndexMap::new(), inputs: Vec::new(), outputs: Vec::new() }
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn with_input(mut self, lt: LogicalTensor) -> Self {
        self.inputs.push(lt);
        self
    }

    pub fn with_output(mut self, lt: LogicalTensor) -> Self {
        self.outputs.push(lt);
        self
    }

    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_i64s(&self, name: &str) -> Option<&[i64]> {
        match self.attrs.get(name) {
            Some(AttrValue::I64s(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_f32(&self, name: &str) -> Option<f32> {
        match self.attrs.get(name) {
            Some(AttrValue::F32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        match self.attrs.get(name) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }
}
