//! The inbound fusion-group graph: typed values, operator nodes, and the
//! metadata the compiler reads off them.
//!
//! A fusion group is a DAG selected by an upstream graph optimizer. Nodes
//! are stored in topological order; values carry the shape, stride, dtype,
//! and device annotations the profiler attached.

pub mod shape;

use std::any::Any;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::dtype::{Device, ScalarType};
use crate::error::{Error, Result};
use crate::runtime::{contiguous_strides, TensorData};
use shape::SymDim;

/// Operator kind, e.g. `aten::add` or `prim::Constant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Symbol {
        Symbol(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Symbol {
        Symbol(name.to_string())
    }
}

/// Node kinds the compiler treats specially.
pub mod kinds {
    pub const CONSTANT: &str = "prim::Constant";
    pub const LIST_CONSTRUCT: &str = "prim::ListConstruct";
    pub const CONSTANT_CHUNK: &str = "prim::ConstantChunk";
    pub const TO: &str = "aten::to";
    pub const CONV2D: &str = "aten::conv2d";
    pub const QUANTIZE_PER_TENSOR: &str = "aten::quantize_per_tensor";
    pub const RAND_LIKE: &str = "aten::rand_like";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Type tag of a graph value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Tensor,
    Int,
    Float,
    Bool,
    None,
    IntList,
    DoubleList,
}

/// Payload of a `prim::Constant` node.
#[derive(Clone)]
pub enum ConstPayload {
    Int(i64),
    Double(f64),
    Bool(bool),
    None,
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    Tensor(TensorData),
    /// An opaque custom-class capsule, passed through to the generated code
    /// as a raw pointer.
    Capsule(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for ConstPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstPayload::Int(v) => write!(f, "Int({v})"),
            ConstPayload::Double(v) => write!(f, "Double({v})"),
            ConstPayload::Bool(v) => write!(f, "Bool({v})"),
            ConstPayload::None => write!(f, "None"),
            ConstPayload::IntList(v) => write!(f, "IntList({v:?})"),
            ConstPayload::DoubleList(v) => write!(f, "DoubleList({v:?})"),
            ConstPayload::Tensor(t) => write!(f, "Tensor({t:?})"),
            ConstPayload::Capsule(_) => write!(f, "Capsule"),
        }
    }
}

/// Everything the profiler knows about one value.
#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub name: String,
    pub vtype: ValueType,
    /// Symbolic shape; `None` when the rank itself is unknown.
    pub sym_sizes: Option<Vec<SymDim>>,
    /// Concrete strides, when profiled.
    pub strides: Option<Vec<i64>>,
    pub dtype: Option<ScalarType>,
    pub device: Option<Device>,
    /// Defining node, if any (graph inputs have none).
    pub node: Option<NodeId>,
    /// Index of this value among its defining node's outputs.
    pub offset: usize,
}

impl ValueInfo {
    fn scalar(name: &str, vtype: ValueType) -> ValueInfo {
        ValueInfo {
            name: name.to_string(),
            vtype,
            sym_sizes: None,
            strides: None,
            dtype: None,
            device: None,
            node: None,
            offset: 0,
        }
    }

    pub fn concrete_sizes(&self) -> Option<Vec<i64>> {
        shape::concrete_sizes(self.sym_sizes.as_deref()?)
    }

    /// True when sizes, strides, dtype, and device are all known and static.
    pub fn is_complete_tensor(&self) -> bool {
        self.vtype == ValueType::Tensor
            && self.concrete_sizes().is_some()
            && self.strides.is_some()
            && self.dtype.is_some()
            && self.device.is_some()
    }

    pub fn is_contiguous(&self) -> bool {
        match (self.concrete_sizes(), &self.strides) {
            (Some(sizes), Some(strides)) => shape::is_contiguous_layout(&sizes, strides),
            _ => false,
        }
    }
}

/// One operator application.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: Symbol,
    pub schema: Option<String>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attrs: FxHashMap<String, i64>,
    pub payload: Option<ConstPayload>,
}

/// A fusion-group graph. Nodes are kept in topological (insertion) order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<ValueInfo>,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    fn push_value(&mut self, info: ValueInfo) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(info);
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn defining_node(&self, id: ValueId) -> Option<&Node> {
        self.value(id).node.map(|n| self.node(n))
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// True if `id` feeds any node or is a graph output.
    pub fn has_uses(&self, id: ValueId) -> bool {
        self.outputs.contains(&id) || self.nodes.iter().any(|n| n.inputs.contains(&id))
    }

    // --- construction -----------------------------------------------------

    /// A contiguous tensor input with static sizes.
    pub fn tensor_input(
        &mut self,
        name: &str,
        sizes: &[i64],
        dtype: ScalarType,
        device: Device,
    ) -> ValueId {
        self.tensor_input_strided(name, sizes, &contiguous_strides(sizes), dtype, device)
    }

    /// A tensor input with explicit (possibly non-contiguous) strides.
    pub fn tensor_input_strided(
        &mut self,
        name: &str,
        sizes: &[i64],
        strides: &[i64],
        dtype: ScalarType,
        device: Device,
    ) -> ValueId {
        let id = self.push_value(ValueInfo {
            name: name.to_string(),
            vtype: ValueType::Tensor,
            sym_sizes: Some(shape::static_dims(sizes)),
            strides: Some(strides.to_vec()),
            dtype: Some(dtype),
            device: Some(device),
            node: None,
            offset: 0,
        });
        self.inputs.push(id);
        id
    }

    /// A tensor input with symbolic dimensions. Assumed contiguous.
    pub fn sym_tensor_input(
        &mut self,
        name: &str,
        dims: &[SymDim],
        dtype: ScalarType,
        device: Device,
    ) -> ValueId {
        let id = self.push_value(ValueInfo {
            name: name.to_string(),
            vtype: ValueType::Tensor,
            sym_sizes: Some(dims.to_vec()),
            strides: None,
            dtype: Some(dtype),
            device: Some(device),
            node: None,
            offset: 0,
        });
        self.inputs.push(id);
        id
    }

    /// A scalar input.
    pub fn scalar_input(&mut self, name: &str, vtype: ValueType) -> ValueId {
        let id = self.push_value(ValueInfo::scalar(name, vtype));
        self.inputs.push(id);
        id
    }

    /// A `prim::Constant` node; the value's metadata is derived from the
    /// payload.
    pub fn constant(&mut self, name: &str, payload: ConstPayload) -> ValueId {
        let vtype = match &payload {
            ConstPayload::Int(_) => ValueType::Int,
            ConstPayload::Double(_) => ValueType::Float,
            ConstPayload::Bool(_) => ValueType::Bool,
            ConstPayload::None => ValueType::None,
            ConstPayload::IntList(_) => ValueType::IntList,
            ConstPayload::DoubleList(_) => ValueType::DoubleList,
            ConstPayload::Tensor(_) | ConstPayload::Capsule(_) => ValueType::Tensor,
        };
        let mut info = ValueInfo::scalar(name, vtype);
        if let ConstPayload::Tensor(t) = &payload {
            info.sym_sizes = Some(shape::static_dims(t.sizes()));
            info.strides = Some(t.strides().to_vec());
            info.dtype = Some(t.dtype());
            info.device = Some(t.device());
        }
        let node_id = NodeId(self.nodes.len());
        info.node = Some(node_id);
        let id = ValueId(self.values.len());
        self.values.push(info);
        self.nodes.push(Node {
            kind: Symbol::new(kinds::CONSTANT),
            schema: None,
            inputs: vec![],
            outputs: vec![id],
            attrs: FxHashMap::default(),
            payload: Some(payload),
        });
        id
    }

    /// A `prim::ListConstruct` node over existing values.
    pub fn list_construct(&mut self, name: &str, elements: &[ValueId], vtype: ValueType) -> ValueId {
        let node_id = NodeId(self.nodes.len());
        let mut info = ValueInfo::scalar(name, vtype);
        info.node = Some(node_id);
        let id = ValueId(self.values.len());
        self.values.push(info);
        self.nodes.push(Node {
            kind: Symbol::new(kinds::LIST_CONSTRUCT),
            schema: None,
            inputs: elements.to_vec(),
            outputs: vec![id],
            attrs: FxHashMap::default(),
            payload: None,
        });
        id
    }

    /// A single-output operator node producing a tensor.
    pub fn add_op(
        &mut self,
        kind: &str,
        schema: Option<&str>,
        inputs: &[ValueId],
        out_name: &str,
        out_sizes: &[SymDim],
        out_dtype: ScalarType,
        device: Device,
    ) -> ValueId {
        let node_id = NodeId(self.nodes.len());
        let id = self.push_value(ValueInfo {
            name: out_name.to_string(),
            vtype: ValueType::Tensor,
            sym_sizes: Some(out_sizes.to_vec()),
            strides: None,
            dtype: Some(out_dtype),
            device: Some(device),
            node: Some(node_id),
            offset: 0,
        });
        self.nodes.push(Node {
            kind: Symbol::new(kind),
            schema: schema.map(|s| s.to_string()),
            inputs: inputs.to_vec(),
            outputs: vec![id],
            attrs: FxHashMap::default(),
            payload: None,
        });
        id
    }

    /// A multi-output operator node; each entry of `outs` is
    /// `(name, sizes, dtype)` and output offsets follow the entry order.
    pub fn add_node_multi(
        &mut self,
        kind: &str,
        schema: Option<&str>,
        inputs: &[ValueId],
        outs: &[(&str, &[SymDim], ScalarType)],
        device: Device,
    ) -> Vec<ValueId> {
        let node_id = NodeId(self.nodes.len());
        let mut ids = Vec::with_capacity(outs.len());
        for (offset, (name, sizes, dtype)) in outs.iter().enumerate() {
            let id = self.push_value(ValueInfo {
                name: name.to_string(),
                vtype: ValueType::Tensor,
                sym_sizes: Some(sizes.to_vec()),
                strides: None,
                dtype: Some(*dtype),
                device: Some(device),
                node: Some(node_id),
                offset,
            });
            ids.push(id);
        }
        self.nodes.push(Node {
            kind: Symbol::new(kind),
            schema: schema.map(|s| s.to_string()),
            inputs: inputs.to_vec(),
            outputs: ids.clone(),
            attrs: FxHashMap::default(),
            payload: None,
        });
        ids
    }

    /// Attach integer attributes to the most recently added node.
    pub fn set_attr(&mut self, key: &str, value: i64) {
        if let Some(node) = self.nodes.last_mut() {
            node.attrs.insert(key.to_string(), value);
        }
    }

    /// Record the profiled strides of a produced value.
    pub fn set_strides(&mut self, id: ValueId, strides: &[i64]) {
        self.values[id.0].strides = Some(strides.to_vec());
    }

    /// Mark a value as a graph output.
    pub fn mark_output(&mut self, id: ValueId) {
        self.outputs.push(id);
    }

    /// The single device every tensor in the graph agrees on.
    pub fn pick_device(&self) -> Result<Device> {
        let mut device: Option<Device> = None;
        for info in &self.values {
            if info.vtype != ValueType::Tensor {
                continue;
            }
            if let Some(d) = info.device {
                match device {
                    Some(existing) if existing != d => {
                        return Err(Error::DeviceMismatch(existing, d));
                    }
                    _ => device = Some(d),
                }
            }
        }
        device.ok_or_else(|| {
            Error::MalformedInput("could not find a device in the fusion graph".to_string())
        })
    }
}
