//! The per-kernel compilation context and the compile orchestration.

use std::any::Any;
use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::backend::{create_codegen, infer_backend, BufferArg, CodeGen};
use crate::config::Config;
use crate::dtype::{Device, ScalarType};
use crate::error::{Error, Result};
use crate::graph::shape::dense_and_non_overlapping;
use crate::graph::{kinds, Graph, NodeId, ValueId, ValueType};
use crate::ir::{sanitize_name, Buf, Stmt, Var};
use crate::lowering::CustomLoweringTable;
use crate::runtime::{contiguous_strides, RawBuffer, TensorData};

use super::shape_env::ShapeEnv;

/// Backing storage for one kernel-owned constant.
pub(crate) enum ConstStorage {
    /// A retained tensor (possibly a contiguous clone of the original).
    Tensor(TensorData),
    /// Raw memory pre-allocated for a static intermediate.
    Raw(RawBuffer),
    /// An opaque custom-class payload passed through as a pointer.
    Capsule(Arc<dyn Any + Send + Sync>),
}

pub(crate) struct ConstantEntry {
    pub buf: Buf,
    pub storage: ConstStorage,
    #[allow(dead_code)]
    pub node: Option<NodeId>,
}

impl ConstantEntry {
    pub fn ptr(&self) -> *mut u8 {
        match &self.storage {
            ConstStorage::Tensor(t) => t.data_ptr(),
            ConstStorage::Raw(raw) => raw.ptr(),
            ConstStorage::Capsule(c) => Arc::as_ptr(c) as *const () as *mut u8,
        }
    }
}

/// How one output's sizes are produced at call time.
#[derive(Debug, Clone)]
pub(crate) enum SymSize {
    Static(i64),
    /// Read the integer graph input at this position.
    FromInput(usize),
}

pub(crate) struct OutputDesc {
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
    pub dtype: ScalarType,
    pub device: Device,
    /// Present for symbolic-shape outputs; resolved per call.
    pub symbolic_sizes: Option<Vec<SymSize>>,
}

/// Everything `run` needs; read-only after compilation.
pub(crate) struct CompiledKernel {
    pub stmt: Arc<Stmt>,
    pub buffer_args: Vec<BufferArg>,
    pub constants: Vec<ConstantEntry>,
    pub codegen: Box<dyn CodeGen>,
    pub output_descs: Vec<OutputDesc>,
}

/// Compile-time state: the value maps, argument list, constants, and flags
/// accumulated while walking the graph.
pub(crate) struct KernelCompiler<'a> {
    pub graph: &'a Graph,
    pub config: Config,
    pub device: Device,
    pub custom_lowerings: CustomLoweringTable,
    pub symbolic_shape_inputs: Vec<i64>,
    pub pre_alloc: bool,
    pub kernel_name: String,

    pub shape_env: ShapeEnv,
    pub bufs: FxHashMap<ValueId, Buf>,
    pub scalars: FxHashMap<ValueId, Var>,
    pub input_name_map: FxHashMap<ValueId, String>,
    pub buffer_args: Vec<BufferArg>,
    pub constants: Vec<ConstantEntry>,
    pub shape_symbol_input_pos: FxHashMap<Var, usize>,
    pub has_symbolic_shapes: bool,
    pub has_random: bool,
    pub has_broadcast: bool,
}

impl<'a> KernelCompiler<'a> {
    pub fn new(
        graph: &'a Graph,
        kernel_name: &str,
        config: Config,
        custom_lowerings: CustomLoweringTable,
        symbolic_shape_inputs: Vec<i64>,
        pre_alloc: bool,
    ) -> KernelCompiler<'a> {
        KernelCompiler {
            graph,
            config,
            device: Device::Cpu,
            custom_lowerings,
            symbolic_shape_inputs,
            pre_alloc,
            kernel_name: kernel_name.to_string(),
            shape_env: ShapeEnv::default(),
            bufs: FxHashMap::default(),
            scalars: FxHashMap::default(),
            input_name_map: FxHashMap::default(),
            buffer_args: Vec::new(),
            constants: Vec::new(),
            shape_symbol_input_pos: FxHashMap::default(),
            has_symbolic_shapes: false,
            has_random: false,
            has_broadcast: false,
        }
    }

    /// Input display names, sanitized and uniquified. Used in buffer and
    /// variable names so generated code stays readable.
    fn gen_input_debug_names(&mut self) {
        let mut taken: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
        for &input in self.graph.inputs() {
            let mut name = sanitize_name(&self.graph.value(input).name);
            while taken.contains(&name) {
                name.push('_');
            }
            taken.insert(name.clone());
            self.input_name_map.insert(input, name);
        }
    }

    pub fn compile(mut self) -> Result<CompiledKernel> {
        self.device = self.graph.pick_device()?;
        self.has_symbolic_shapes = !self.symbolic_shape_inputs.is_empty();
        self.gen_input_debug_names();

        // Bind inputs, then walk nodes in topological order lowering every
        // used output.
        let mut block = self.bind_all_inputs()?;
        for node_index in 0..self.graph.nodes().len() {
            let node = &self.graph.nodes()[node_index];
            match node.kind.as_str() {
                kinds::LIST_CONSTRUCT => continue,
                kinds::CONSTANT => {
                    self.bind_constant(node)?;
                    continue;
                }
                _ => {
                    for &output in node.outputs.clone().iter() {
                        if !self.graph.has_uses(output) {
                            continue;
                        }
                        let tensor = self.compute_value(output)?;
                        self.bufs.insert(output, tensor.buf.clone());
                        if let Some(stmt) = tensor.stmt {
                            block.push(stmt);
                        }
                    }
                }
            }
            if self.has_random && self.has_broadcast {
                return Err(Error::RandomWithBroadcast);
            }
        }

        // Re-stride outputs and collect their call-time descriptors.
        let mut output_bufs = Vec::new();
        let mut output_descs = Vec::new();
        for (index, &output) in self.graph.outputs().iter().enumerate() {
            if !self.bufs.contains_key(&output) {
                return Err(Error::MalformedInput(
                    "cannot find output Tensor".to_string(),
                ));
            }
            if self.has_symbolic_shapes {
                output_descs.push(self.symbolic_output_desc(output)?);
            } else {
                let shaped = self.convert_output_to_correct_strides(output, index)?;
                if let Some(stmt) = shaped.stmt {
                    block.push(stmt);
                }
                self.bufs.insert(output, shaped.buf);
                output_descs.push(self.concrete_output_desc(output)?);
            }
            let buf = self.bufs.remove(&output).ok_or_else(|| {
                Error::Internal("output buffer vanished during shaping".to_string())
            })?;
            self.buffer_args.push(BufferArg::Buf(buf.clone()));
            output_bufs.push(buf);
        }

        let backend = infer_backend(self.device, &self.config)?;
        let stmt = self.transform_loops(backend, Stmt::Block(block), &output_bufs)?;
        debug!("final stmt for '{}':\n{}", self.kernel_name, stmt);

        for constant in &self.constants {
            self.buffer_args.push(BufferArg::Buf(constant.buf.clone()));
        }

        let stmt = Arc::new(stmt);
        let codegen = create_codegen(
            backend.codegen_name(),
            Arc::clone(&stmt),
            self.buffer_args.clone(),
            self.device,
            &self.kernel_name,
        )?;

        Ok(CompiledKernel {
            stmt,
            buffer_args: self.buffer_args,
            constants: self.constants,
            codegen,
            output_descs,
        })
    }

    fn concrete_output_desc(&mut self, output: ValueId) -> Result<OutputDesc> {
        let info = self.graph.value(output);
        let sizes = info.concrete_sizes().ok_or_else(|| {
            Error::MalformedInput(format!("shapes for output '{}' are unknown", info.name))
        })?;
        let dtype = info.dtype.ok_or_else(|| {
            Error::MalformedInput(format!("output '{}' has no dtype", info.name))
        })?;
        // Strides that are not dense and non-overlapping cannot be matched
        // from profile data; such outputs are produced contiguous.
        let strides = match &info.strides {
            Some(strides) if dense_and_non_overlapping(&sizes, strides) => strides.clone(),
            _ => contiguous_strides(&sizes),
        };
        Ok(OutputDesc {
            sizes,
            strides,
            dtype,
            device: self.device,
            symbolic_sizes: None,
        })
    }

    fn symbolic_output_desc(&mut self, output: ValueId) -> Result<OutputDesc> {
        let info = self.graph.value(output);
        let dims = info.sym_sizes.clone().ok_or_else(|| {
            Error::MalformedInput(format!("output '{}' has no ranked shape", info.name))
        })?;
        let dtype = info.dtype.ok_or_else(|| {
            Error::MalformedInput(format!("output '{}' has no dtype", info.name))
        })?;
        let mut symbolic = Vec::with_capacity(dims.len());
        for dim in dims {
            match dim {
                crate::graph::shape::SymDim::Static(size) => {
                    symbolic.push(SymSize::Static(size));
                }
                crate::graph::shape::SymDim::Sym(id) => {
                    let var = self.shape_env.var_for_id(id).ok_or_else(|| {
                        Error::Internal(format!("no length variable for symbol {id}"))
                    })?;
                    let pos = self.shape_symbol_input_pos.get(var).ok_or_else(|| {
                        Error::Internal(format!(
                            "length variable '{}' has no input position",
                            var.name()
                        ))
                    })?;
                    symbolic.push(SymSize::FromInput(*pos));
                }
            }
        }
        Ok(OutputDesc {
            sizes: vec![],
            strides: vec![],
            dtype,
            device: self.device,
            symbolic_sizes: Some(symbolic),
        })
    }

    /// `value`'s type is Tensor and the argument is positioned where the
    /// lowering accepts a scalar: unpack a 0-dim constant tensor into an
    /// immediate. Float and Long payloads are recognized.
    pub(crate) fn const_zero_dim_tensor_as_scalar_arg(
        &self,
        value: ValueId,
        args: &mut Vec<crate::lowering::ArgValue>,
    ) -> Result<bool> {
        let Some(node) = self.graph.defining_node(value) else {
            return Ok(false);
        };
        if node.kind.as_str() != kinds::CONSTANT {
            return Ok(false);
        }
        let Some(crate::graph::ConstPayload::Tensor(t)) = &node.payload else {
            return Ok(false);
        };
        if !t.sizes().is_empty() {
            return Ok(false);
        }
        match t.dtype() {
            ScalarType::Float => {
                args.push(crate::lowering::ArgValue::Double(t.at::<f32>(&[]) as f64));
                Ok(true)
            }
            ScalarType::Long => {
                args.push(crate::lowering::ArgValue::Int(t.at::<i64>(&[])));
                Ok(true)
            }
            dtype => Err(Error::UnsupportedDtype(format!(
                "unsupported tensor dtype: {dtype} for converting constant 0-dim Tensor to scalar"
            ))),
        }
    }

    /// Name of the value as used in generated identifiers.
    pub(crate) fn value_ident(&self, value: ValueId) -> String {
        self.input_name_map
            .get(&value)
            .cloned()
            .unwrap_or_else(|| sanitize_name(&self.graph.value(value).name))
    }

    pub(crate) fn value_type(&self, value: ValueId) -> ValueType {
        self.graph.value(value).vtype
    }
}
