//! Per-node lowering: argument conversion and dispatch into the lowering
//! tables.

use log::trace;

use crate::dtype::ScalarType;
use crate::error::{Error, Result};
use crate::graph::{kinds, ConstPayload, ValueId, ValueType};
use crate::ir::{Buf, Expr, Imm};
use crate::lowering::{
    is_broadcast, standard_lowering_for, ArgValue, Tensor,
};
use crate::runtime::TensorData;

use super::compiler::{ConstStorage, ConstantEntry, KernelCompiler};

impl<'a> KernelCompiler<'a> {
    /// The immediate for a scalar constant or bound scalar variable.
    pub(crate) fn constant_expr(&self, value: ValueId) -> Result<Expr> {
        if let Some(node) = self.graph.defining_node(value) {
            if node.kind.as_str() == kinds::CONSTANT {
                let payload = node.payload.as_ref().ok_or_else(|| {
                    Error::MalformedInput("constant node without a payload".to_string())
                })?;
                return match payload {
                    ConstPayload::Double(v) => Ok(Expr::Imm(Imm::Double(*v))),
                    ConstPayload::Int(v) => Ok(Expr::long(*v)),
                    ConstPayload::Bool(v) => Ok(Expr::Imm(Imm::Bool(*v))),
                    // A placeholder; None handling is operator-specific and
                    // belongs to the lowering that accepts it.
                    ConstPayload::None => Ok(Expr::long(0)),
                    other => Err(Error::UnsupportedDtype(format!(
                        "constant {other:?} has no immediate form"
                    ))),
                };
            }
        }
        match self.scalars.get(&value) {
            Some(var) => Ok(Expr::Var(var.clone())),
            None => Err(Error::MalformedInput("no scalar in Constant".to_string())),
        }
    }

    /// Converts a graph value into a lowering argument.
    pub(crate) fn to_arg(&self, value: ValueId) -> Result<ArgValue> {
        if let Some(buf) = self.bufs.get(&value) {
            return Ok(ArgValue::Buf(buf.clone()));
        }
        if let Some(node) = self.graph.defining_node(value) {
            match node.kind.as_str() {
                kinds::LIST_CONSTRUCT => {
                    let elements: Vec<ArgValue> = node
                        .inputs
                        .iter()
                        .map(|&e| self.to_arg(e))
                        .collect::<Result<_>>()?;
                    // The element tag is taken from the first entry; an
                    // empty list is an arbitrarily typed buffer list.
                    return match elements.first() {
                        None => Ok(ArgValue::BufList(vec![])),
                        Some(ArgValue::Buf(_)) => {
                            let bufs: Option<Vec<Buf>> = elements
                                .iter()
                                .map(|e| e.as_buf().cloned())
                                .collect();
                            bufs.map(ArgValue::BufList).ok_or_else(|| {
                                Error::UnsupportedDtype(
                                    "mixed-type buffer list".to_string(),
                                )
                            })
                        }
                        Some(ArgValue::Int(_)) => {
                            let ints: Option<Vec<i64>> =
                                elements.iter().map(|e| e.as_int()).collect();
                            ints.map(ArgValue::IntList).ok_or_else(|| {
                                Error::UnsupportedDtype("mixed-type int list".to_string())
                            })
                        }
                        Some(other) => Err(Error::UnsupportedDtype(format!(
                            "unsupported list element {other:?}"
                        ))),
                    };
                }
                kinds::CONSTANT => {
                    let payload = node.payload.as_ref().ok_or_else(|| {
                        Error::MalformedInput("constant node without a payload".to_string())
                    })?;
                    return match payload {
                        ConstPayload::Double(v) => Ok(ArgValue::Double(*v)),
                        ConstPayload::Int(v) => Ok(ArgValue::Int(*v)),
                        ConstPayload::Bool(v) => Ok(ArgValue::Bool(*v)),
                        ConstPayload::None => Ok(ArgValue::None),
                        ConstPayload::IntList(v) => Ok(ArgValue::IntList(v.clone())),
                        ConstPayload::DoubleList(v) => Ok(ArgValue::DoubleList(v.clone())),
                        other => Err(Error::UnsupportedDtype(format!(
                            "constant {other:?} cannot become an argument"
                        ))),
                    };
                }
                _ => {}
            }
        }
        match self.scalars.get(&value) {
            Some(var) => Ok(ArgValue::Var(var.clone())),
            None => Err(Error::MalformedInput("no scalar in Constant".to_string())),
        }
    }

    /// Dimension expressions for a value.
    pub(crate) fn sizes_for_value(&mut self, value: ValueId) -> Result<Vec<Expr>> {
        let info = self.graph.value(value).clone();
        match info.vtype {
            ValueType::Tensor => self.shape_env.sizes_from_symbolic_shape(&info),
            ValueType::Float | ValueType::Int => Ok(vec![Expr::long(1)]),
            ValueType::None => Ok(vec![]),
            other => Err(Error::MalformedInput(format!(
                "unhandled value type {other:?} (in sizes_for_value) for '{}'",
                info.name
            ))),
        }
    }

    /// Lowers one produced value: builds the argument vector (with the
    /// per-op special treatments), then dispatches custom table first,
    /// standard table second.
    pub(crate) fn compute_value(&mut self, value: ValueId) -> Result<Tensor> {
        let node = self
            .graph
            .defining_node(value)
            .ok_or_else(|| {
                Error::MalformedInput("cannot lower a value without a node".to_string())
            })?
            .clone();
        let kind = node.kind.clone();
        trace!("lowering node {} for '{}'", kind, self.graph.value(value).name);

        if kind.as_str() == kinds::RAND_LIKE {
            self.has_random = true;
        }

        let output_dtype = self.graph.value(value).dtype;
        let output_shape = self.sizes_for_value(value)?;

        let mut args: Vec<ArgValue> = Vec::with_capacity(node.inputs.len());
        match kind.as_str() {
            kinds::CONSTANT_CHUNK | kinds::TO | kinds::QUANTIZE_PER_TENSOR
                if node.inputs.is_empty() =>
            {
                return Err(Error::MalformedInput(format!("{kind} node has no inputs")));
            }
            kinds::CONSTANT_CHUNK => {
                args.push(self.to_arg(node.inputs[0])?);
                args.push(ArgValue::Int(self.graph.value(value).offset as i64));
                args.push(ArgValue::Int(node.attrs.get("dim").copied().unwrap_or(0)));
                args.push(ArgValue::Int(node.attrs.get("chunks").copied().unwrap_or(1)));
            }
            kinds::TO => {
                // Only the source tensor is forwarded; dtype and device
                // metadata are handled inside the lowering.
                args.push(self.to_arg(node.inputs[0])?);
            }
            kinds::QUANTIZE_PER_TENSOR => {
                if node.inputs.len() < 4 {
                    return Err(Error::MalformedInput(
                        "quantize_per_tensor expects (tensor, scale, zero_point, dtype)"
                            .to_string(),
                    ));
                }
                args.push(self.to_arg(node.inputs[0])?);
                for &input in &node.inputs[1..3] {
                    if !self.const_zero_dim_tensor_as_scalar_arg(input, &mut args)? {
                        args.push(self.to_arg(input)?);
                    }
                }
                args.push(self.to_arg(node.inputs[3])?);
            }
            kinds::CONV2D => {
                for &input in &node.inputs {
                    args.push(self.to_arg(input)?);
                }
                if args.len() > 2 && args[2].is_none() {
                    args[2] = self.synthesize_conv_bias(value, &output_shape, output_dtype)?;
                }
            }
            _ => {
                for &input in &node.inputs {
                    args.push(self.to_arg(input)?);
                }
                for arg in &args {
                    if let ArgValue::Buf(buf) = arg {
                        if is_broadcast(buf, &output_shape) {
                            self.has_broadcast = true;
                        }
                    }
                }
            }
        }

        if let Some(lowering) = self.custom_lowerings.get(&kind).cloned() {
            return lowering(&args, &output_shape, output_dtype, self.device);
        }
        if let Some(schema) = &node.schema {
            if let Some(lowering) = standard_lowering_for(schema) {
                return lowering(&args, &output_shape, output_dtype, self.device);
            }
        }
        let mut message = format!("unhandled node kind (in compute_value): {kind}");
        if let Some(schema) = &node.schema {
            message.push_str(&format!("\nschema: {schema}"));
        }
        Err(Error::MalformedInput(message))
    }

    /// A `None` conv2d bias becomes a kernel-owned zero tensor of shape
    /// `[out_channels]`.
    fn synthesize_conv_bias(
        &mut self,
        value: ValueId,
        output_shape: &[Expr],
        output_dtype: Option<ScalarType>,
    ) -> Result<ArgValue> {
        let out_channels = output_shape
            .get(1)
            .and_then(|d| d.as_long())
            .ok_or_else(|| {
                Error::MalformedInput(
                    "conv2d output channels must be static to synthesize a bias".to_string(),
                )
            })?;
        let dtype = output_dtype.unwrap_or(ScalarType::Float);
        let bias = TensorData::zeros(&[out_channels], dtype);
        let buf = Buf::new(
            format!(
                "conv2d_bias_opt_{}",
                crate::ir::sanitize_name(&self.graph.value(value).name)
            ),
            vec![Expr::long(out_channels)],
            dtype,
        );
        self.constants.push(ConstantEntry {
            buf: buf.clone(),
            storage: ConstStorage::Tensor(bias),
            node: None,
        });
        Ok(ArgValue::Buf(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dtype::Device;
    use crate::graph::shape::static_dims;
    use crate::graph::Graph;

    fn compiler_for(graph: &Graph) -> KernelCompiler<'_> {
        KernelCompiler::new(
            graph,
            "test_kernel",
            Config::default(),
            Default::default(),
            vec![],
            false,
        )
    }

    #[test]
    fn test_to_arg_int_list_construct() {
        let mut g = Graph::new();
        let a = g.constant("a", ConstPayload::Int(1));
        let b = g.constant("b", ConstPayload::Int(2));
        let list = g.list_construct("l", &[a, b], ValueType::IntList);
        let c = compiler_for(&g);
        let arg = c.to_arg(list).unwrap();
        assert!(matches!(arg, ArgValue::IntList(ref v) if v == &vec![1, 2]));
    }

    #[test]
    fn test_to_arg_empty_list_is_buf_list() {
        let mut g = Graph::new();
        let list = g.list_construct("l", &[], ValueType::IntList);
        let c = compiler_for(&g);
        let arg = c.to_arg(list).unwrap();
        assert!(matches!(arg, ArgValue::BufList(ref v) if v.is_empty()));
    }

    #[test]
    fn test_zero_dim_constant_unpacks_to_scalar() {
        let mut g = Graph::new();
        let scale = g.constant(
            "scale",
            ConstPayload::Tensor(TensorData::from_vec(vec![0.5f32], &[])),
        );
        let c = compiler_for(&g);
        let mut args = Vec::new();
        assert!(c
            .const_zero_dim_tensor_as_scalar_arg(scale, &mut args)
            .unwrap());
        assert!(matches!(args[0], ArgValue::Double(v) if v == 0.5));
    }

    #[test]
    fn test_zero_dim_constant_rejects_other_dtypes() {
        let mut g = Graph::new();
        let flag = g.constant(
            "flag",
            ConstPayload::Tensor(TensorData::from_vec(vec![1i32], &[])),
        );
        let c = compiler_for(&g);
        let mut args = Vec::new();
        assert!(matches!(
            c.const_zero_dim_tensor_as_scalar_arg(flag, &mut args),
            Err(Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_unknown_kind_reports_schema() {
        let mut g = Graph::new();
        let x = g.tensor_input("x", &[4], ScalarType::Float, Device::Cpu);
        let y = g.add_op(
            "aten::made_up",
            Some("aten::made_up.schema"),
            &[x],
            "y",
            &static_dims(&[4]),
            ScalarType::Float,
            Device::Cpu,
        );
        g.mark_output(y);
        let mut c = compiler_for(&g);
        c.bind_all_inputs().unwrap();
        let err = c.compute_value(y).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("aten::made_up"));
        assert!(text.contains("schema"));
    }
}
