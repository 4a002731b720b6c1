//! Input and constant binding: graph values become buffers and scalar
//! variables before any node is lowered.

use log::trace;

use crate::dtype::ScalarType;
use crate::error::{Error, Result};
use crate::graph::{ConstPayload, Node, ValueId, ValueType};
use crate::ir::{sanitize_name, Buf, Expr, Stmt, Var};
use crate::lowering::compute;

use super::compiler::{ConstStorage, ConstantEntry, KernelCompiler};
use crate::backend::BufferArg;

impl<'a> KernelCompiler<'a> {
    /// Binds every graph input. Symbolic-dim integer inputs occupy the
    /// trailing positions of the input list; they are bound first so that
    /// tensor inputs can reference their length variables, but their
    /// argument slots keep the graph's input order.
    pub(crate) fn bind_all_inputs(&mut self) -> Result<Vec<Stmt>> {
        let inputs = self.graph.inputs().to_vec();
        let n_symbolic = self.symbolic_shape_inputs.len();
        if inputs.len() < n_symbolic {
            return Err(Error::MalformedInput(
                "symbolic dims not provided as inputs to the graph".to_string(),
            ));
        }
        let sym_start = inputs.len() - n_symbolic;

        let mut symbolic_args = Vec::with_capacity(n_symbolic);
        if self.has_symbolic_shapes {
            for (slot, &input) in inputs[sym_start..].iter().enumerate() {
                if self.value_type(input) != ValueType::Int {
                    return Err(Error::MalformedInput(
                        "expected integer type input to graph for symbolic dims".to_string(),
                    ));
                }
                let var = Var::new(format!("v{}", self.value_ident(input)), ScalarType::Long);
                symbolic_args.push(BufferArg::Var(var.clone()));
                self.scalars.insert(input, var.clone());
                self.shape_symbol_input_pos.insert(var, sym_start + slot);
            }
            for (slot, &sym_id) in self.symbolic_shape_inputs.clone().iter().enumerate() {
                let input = inputs[sym_start + slot];
                if let Some(var) = self.scalars.get(&input) {
                    self.shape_env.bind(sym_id, var.clone());
                }
            }
        }

        let mut block = Vec::new();
        for &input in &inputs[..sym_start] {
            self.bind_input(input, &mut block)?;
        }
        self.buffer_args.extend(symbolic_args);
        Ok(block)
    }

    fn bind_input(&mut self, input: ValueId, block: &mut Vec<Stmt>) -> Result<()> {
        let info = self.graph.value(input).clone();
        trace!("binding input '{}'", info.name);
        match info.vtype {
            ValueType::Tensor => {
                let dtype = info.dtype.ok_or_else(|| {
                    Error::UnsupportedDtype(format!("input '{}' has no dtype", info.name))
                })?;
                let name = format!("t{}", self.value_ident(input));

                if !info.is_complete_tensor() {
                    // Symbolic shapes are only supported for contiguous
                    // tensors; the buffer dims are length variables.
                    let dims = self.shape_env.sizes_from_symbolic_shape(&info)?;
                    let buf = Buf::new(name, dims, dtype);
                    self.bufs.insert(input, buf.clone());
                    self.buffer_args.push(BufferArg::Buf(buf));
                    return Ok(());
                }

                let sizes = info.concrete_sizes().ok_or_else(|| {
                    Error::Internal("complete tensor without sizes".to_string())
                })?;
                if info.is_contiguous() {
                    let dims = sizes.iter().map(|&s| Expr::long(s)).collect();
                    let buf = Buf::new(name, dims, dtype);
                    self.bufs.insert(input, buf.clone());
                    self.buffer_args.push(BufferArg::Buf(buf));
                    return Ok(());
                }

                // Non-contiguous input: the physical data binds to a flat
                // staging buffer; a gather compute re-materializes the
                // logical contiguous order that lowering expects.
                let strides = info.strides.clone().ok_or_else(|| {
                    Error::Internal("complete tensor without strides".to_string())
                })?;
                let staging = Buf::new(name, vec![Expr::long(0)], dtype);
                let dims: Vec<Expr> = sizes.iter().map(|&s| Expr::long(s)).collect();
                let gathered = compute(
                    &format!("input{}", self.bufs.len() + 1),
                    &dims,
                    dtype,
                    |axes| {
                        let mut flat = Expr::long(0);
                        for (axis, &stride) in axes.iter().zip(&strides) {
                            flat = flat + axis.clone() * Expr::long(stride);
                        }
                        Ok(Expr::load(
                            &staging,
                            vec![crate::ir::simplify::simplify_expr(flat)],
                        ))
                    },
                )?;
                self.bufs.insert(input, gathered.buf.clone());
                self.buffer_args.push(BufferArg::Buf(staging));
                if let Some(stmt) = gathered.stmt {
                    block.push(stmt);
                }
                Ok(())
            }
            ValueType::Float => {
                self.bind_scalar_input(input, ScalarType::Double);
                Ok(())
            }
            ValueType::Bool => {
                self.bind_scalar_input(input, ScalarType::Bool);
                Ok(())
            }
            ValueType::Int => {
                self.bind_scalar_input(input, ScalarType::Long);
                Ok(())
            }
            other => Err(Error::UnsupportedDtype(format!(
                "unsupported input type {other:?} for '{}'",
                info.name
            ))),
        }
    }

    fn bind_scalar_input(&mut self, input: ValueId, dtype: ScalarType) {
        let var = Var::new(format!("v{}", self.value_ident(input)), dtype);
        self.buffer_args.push(BufferArg::Var(var.clone()));
        self.scalars.insert(input, var);
    }

    /// Lifts a constant node's payload into the kernel. Tensor constants
    /// become named buffers backed by retained storage; scalar constants
    /// stay unbound and materialize as immediates at their use sites.
    pub(crate) fn bind_constant(&mut self, node: &Node) -> Result<()> {
        let value = node.outputs[0];
        let payload = node.payload.as_ref().ok_or_else(|| {
            Error::MalformedInput("constant node without a payload".to_string())
        })?;
        let name = format!(
            "const_{}",
            sanitize_name(&self.graph.value(value).name)
        );
        match payload {
            ConstPayload::Capsule(capsule) => {
                let buf = Buf::new(name, vec![], ScalarType::Float);
                self.constants.push(ConstantEntry {
                    buf: buf.clone(),
                    storage: ConstStorage::Capsule(capsule.clone()),
                    node: self.graph.value(value).node,
                });
                self.bufs.insert(value, buf);
                Ok(())
            }
            ConstPayload::Tensor(tensor) => {
                let tensor = if tensor.is_contiguous() {
                    tensor.clone()
                } else {
                    // The clone is retained so the pointer stays valid for
                    // the kernel's lifetime.
                    tensor.clone_contiguous()
                };
                let dims = tensor.sizes().iter().map(|&s| Expr::long(s)).collect();
                let buf = Buf::new(name, dims, tensor.dtype());
                self.constants.push(ConstantEntry {
                    buf: buf.clone(),
                    storage: ConstStorage::Tensor(tensor),
                    node: None,
                });
                self.bufs.insert(value, buf);
                Ok(())
            }
            // Scalar constants become immediates in the IR.
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dtype::Device;
    use crate::graph::Graph;
    use crate::runtime::TensorData;

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
    fn test_contiguous_input_binds_directly() {
        let mut g = Graph::new();
        let x = g.tensor_input("x", &[2, 3], ScalarType::Float, Device::Cpu);
        let mut c = compiler_for(&g);
        c.device = Device::Cpu;
        let block = c.bind_all_inputs().unwrap();
        assert!(block.is_empty(), "contiguous inputs need no gather");
        assert_eq!(c.bufs[&x].ndim(), 2);
        assert_eq!(c.buffer_args.len(), 1);
    }

    #[test]
    fn test_noncontiguous_input_emits_gather() {
        let mut g = Graph::new();
        let x = g.tensor_input_strided("x", &[2, 3], &[1, 2], ScalarType::Float, Device::Cpu);
        let mut c = compiler_for(&g);
        let block = c.bind_all_inputs().unwrap();
        assert_eq!(block.len(), 1, "expected a gather compute");
        let text = block[0].to_string();
        assert!(text.contains("tx[(i0 + (i1 * 2))]"), "got:\n{text}");
        // The registered buffer is the gathered result, not the staging buf.
        assert_eq!(c.bufs[&x].ndim(), 2);
    }

    #[test]
    fn test_scalar_inputs_become_vars() {
        let mut g = Graph::new();
        g.tensor_input("x", &[4], ScalarType::Float, Device::Cpu);
        let s = g.scalar_input("alpha", ValueType::Float);
        let mut c = compiler_for(&g);
        c.bind_all_inputs().unwrap();
        assert_eq!(c.scalars[&s].dtype(), ScalarType::Double);
    }

    #[test]
    fn test_tensor_constant_cloned_contiguous() {
        let mut g = Graph::new();
        g.tensor_input("x", &[2, 3], ScalarType::Float, Device::Cpu);
        let t = TensorData::from_vec(vec![0f32, 1., 2., 3., 4., 5.], &[2, 3])
            .with_strides(vec![1, 2]);
        let cid = g.constant("w", ConstPayload::Tensor(t));
        let mut c = compiler_for(&g);
        let node = g.defining_node(cid).unwrap().clone();
        c.bind_constant(&node).unwrap();
        assert_eq!(c.constants.len(), 1);
        let ConstStorage::Tensor(stored) = &c.constants[0].storage else {
            panic!("expected retained tensor storage");
        };
        assert!(stored.is_contiguous());
        assert_eq!(c.bufs[&cid].name(), "const_w");
    }

    #[test]
    fn test_scalar_constant_not_bound() {
        let mut g = Graph::new();
        let cid = g.constant("two", ConstPayload::Int(2));
        let mut c = compiler_for(&g);
        let node = g.defining_node(cid).unwrap().clone();
        c.bind_constant(&node).unwrap();
        assert!(c.constants.is_empty());
        assert!(!c.bufs.contains_key(&cid));
    }
}
