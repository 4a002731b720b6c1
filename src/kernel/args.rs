//! Call-time argument packing: inputs, freshly allocated outputs, then
//! constant pointers.

use crate::error::{Error, Result};
use crate::runtime::{contiguous_strides, CallArg, RtValue, TensorData};

use super::compiler::{CompiledKernel, SymSize};

impl CompiledKernel {
    /// Builds the call vector for one invocation: inputs in graph order
    /// (scalars as immediates, tensors as data pointers), then a pointer per
    /// output after allocating it with resolved sizes and strides, then the
    /// constant pointers in registration order. Returns the arguments and
    /// the allocated outputs.
    pub(crate) fn prepare_run_args(
        &self,
        inputs: &[RtValue],
    ) -> Result<(Vec<CallArg>, Vec<TensorData>)> {
        let mut run_args =
            Vec::with_capacity(inputs.len() + self.output_descs.len() + self.constants.len());
        for input in inputs {
            match input {
                RtValue::Int(v) => run_args.push(CallArg::Int(*v)),
                RtValue::Double(v) => run_args.push(CallArg::Double(*v)),
                RtValue::Bool(v) => run_args.push(CallArg::Int(*v as i64)),
                RtValue::Tensor(t) => run_args.push(CallArg::Ptr(t.data_ptr())),
            }
        }

        let mut outputs = Vec::with_capacity(self.output_descs.len());
        for desc in &self.output_descs {
            let (sizes, strides) = match &desc.symbolic_sizes {
                // Symbolic sizes resolve by reading the integer inputs at
                // their recorded positions; strides are then contiguous.
                Some(symbolic) => {
                    let mut sizes = Vec::with_capacity(symbolic.len());
                    for dim in symbolic {
                        match dim {
                            SymSize::Static(size) => sizes.push(*size),
                            SymSize::FromInput(pos) => {
                                let value = inputs.get(*pos).ok_or_else(|| {
                                    Error::MalformedInput(format!(
                                        "missing symbolic dim input at position {pos}"
                                    ))
                                })?;
                                let size = value.as_int().ok_or_else(|| {
                                    Error::MalformedInput(format!(
                                        "symbolic dim input at position {pos} is not an integer"
                                    ))
                                })?;
                                sizes.push(size);
                            }
                        }
                    }
                    let strides = contiguous_strides(&sizes);
                    (sizes, strides)
                }
                None => (desc.sizes.clone(), desc.strides.clone()),
            };
            let tensor =
                self.codegen
                    .empty_strided(&sizes, &strides, desc.dtype, desc.device)?;
            run_args.push(CallArg::Ptr(tensor.data_ptr()));
            outputs.push(tensor);
        }

        for constant in &self.constants {
            run_args.push(CallArg::Ptr(constant.ptr()));
        }
        Ok((run_args, outputs))
    }
}
