//! Output re-striding: lay produced values so that reading them through the
//! profiled strides yields the logical order.

use crate::error::{Error, Result};
use crate::graph::shape::dense_and_non_overlapping;
use crate::graph::ValueId;
use crate::ir::Expr;
use crate::lowering::{compute, Tensor};
use crate::runtime::contiguous_strides;

use super::compiler::KernelCompiler;

impl<'a> KernelCompiler<'a> {
    /// Every buffer is produced contiguous. When the profiled output strides
    /// are a dense non-overlapping permutation, a gather compute re-lays the
    /// values; otherwise the contiguous buffer is returned as-is (identical
    /// strides need no work, and non-dense stridings cannot be matched from
    /// profile data).
    pub(crate) fn convert_output_to_correct_strides(
        &mut self,
        output: ValueId,
        index: usize,
    ) -> Result<Tensor> {
        let info = self.graph.value(output).clone();
        let buf = self
            .bufs
            .get(&output)
            .ok_or_else(|| {
                Error::MalformedInput("output tensor has no corresponding buffer".to_string())
            })?
            .clone();
        let sizes = info.concrete_sizes().ok_or_else(|| {
            Error::MalformedInput(format!("shapes for output '{}' are unknown", info.name))
        })?;
        let default_strides = contiguous_strides(&sizes);
        let Some(strides) = info.strides.clone() else {
            return Ok(Tensor::buf_only(buf));
        };
        if strides == default_strides {
            return Ok(Tensor::buf_only(buf));
        }
        if !dense_and_non_overlapping(&sizes, &strides) {
            return Ok(Tensor::buf_only(buf));
        }

        // The element written at logical position [i0, ..] must be the one a
        // reader following the target strides finds there. Recover the
        // source indices by peeling the absolute offset with the target
        // strides, largest first; size-1 positions read index 0.
        let dims: Vec<Expr> = sizes.iter().map(|&s| Expr::long(s)).collect();
        let mut order: Vec<usize> = (0..strides.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(strides[i]));

        compute(&format!("output_{index}"), &dims, buf.dtype(), |axes| {
            let mut absolute = Expr::long(0);
            for (axis, &stride) in axes.iter().zip(&default_strides) {
                absolute = absolute + axis.clone() * Expr::long(stride);
            }
            let mut source = vec![Expr::long(0); axes.len()];
            for &position in &order {
                if sizes[position] == 1 {
                    continue;
                }
                let stride = Expr::long(strides[position]);
                source[position] = absolute.clone() / stride.clone();
                absolute = absolute % stride;
            }
            Ok(Expr::load(&buf, source))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dtype::{Device, ScalarType};
    use crate::graph::shape::static_dims;
    use crate::graph::Graph;
    use crate::ir::Buf;

    fn shaped(strides: Option<&[i64]>) -> Tensor {
        let mut g = Graph::new();
        let x = g.tensor_input("x", &[2, 3], ScalarType::Float, Device::Cpu);
        let y = g.add_op(
            "aten::relu",
            Some("aten::relu"),
            &[x],
            "y",
            &static_dims(&[2, 3]),
            ScalarType::Float,
            Device::Cpu,
        );
        if let Some(strides) = strides {
            g.set_strides(y, strides);
        }
        g.mark_output(y);
        let mut c = KernelCompiler::new(
            &g,
            "test_kernel",
            Config::default(),
            Default::default(),
            vec![],
            false,
        );
        let buf = Buf::new(
            "aten_relu",
            vec![Expr::long(2), Expr::long(3)],
            ScalarType::Float,
        );
        c.bufs.insert(y, buf);
        c.convert_output_to_correct_strides(y, 0).unwrap()
    }

    #[test]
    fn test_contiguous_output_is_untouched() {
        let t = shaped(Some(&[3, 1]));
        assert!(t.stmt.is_none());
    }

    #[test]
    fn test_unknown_strides_are_untouched() {
        let t = shaped(None);
        assert!(t.stmt.is_none());
    }

    #[test]
    fn test_overlapping_strides_are_untouched() {
        let t = shaped(Some(&[0, 1]));
        assert!(t.stmt.is_none());
    }

    #[test]
    fn test_permuted_strides_get_regathered() {
        let t = shaped(Some(&[1, 2]));
        let stmt = t.stmt.expect("a re-striding compute");
        let text = stmt.to_string();
        assert!(text.contains("output_0[i0, i1]"), "got:\n{text}");
        // The source index peels with the target strides (2 then 1).
        assert!(text.contains("/ 2"), "got:\n{text}");
        assert!(text.contains("% 2"), "got:\n{text}");
    }
}
