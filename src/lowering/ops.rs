//! Built-in standard lowerings.
//!
//! The registry ships with a working elementwise/broadcast operator set plus
//! the structural ops the core gives special argument treatment (`chunk`,
//! `to`, `conv2d`). Anything else arrives through
//! [`register_standard_lowering`](super::register_standard_lowering) or a
//! per-kernel custom table.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::dtype::{Device, ScalarType};
use crate::error::{Error, Result};
use crate::ir::{BinOp, Expr, Imm, Stmt, UnOp, Var};
use crate::lowering::{broadcast_load, compute, ArgValue, LoweringFn, Tensor};

/// Operand as a scalar expression or a broadcast load at `axes`.
fn operand(arg: &ArgValue, axes: &[Expr]) -> Result<Expr> {
    if let Some(buf) = arg.as_buf() {
        return Ok(broadcast_load(buf, axes));
    }
    arg.scalar_expr()
        .ok_or_else(|| Error::MalformedInput(format!("unexpected operand {arg:?}")))
}

fn output_dtype(args: &[ArgValue], out_dtype: Option<ScalarType>) -> ScalarType {
    if let Some(dtype) = out_dtype {
        return dtype;
    }
    let mut dtype: Option<ScalarType> = None;
    for arg in args {
        if let Some(buf) = arg.as_buf() {
            dtype = Some(match dtype {
                Some(d) => d.promote(buf.dtype()),
                None => buf.dtype(),
            });
        }
    }
    dtype.unwrap_or(ScalarType::Float)
}

/// `(h, w)` from an int or a two-element int list.
fn pair_int(arg: &ArgValue) -> Result<(i64, i64)> {
    match arg {
        ArgValue::Int(v) => Ok((*v, *v)),
        ArgValue::IntList(v) if v.len() == 2 => Ok((v[0], v[1])),
        other => Err(Error::MalformedInput(format!(
            "expected int pair, got {other:?}"
        ))),
    }
}

fn binary_lowering(name: &'static str, op: BinOp) -> LoweringFn {
    Arc::new(
        move |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            if args.len() < 2 {
                return Err(Error::MalformedInput(format!("{name}: expected 2 operands")));
            }
            let dtype = output_dtype(args, out_dtype);
            // Third positional argument, when present, is the alpha scaling
            // of the second operand.
            let alpha = args.get(2).and_then(|a| a.scalar_expr());
            compute(&format!("aten_{name}"), out_shape, dtype, |axes| {
                let lhs = operand(&args[0], axes)?;
                let mut rhs = operand(&args[1], axes)?;
                if let Some(alpha) = alpha {
                    if alpha.as_imm().map(|imm| imm.to_double()) != Some(1.0) {
                        rhs = rhs * alpha;
                    }
                }
                Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
            })
        },
    )
}

fn unary_lowering(name: &'static str, op: UnOp) -> LoweringFn {
    Arc::new(
        move |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            let dtype = output_dtype(args, out_dtype);
            compute(&format!("aten_{name}"), out_shape, dtype, |axes| {
                Ok(Expr::unary(op, operand(&args[0], axes)?))
            })
        },
    )
}

fn relu_lowering() -> LoweringFn {
    Arc::new(
        |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            let dtype = output_dtype(args, out_dtype);
            compute("aten_relu", out_shape, dtype, |axes| {
                let zero = Expr::Imm(Imm::from_double(0.0, dtype));
                Ok(operand(&args[0], axes)?.max(zero))
            })
        },
    )
}

/// `aten::to`: a cast-copy. The core forwards only the source tensor; the
/// target dtype is the profiled output dtype.
fn to_lowering() -> LoweringFn {
    Arc::new(
        |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            let dtype = out_dtype.ok_or_else(|| {
                Error::MalformedInput("aten::to with unknown target dtype".to_string())
            })?;
            compute("aten_to", out_shape, dtype, |axes| operand(&args[0], axes))
        },
    )
}

/// `prim::ConstantChunk`: a strided slice. The core appends
/// `(offset, dim, chunks)` from the node.
fn chunk_lowering() -> LoweringFn {
    Arc::new(
        |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            if args.len() < 4 {
                return Err(Error::MalformedInput(
                    "chunk expects (tensor, offset, dim, chunks)".to_string(),
                ));
            }
            let buf = args[0]
                .as_buf()
                .ok_or_else(|| Error::MalformedInput("chunk of a non-tensor".to_string()))?
                .clone();
            let offset = args[1].as_int().unwrap_or(0);
            let dim = args[2].as_int().unwrap_or(0) as usize;
            let chunks = args[3].as_int().unwrap_or(1);
            if dim >= buf.ndim() {
                return Err(Error::MalformedInput(format!(
                    "chunk dim {dim} out of range for {} dims",
                    buf.ndim()
                )));
            }
            let dtype = out_dtype.unwrap_or_else(|| buf.dtype());
            // Chunks are sized by the rounded-up division; the final chunk
            // may be shorter.
            let chunk_len =
                (buf.dims()[dim].clone() + Expr::long(chunks - 1)) / Expr::long(chunks);
            let start = Expr::long(offset) * chunk_len;
            compute("prim_constantchunk", out_shape, dtype, |axes| {
                let mut indices = axes.to_vec();
                indices[dim] = indices[dim].clone() + start;
                Ok(Expr::load(&buf, indices))
            })
        },
    )
}

/// Direct NCHW convolution with static shapes: `groups == 1`, zero padding,
/// unit dilation. The kernel window reduction is unrolled into the store.
fn conv2d_lowering() -> LoweringFn {
    Arc::new(
        |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            if args.len() < 7 {
                return Err(Error::MalformedInput(
                    "conv2d expects (input, weight, bias, stride, padding, dilation, groups)"
                        .to_string(),
                ));
            }
            let input = args[0]
                .as_buf()
                .ok_or_else(|| Error::MalformedInput("conv2d input is not a tensor".into()))?
                .clone();
            let weight = args[1]
                .as_buf()
                .ok_or_else(|| Error::MalformedInput("conv2d weight is not a tensor".into()))?
                .clone();
            let bias = args[2]
                .as_buf()
                .ok_or_else(|| Error::MalformedInput("conv2d bias is not a tensor".into()))?
                .clone();
            let (stride_h, stride_w) = pair_int(&args[3])?;
            let (pad_h, pad_w) = pair_int(&args[4])?;
            let (dil_h, dil_w) = pair_int(&args[5])?;
            let groups = args[6].as_int().unwrap_or(1);
            if (pad_h, pad_w) != (0, 0) || (dil_h, dil_w) != (1, 1) || groups != 1 {
                return Err(Error::MalformedInput(
                    "conv2d: only unpadded, undilated, ungrouped convolutions are supported"
                        .to_string(),
                ));
            }
            let wdims: Vec<i64> = weight
                .dims()
                .iter()
                .map(|d| {
                    d.as_long().ok_or_else(|| {
                        Error::MalformedInput("conv2d weight shape must be static".to_string())
                    })
                })
                .collect::<Result<_>>()?;
            if wdims.len() != 4 || out_shape.len() != 4 {
                return Err(Error::MalformedInput(
                    "conv2d expects 4-d input and weight".to_string(),
                ));
            }
            let (in_ch, k_h, k_w) = (wdims[1], wdims[2], wdims[3]);
            let dtype = output_dtype(args, out_dtype);

            compute("aten_conv2d", out_shape, dtype, |axes| {
                let (n, co, oh, ow) = (&axes[0], &axes[1], &axes[2], &axes[3]);
                let mut acc = Expr::load(&bias, vec![co.clone()]);
                for ci in 0..in_ch {
                    for kh in 0..k_h {
                        for kw in 0..k_w {
                            let x = Expr::load(
                                &input,
                                vec![
                                    n.clone(),
                                    Expr::long(ci),
                                    oh.clone() * Expr::long(stride_h) + Expr::long(kh),
                                    ow.clone() * Expr::long(stride_w) + Expr::long(kw),
                                ],
                            );
                            let w = Expr::load(
                                &weight,
                                vec![co.clone(), Expr::long(ci), Expr::long(kh), Expr::long(kw)],
                            );
                            acc = acc + x * w;
                        }
                    }
                }
                Ok(acc)
            })
        },
    )
}

/// `aten::sum.dim_IntList`: an initialize/accumulate loop pair. The second
/// store reads its own output buffer, so the nest is a reduction and the
/// CPU shaping policies will leave it sequential.
fn sum_lowering() -> LoweringFn {
    Arc::new(
        |args: &[ArgValue], out_shape: &[Expr], out_dtype, _device: Device| {
            if args.len() < 2 {
                return Err(Error::MalformedInput(
                    "sum expects (tensor, dims, keepdim)".to_string(),
                ));
            }
            let input = args[0]
                .as_buf()
                .ok_or_else(|| Error::MalformedInput("sum of a non-tensor".into()))?
                .clone();
            let reduce_dims: Vec<usize> = match &args[1] {
                ArgValue::IntList(dims) => dims.iter().map(|&d| d as usize).collect(),
                ArgValue::Int(d) => vec![*d as usize],
                other => {
                    return Err(Error::MalformedInput(format!(
                        "sum dims must be ints, got {other:?}"
                    )))
                }
            };
            let keepdim = matches!(args.get(2), Some(ArgValue::Bool(true)));
            let dtype = out_dtype.unwrap_or_else(|| input.dtype());
            let buf = crate::ir::Buf::new("aten_sum", out_shape.to_vec(), dtype);

            // Zero-initialize the output.
            let out_axes: Vec<Var> = (0..out_shape.len())
                .map(|i| Var::new(format!("i{i}"), ScalarType::Long))
                .collect();
            let out_exprs: Vec<Expr> = out_axes.iter().cloned().map(Expr::Var).collect();
            let mut init = Stmt::store(
                &buf,
                out_exprs.clone(),
                Expr::Imm(Imm::from_double(0.0, dtype)),
            );
            for (axis, dim) in out_axes.iter().zip(out_shape).rev() {
                init = Stmt::loop_over(axis.clone(), dim.clone(), init);
            }

            // Accumulate over every input axis; reduced axes iterate
            // innermost.
            let in_axes: Vec<Var> = (0..input.ndim())
                .map(|i| Var::new(format!("r{i}"), ScalarType::Long))
                .collect();
            let mut out_index = Vec::new();
            for (axis, var) in in_axes.iter().enumerate() {
                if reduce_dims.contains(&axis) {
                    if keepdim {
                        out_index.push(Expr::long(0));
                    }
                } else {
                    out_index.push(Expr::Var(var.clone()));
                }
            }
            let in_index: Vec<Expr> = in_axes.iter().cloned().map(Expr::Var).collect();
            let mut acc = Stmt::store(
                &buf,
                out_index.clone(),
                Expr::load(&buf, out_index) + Expr::load(&input, in_index).cast(dtype),
            );
            let mut ordered: Vec<usize> = (0..input.ndim()).collect();
            ordered.sort_by_key(|axis| reduce_dims.contains(axis));
            for &axis in ordered.iter().rev() {
                acc = Stmt::loop_over(
                    in_axes[axis].clone(),
                    input.dims()[axis].clone(),
                    acc,
                );
            }

            Ok(Tensor::new(buf, Stmt::Block(vec![init, acc])))
        },
    )
}

/// The lowering table the registry starts with.
pub fn builtin_lowerings() -> FxHashMap<String, LoweringFn> {
    let mut table: FxHashMap<String, LoweringFn> = FxHashMap::default();
    let mut add = |schema: &str, f: LoweringFn| {
        table.insert(schema.to_string(), f);
    };

    for (name, op) in [
        ("add", BinOp::Add),
        ("sub", BinOp::Sub),
        ("mul", BinOp::Mul),
        ("div", BinOp::Div),
    ] {
        add(&format!("aten::{name}.Tensor"), binary_lowering(name, op));
        add(&format!("aten::{name}.Scalar"), binary_lowering(name, op));
    }

    add("aten::relu", relu_lowering());
    for (name, op) in [
        ("tanh", UnOp::Tanh),
        ("sigmoid", UnOp::Sigmoid),
        ("exp", UnOp::Exp),
        ("log", UnOp::Log),
        ("sqrt", UnOp::Sqrt),
        ("neg", UnOp::Neg),
        ("abs", UnOp::Abs),
    ] {
        add(&format!("aten::{name}"), unary_lowering(name, op));
    }

    add("aten::to.dtype", to_lowering());
    add("prim::ConstantChunk", chunk_lowering());
    add("aten::conv2d", conv2d_lowering());
    add("aten::sum.dim_IntList", sum_lowering());

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Buf;

    #[test]
    fn test_binary_broadcast_shapes() {
        let lhs = Buf::new("x", vec![Expr::long(8), Expr::long(1)], ScalarType::Float);
        let rhs = Buf::new("y", vec![Expr::long(1), Expr::long(16)], ScalarType::Float);
        let lowering = binary_lowering("mul", BinOp::Mul);
        let out_shape = [Expr::long(8), Expr::long(16)];
        let t = lowering(
            &[ArgValue::Buf(lhs), ArgValue::Buf(rhs)],
            &out_shape,
            Some(ScalarType::Float),
            Device::Cpu,
        )
        .unwrap();
        let text = t.stmt.unwrap().to_string();
        assert!(text.contains("aten_mul[i0, i1] = (x[i0, 0] * y[0, i1]);"));
    }

    #[test]
    fn test_add_scalar_operand() {
        let lhs = Buf::new("x", vec![Expr::long(4)], ScalarType::Float);
        let lowering = binary_lowering("add", BinOp::Add);
        let t = lowering(
            &[ArgValue::Buf(lhs), ArgValue::Int(1)],
            &[Expr::long(4)],
            Some(ScalarType::Float),
            Device::Cpu,
        )
        .unwrap();
        let text = t.stmt.unwrap().to_string();
        assert!(text.contains("(x[i0] + 1)"));
    }

    #[test]
    fn test_sum_is_init_plus_accumulate() {
        let input = Buf::new("x", vec![Expr::long(4), Expr::long(5)], ScalarType::Float);
        let lowering = sum_lowering();
        let t = lowering(
            &[
                ArgValue::Buf(input),
                ArgValue::IntList(vec![1]),
                ArgValue::Bool(false),
            ],
            &[Expr::long(4)],
            Some(ScalarType::Float),
            Device::Cpu,
        )
        .unwrap();
        let stmt = t.stmt.unwrap();
        let text = stmt.to_string();
        assert!(text.contains("aten_sum[i0] = 0f;"));
        assert!(text.contains("aten_sum[r0] = (aten_sum[r0] + x[r0, r1]);"));
    }

    #[test]
    fn test_conv2d_rejects_padding() {
        let input = Buf::new(
            "x",
            vec![Expr::long(1), Expr::long(2), Expr::long(8), Expr::long(8)],
            ScalarType::Float,
        );
        let weight = Buf::new(
            "w",
            vec![Expr::long(4), Expr::long(2), Expr::long(3), Expr::long(3)],
            ScalarType::Float,
        );
        let bias = Buf::new("b", vec![Expr::long(4)], ScalarType::Float);
        let lowering = conv2d_lowering();
        let err = lowering(
            &[
                ArgValue::Buf(input),
                ArgValue::Buf(weight),
                ArgValue::Buf(bias),
                ArgValue::IntList(vec![1, 1]),
                ArgValue::IntList(vec![1, 1]),
                ArgValue::IntList(vec![1, 1]),
                ArgValue::Int(1),
            ],
            &[Expr::long(1), Expr::long(4), Expr::long(6), Expr::long(6)],
            Some(ScalarType::Float),
            Device::Cpu,
        );
        assert!(err.is_err());
    }
}
