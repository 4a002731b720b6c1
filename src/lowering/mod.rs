//! Operator lowering: the argument sum type, the lowering-function tables,
//! and the `compute` construction helper.
//!
//! Lowering functions are plain values keyed by symbol (per-kernel custom
//! table) or by schema string (global standard table); dispatch is a table
//! lookup, never inheritance.

pub mod ops;

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::dtype::{Device, ScalarType};
use crate::error::Result;
use crate::graph::Symbol;
use crate::ir::{Buf, Expr, Stmt, Var};

/// A lowered tensor: its buffer and the statement that computes it. Pure
/// inputs, constants, and outputs have no defining statement.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub buf: Buf,
    pub stmt: Option<Stmt>,
}

impl Tensor {
    pub fn new(buf: Buf, stmt: Stmt) -> Tensor {
        Tensor {
            buf,
            stmt: Some(stmt),
        }
    }

    pub fn buf_only(buf: Buf) -> Tensor {
        Tensor { buf, stmt: None }
    }
}

/// An argument handed to a lowering function.
///
/// An empty `prim::ListConstruct` converts to `BufList(vec![])` regardless
/// of the expected element type; lowerings must type empty lists themselves.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Buf(Buf),
    /// A scalar kernel argument (bound input).
    Var(Var),
    Int(i64),
    Double(f64),
    Bool(bool),
    None,
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    BufList(Vec<Buf>),
}

impl ArgValue {
    pub fn as_buf(&self) -> Option<&Buf> {
        match self {
            ArgValue::Buf(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ArgValue::None)
    }

    /// The scalar expression for an immediate or scalar-variable argument.
    pub fn scalar_expr(&self) -> Option<Expr> {
        match self {
            ArgValue::Var(v) => Some(Expr::Var(v.clone())),
            ArgValue::Int(v) => Some(Expr::long(*v)),
            ArgValue::Double(v) => Some(Expr::from(*v)),
            ArgValue::Bool(v) => Some(Expr::Imm(crate::ir::Imm::Bool(*v))),
            _ => None,
        }
    }
}

/// Signature of an operator lowering: arguments, output shape, output dtype,
/// and device produce a lowered tensor.
pub type LoweringFn =
    Arc<dyn Fn(&[ArgValue], &[Expr], Option<ScalarType>, Device) -> Result<Tensor> + Send + Sync>;

/// Per-kernel custom lowerings, keyed by node kind.
pub type CustomLoweringTable = FxHashMap<Symbol, LoweringFn>;

static STANDARD_LOWERINGS: Lazy<RwLock<FxHashMap<String, LoweringFn>>> =
    Lazy::new(|| RwLock::new(ops::builtin_lowerings()));

/// Looks up the global lowering registered for a schema string.
pub fn standard_lowering_for(schema: &str) -> Option<LoweringFn> {
    STANDARD_LOWERINGS
        .read()
        .ok()
        .and_then(|table| table.get(schema).cloned())
}

/// Registers (or replaces) a standard lowering.
pub fn register_standard_lowering(schema: &str, lowering: LoweringFn) {
    if let Ok(mut table) = STANDARD_LOWERINGS.write() {
        table.insert(schema.to_string(), lowering);
    }
}

/// Builds the loop nest that fills a fresh buffer element-by-element.
///
/// `body` receives one index expression per dimension and produces the
/// stored value. Zero-dim shapes produce a single bare store.
pub fn compute<F>(name: &str, dims: &[Expr], dtype: ScalarType, body: F) -> Result<Tensor>
where
    F: FnOnce(&[Expr]) -> Result<Expr>,
{
    let buf = Buf::new(name, dims.to_vec(), dtype);
    let axes: Vec<Var> = (0..dims.len())
        .map(|i| Var::new(format!("i{i}"), ScalarType::Long))
        .collect();
    let axis_exprs: Vec<Expr> = axes.iter().cloned().map(Expr::Var).collect();
    let value = body(&axis_exprs)?.cast(dtype);
    let mut stmt = Stmt::store(&buf, axis_exprs, value);
    for (axis, dim) in axes.into_iter().zip(dims).rev() {
        stmt = Stmt::loop_over(axis, dim.clone(), stmt);
    }
    Ok(Tensor::new(buf, stmt))
}

/// Reads `buf` at `axes`, aligning trailing dimensions and loading index 0
/// on broadcast (size-1) dimensions.
pub fn broadcast_load(buf: &Buf, axes: &[Expr]) -> Expr {
    let skip = axes.len().saturating_sub(buf.ndim());
    let indices: Vec<Expr> = buf
        .dims()
        .iter()
        .zip(axes[skip..].iter())
        .map(|(dim, axis)| {
            if dim.as_long() == Some(1) {
                Expr::long(0)
            } else {
                axis.clone()
            }
        })
        .collect();
    Expr::load(buf, indices)
}

/// True if lowering `buf` against `out_shape` broadcasts any dimension:
/// the buffer has lower rank, or a size-1 dimension meets a larger output
/// extent. Higher-rank arguments (reduction and window inputs) are not
/// broadcast reads.
pub fn is_broadcast(buf: &Buf, out_shape: &[Expr]) -> bool {
    if buf.ndim() > out_shape.len() {
        return false;
    }
    if buf.ndim() < out_shape.len() {
        return true;
    }
    buf.dims()
        .iter()
        .zip(out_shape)
        .any(|(dim, out)| dim.as_long() == Some(1) && out.as_long() != Some(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_builds_nest() {
        let src = Buf::new("x", vec![Expr::long(2), Expr::long(3)], ScalarType::Float);
        let t = compute(
            "out",
            &[Expr::long(2), Expr::long(3)],
            ScalarType::Float,
            |axes| Ok(Expr::load(&src, axes.to_vec()) + Expr::from(1.0f32)),
        )
        .unwrap();
        let text = t.stmt.unwrap().to_string();
        assert!(text.contains("for (i0 = 0; i0 < 2; i0++)"));
        assert!(text.contains("for (i1 = 0; i1 < 3; i1++)"));
        assert!(text.contains("out[i0, i1] = (x[i0, i1] + 1f);"));
    }

    #[test]
    fn test_compute_zero_dim() {
        let t = compute("scalar", &[], ScalarType::Float, |_| Ok(Expr::from(2.5f32))).unwrap();
        assert!(matches!(t.stmt, Some(Stmt::Store(_))));
        assert_eq!(t.buf.ndim(), 0);
    }

    #[test]
    fn test_broadcast_load_uses_zero_index() {
        let buf = Buf::new("b", vec![Expr::long(1), Expr::long(16)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let j = Var::new("j", ScalarType::Long);
        let expr = broadcast_load(&buf, &[Expr::Var(i), Expr::Var(j)]);
        assert_eq!(expr.to_string(), "b[0, j]");
    }

    #[test]
    fn test_is_broadcast() {
        let out = [Expr::long(8), Expr::long(16)];
        let same = Buf::new("a", vec![Expr::long(8), Expr::long(16)], ScalarType::Float);
        let row = Buf::new("r", vec![Expr::long(1), Expr::long(16)], ScalarType::Float);
        assert!(!is_broadcast(&same, &out));
        assert!(is_broadcast(&row, &out));
    }
}
