//! Buffer descriptors.

use std::fmt;
use std::sync::Arc;

use crate::dtype::ScalarType;
use crate::ir::Expr;

#[derive(Debug)]
struct BufData {
    id: usize,
    name: String,
    dims: Vec<Expr>,
    dtype: ScalarType,
}

/// An allocation descriptor: a name, ordered dimension expressions, and an
/// element type. Buffers are logically contiguous in row-major order;
/// non-contiguous physical layouts are materialized through gather computes
/// before lowering sees them. Identity is by id, so two buffers with the
/// same name are still distinct.
#[derive(Debug, Clone)]
pub struct Buf(Arc<BufData>);

impl Buf {
    pub fn new(name: impl Into<String>, dims: Vec<Expr>, dtype: ScalarType) -> Buf {
        Buf(Arc::new(BufData {
            id: super::next_id(),
            name: name.into(),
            dims,
            dtype,
        }))
    }

    /// A copy of this buffer under a different display name. Identity is
    /// preserved, so existing references keep resolving to it.
    pub fn renamed(&self, name: impl Into<String>) -> Buf {
        Buf(Arc::new(BufData {
            id: self.0.id,
            name: name.into(),
            dims: self.0.dims.clone(),
            dtype: self.0.dtype,
        }))
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dims(&self) -> &[Expr] {
        &self.0.dims
    }

    pub fn ndim(&self) -> usize {
        self.0.dims.len()
    }

    pub fn dtype(&self) -> ScalarType {
        self.0.dtype
    }

    /// Number of elements if every dimension is a constant.
    pub fn static_numel(&self) -> Option<i64> {
        let mut numel = 1i64;
        for dim in self.dims() {
            numel *= dim.as_long()?;
        }
        Some(numel)
    }

    /// Row-major strides as expressions over the dimension expressions.
    pub fn contiguous_stride_exprs(&self) -> Vec<Expr> {
        let n = self.ndim();
        let mut strides = vec![Expr::long(1); n];
        for i in (0..n.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1].clone() * self.0.dims[i + 1].clone();
        }
        strides
    }
}

impl PartialEq for Buf {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Buf {}

impl std::hash::Hash for Buf {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_by_id() {
        let a = Buf::new("t", vec![Expr::long(4)], ScalarType::Float);
        let b = Buf::new("t", vec![Expr::long(4)], ScalarType::Float);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_static_numel() {
        let buf = Buf::new(
            "t",
            vec![Expr::long(2), Expr::long(3)],
            ScalarType::Float,
        );
        assert_eq!(buf.static_numel(), Some(6));

        let sym = crate::ir::Var::new("n", ScalarType::Long);
        let dynamic = Buf::new("u", vec![Expr::from(sym)], ScalarType::Float);
        assert_eq!(dynamic.static_numel(), None);
    }

    #[test]
    fn test_contiguous_stride_exprs() {
        let buf = Buf::new(
            "t",
            vec![Expr::long(2), Expr::long(3), Expr::long(4)],
            ScalarType::Float,
        );
        let strides: Vec<String> = buf
            .contiguous_stride_exprs()
            .iter()
            .map(|s| crate::ir::simplify::simplify_expr(s.clone()).to_string())
            .collect();
        assert_eq!(strides, vec!["12", "4", "1"]);
    }
}
