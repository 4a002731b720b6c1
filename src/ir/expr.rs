//! Scalar expressions.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::sync::Arc;

use half::f16;

use crate::dtype::ScalarType;
use crate::ir::Buf;

#[derive(Debug)]
struct VarData {
    id: usize,
    name: String,
    dtype: ScalarType,
}

/// A scalar variable: a loop index, a length variable, or a scalar kernel
/// argument. Identity is by id; the name exists for display only.
#[derive(Debug, Clone)]
pub struct Var(Arc<VarData>);

impl Var {
    pub fn new(name: impl Into<String>, dtype: ScalarType) -> Var {
        Var(Arc::new(VarData {
            id: super::next_id(),
            name: name.into(),
            dtype,
        }))
    }

    /// A copy of this variable under a different display name. Identity is
    /// preserved, so existing references keep resolving to it.
    pub fn renamed(&self, name: impl Into<String>) -> Var {
        Var(Arc::new(VarData {
            id: self.0.id,
            name: name.into(),
            dtype: self.0.dtype,
        }))
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dtype(&self) -> ScalarType {
        self.0.dtype
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Var {}

impl std::hash::Hash for Var {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// A typed immediate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    Bool(bool),
    Byte(u8),
    Char(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Half(f16),
    Float(f32),
    Double(f64),
}

impl Imm {
    pub fn dtype(self) -> ScalarType {
        match self {
            Imm::Bool(_) => ScalarType::Bool,
            Imm::Byte(_) => ScalarType::Byte,
            Imm::Char(_) => ScalarType::Char,
            Imm::Short(_) => ScalarType::Short,
            Imm::Int(_) => ScalarType::Int,
            Imm::Long(_) => ScalarType::Long,
            Imm::Half(_) => ScalarType::Half,
            Imm::Float(_) => ScalarType::Float,
            Imm::Double(_) => ScalarType::Double,
        }
    }

    pub fn to_long(self) -> i64 {
        match self {
            Imm::Bool(v) => v as i64,
            Imm::Byte(v) => v as i64,
            Imm::Char(v) => v as i64,
            Imm::Short(v) => v as i64,
            Imm::Int(v) => v as i64,
            Imm::Long(v) => v,
            Imm::Half(v) => f32::from(v) as i64,
            Imm::Float(v) => v as i64,
            Imm::Double(v) => v as i64,
        }
    }

    pub fn to_double(self) -> f64 {
        match self {
            Imm::Bool(v) => v as u8 as f64,
            Imm::Byte(v) => v as f64,
            Imm::Char(v) => v as f64,
            Imm::Short(v) => v as f64,
            Imm::Int(v) => v as f64,
            Imm::Long(v) => v as f64,
            Imm::Half(v) => f64::from(v),
            Imm::Float(v) => v as f64,
            Imm::Double(v) => v,
        }
    }

    /// Builds an immediate of `dtype` from a double value.
    pub fn from_double(value: f64, dtype: ScalarType) -> Imm {
        match dtype {
            ScalarType::Bool => Imm::Bool(value != 0.0),
            ScalarType::Byte => Imm::Byte(value as u8),
            ScalarType::Char => Imm::Char(value as i8),
            ScalarType::Short => Imm::Short(value as i16),
            ScalarType::Int => Imm::Int(value as i32),
            ScalarType::Long => Imm::Long(value as i64),
            ScalarType::Half => Imm::Half(f16::from_f64(value)),
            ScalarType::Float => Imm::Float(value as f32),
            ScalarType::Double => Imm::Double(value),
        }
    }
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Bool(v) => write!(f, "{v}"),
            Imm::Byte(v) => write!(f, "{v}u8"),
            Imm::Char(v) => write!(f, "{v}i8"),
            Imm::Short(v) => write!(f, "{v}i16"),
            Imm::Int(v) => write!(f, "{v}"),
            Imm::Long(v) => write!(f, "{v}"),
            Imm::Half(v) => write!(f, "{v}h"),
            Imm::Float(v) => write!(f, "{v}f"),
            Imm::Double(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Tanh,
    Sigmoid,
}

/// A scalar expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Imm(Imm),
    Var(Var),
    /// Read `buf` at the given logical indices (row-major). Codegen
    /// preparation rewrites these to single flat indices.
    Load { buf: Buf, indices: Vec<Expr> },
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Cast(ScalarType, Box<Expr>),
}

impl Expr {
    pub fn long(value: i64) -> Expr {
        Expr::Imm(Imm::Long(value))
    }

    pub fn load(buf: &Buf, indices: Vec<Expr>) -> Expr {
        Expr::Load {
            buf: buf.clone(),
            indices,
        }
    }

    pub fn cast(self, dtype: ScalarType) -> Expr {
        if self.dtype() == dtype {
            return self;
        }
        Expr::Cast(dtype, Box::new(self))
    }

    pub fn max(self, other: Expr) -> Expr {
        Expr::Binary(BinOp::Max, Box::new(self), Box::new(other))
    }

    pub fn min(self, other: Expr) -> Expr {
        Expr::Binary(BinOp::Min, Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: Expr) -> Expr {
        Expr::Compare(CmpOp::Lt, Box::new(self), Box::new(other))
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        Expr::Unary(op, Box::new(operand))
    }

    /// The immediate payload, if this expression is a constant.
    pub fn as_imm(&self) -> Option<Imm> {
        match self {
            Expr::Imm(imm) => Some(*imm),
            _ => None,
        }
    }

    /// The constant integer value, if this expression is an integral
    /// immediate.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Expr::Imm(imm) if !imm.dtype().is_floating_point() => Some(imm.to_long()),
            _ => None,
        }
    }

    pub fn dtype(&self) -> ScalarType {
        match self {
            Expr::Imm(imm) => imm.dtype(),
            Expr::Var(var) => var.dtype(),
            Expr::Load { buf, .. } => buf.dtype(),
            Expr::Binary(_, lhs, rhs) => lhs.dtype().promote(rhs.dtype()),
            Expr::Compare(..) => ScalarType::Bool,
            Expr::Unary(_, operand) => operand.dtype(),
            Expr::Cast(dtype, _) => *dtype,
        }
    }

    /// Rebuilds the tree bottom-up, applying `f` to every node after its
    /// children have been rewritten.
    pub fn rewrite(&self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Imm(_) | Expr::Var(_) => self.clone(),
            Expr::Load { buf, indices } => Expr::Load {
                buf: buf.clone(),
                indices: indices.iter().map(|i| i.rewrite(f)).collect(),
            },
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                *op,
                Box::new(lhs.rewrite(f)),
                Box::new(rhs.rewrite(f)),
            ),
            Expr::Compare(op, lhs, rhs) => Expr::Compare(
                *op,
                Box::new(lhs.rewrite(f)),
                Box::new(rhs.rewrite(f)),
            ),
            Expr::Unary(op, operand) => Expr::Unary(*op, Box::new(operand.rewrite(f))),
            Expr::Cast(dtype, operand) => Expr::Cast(*dtype, Box::new(operand.rewrite(f))),
        };
        f(rebuilt)
    }

    /// Visits every node of the tree.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Imm(_) | Expr::Var(_) => {}
            Expr::Load { indices, .. } => {
                for index in indices {
                    index.visit(f);
                }
            }
            Expr::Binary(_, lhs, rhs) | Expr::Compare(_, lhs, rhs) => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Unary(_, operand) | Expr::Cast(_, operand) => operand.visit(f),
        }
    }

    /// Substitutes variables by id.
    pub fn substitute(&self, map: &rustc_hash::FxHashMap<Var, Expr>) -> Expr {
        self.rewrite(&mut |e| match &e {
            Expr::Var(var) => map.get(var).cloned().unwrap_or(e),
            _ => e,
        })
    }

    /// True if the expression references `var`.
    pub fn uses_var(&self, var: &Var) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if v == var {
                    found = true;
                }
            }
        });
        found
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Expr {
        Expr::Imm(Imm::Long(value))
    }
}

impl From<f32> for Expr {
    fn from(value: f32) -> Expr {
        Expr::Imm(Imm::Float(value))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Expr {
        Expr::Imm(Imm::Double(value))
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Expr {
        Expr::Var(var)
    }
}

macro_rules! impl_expr_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::Binary($op, Box::new(self), Box::new(rhs))
            }
        }
    };
}

impl_expr_binop!(Add, add, BinOp::Add);
impl_expr_binop!(Sub, sub, BinOp::Sub);
impl_expr_binop!(Mul, mul, BinOp::Mul);
impl_expr_binop!(Div, div, BinOp::Div);
impl_expr_binop!(Rem, rem, BinOp::Mod);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary(UnOp::Neg, Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Imm(imm) => write!(f, "{imm}"),
            Expr::Var(var) => write!(f, "{var}"),
            Expr::Load { buf, indices } => {
                write!(f, "{}[", buf.name())?;
                for (i, index) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{index}")?;
                }
                write!(f, "]")
            }
            Expr::Binary(op, lhs, rhs) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                    BinOp::Max => return write!(f, "max({lhs}, {rhs})"),
                    BinOp::Min => return write!(f, "min({lhs}, {rhs})"),
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
            Expr::Compare(op, lhs, rhs) => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
            Expr::Unary(op, operand) => {
                let name = match op {
                    UnOp::Neg => return write!(f, "(-{operand})"),
                    UnOp::Abs => "abs",
                    UnOp::Sqrt => "sqrt",
                    UnOp::Exp => "exp",
                    UnOp::Log => "log",
                    UnOp::Tanh => "tanh",
                    UnOp::Sigmoid => "sigmoid",
                };
                write!(f, "{name}({operand})")
            }
            Expr::Cast(dtype, operand) => write!(f, "({dtype})({operand})"),
        }
    }
}
