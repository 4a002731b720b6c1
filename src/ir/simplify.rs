//! Arithmetic simplification over expressions and statements.
//!
//! Constant folding plus the usual identities. Loop bounds must simplify to
//! immediates for the fusion and parallelization policies to fire, so this
//! runs several times during the transformation pipeline.

use crate::ir::{BinOp, CmpOp, Expr, Imm, Stmt, UnOp};

fn is_zero(imm: Imm) -> bool {
    imm.to_double() == 0.0
}

fn is_one(imm: Imm) -> bool {
    imm.to_double() == 1.0
}

fn fold_binary(op: BinOp, lhs: Imm, rhs: Imm) -> Imm {
    let dtype = lhs.dtype().promote(rhs.dtype());
    if dtype.is_floating_point() {
        let a = lhs.to_double();
        let b = rhs.to_double();
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Mod => a % b,
            BinOp::Max => a.max(b),
            BinOp::Min => a.min(b),
        };
        Imm::from_double(v, dtype)
    } else {
        let a = lhs.to_long();
        let b = rhs.to_long();
        let v = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => a / b,
            BinOp::Mod => a % b,
            BinOp::Max => a.max(b),
            BinOp::Min => a.min(b),
        };
        Imm::from_double(v as f64, dtype)
    }
}

fn simplify_node(expr: Expr) -> Expr {
    match expr {
        Expr::Binary(op, lhs, rhs) => {
            match (op, lhs.as_imm(), rhs.as_imm()) {
                // Division and modulus by a zero immediate are left in place.
                (BinOp::Div | BinOp::Mod, _, Some(b)) if is_zero(b) => {
                    Expr::Binary(op, lhs, rhs)
                }
                (_, Some(a), Some(b)) => Expr::Imm(fold_binary(op, a, b)),
                (BinOp::Add, Some(a), _) if is_zero(a) => *rhs,
                (BinOp::Add | BinOp::Sub, _, Some(b)) if is_zero(b) => *lhs,
                (BinOp::Mul, Some(a), _) if is_zero(a) => *lhs,
                (BinOp::Mul, _, Some(b)) if is_zero(b) => *rhs,
                (BinOp::Mul, Some(a), _) if is_one(a) => *rhs,
                (BinOp::Mul | BinOp::Div, _, Some(b)) if is_one(b) => *lhs,
                (BinOp::Mod, _, Some(b)) if is_one(b) && !lhs.dtype().is_floating_point() => {
                    Expr::long(0)
                }
                _ => Expr::Binary(op, lhs, rhs),
            }
        }
        Expr::Compare(op, lhs, rhs) => match (lhs.as_imm(), rhs.as_imm()) {
            (Some(a), Some(b)) => {
                let (a, b) = (a.to_double(), b.to_double());
                let v = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                Expr::Imm(Imm::Bool(v))
            }
            _ => Expr::Compare(op, lhs, rhs),
        },
        Expr::Unary(UnOp::Neg, operand) => match *operand {
            Expr::Imm(imm) => Expr::Imm(Imm::from_double(-imm.to_double(), imm.dtype())),
            Expr::Unary(UnOp::Neg, inner) => *inner,
            other => Expr::Unary(UnOp::Neg, Box::new(other)),
        },
        Expr::Cast(dtype, operand) => match operand.as_imm() {
            Some(imm) => Expr::Imm(Imm::from_double(imm.to_double(), dtype)),
            None if operand.dtype() == dtype => *operand,
            None => Expr::Cast(dtype, operand),
        },
        other => other,
    }
}

pub fn simplify_expr(expr: Expr) -> Expr {
    expr.rewrite(&mut simplify_node)
}

/// Simplifies every expression in the tree, prunes zero-trip loops and
/// constant conditionals, and splices nested blocks.
pub fn simplify_stmt(stmt: &Stmt) -> Stmt {
    let stmt = stmt.rewrite_exprs(&mut simplify_node);
    prune(stmt)
}

fn prune(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Block(stmts) => {
            let mut out = Vec::with_capacity(stmts.len());
            for s in stmts {
                match prune(s) {
                    Stmt::Block(inner) => out.extend(inner),
                    kept => out.push(kept),
                }
            }
            Stmt::Block(out)
        }
        Stmt::For(mut f) => {
            if let (Some(start), Some(stop)) = (f.start.as_long(), f.stop.as_long()) {
                if stop <= start {
                    return Stmt::Block(vec![]);
                }
            }
            f.body = prune(f.body);
            Stmt::For(f)
        }
        Stmt::Cond {
            condition,
            then_body,
            else_body,
        } => match condition.as_imm() {
            Some(Imm::Bool(true)) => prune(*then_body),
            Some(Imm::Bool(false)) => match else_body {
                Some(e) => prune(*e),
                None => Stmt::Block(vec![]),
            },
            _ => Stmt::Cond {
                condition,
                then_body: Box::new(prune(*then_body)),
                else_body: else_body.map(|e| Box::new(prune(*e))),
            },
        },
        other => other,
    }
}
