//! Loop-nest intermediate representation.
//!
//! Kernels are expressed as statements ([`Stmt`]) over scalar expressions
//! ([`Expr`]) reading and writing logically contiguous buffers ([`Buf`]).
//! Graph lowering produces one defining statement per tensor; the loop-nest
//! engine in [`crate::loopnest`] then reshapes the statements for a backend.

mod buf;
mod expr;
pub mod simplify;
mod stmt;

pub use buf::Buf;
pub use expr::{BinOp, CmpOp, Expr, Imm, UnOp, Var};
pub use stmt::{For, LoopOptions, Stmt, Store};

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique id for variables and buffers. Display names are separate;
/// identity never depends on them.
pub(crate) fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Replaces characters that are not valid in an identifier with underscores.
/// A leading digit gets an underscore prefix.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if i == 0 && c.is_ascii_digit() {
                out.push('_');
            }
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("x.1"), "x_1");
        assert_eq!(sanitize_name("3abc"), "_3abc");
        assert_eq!(sanitize_name("already_fine"), "already_fine");
    }
}
