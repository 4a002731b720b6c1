//! Analyses the transformation policies gate on: constant bounds, trip
//! counts, reductions, and loop-carried dependences.

use crate::ir::simplify::simplify_expr;
use crate::ir::{Expr, For, Stmt};

/// `(start, stop)` if both bounds simplify to integer constants.
pub fn loop_bounds(loop_: &For) -> Option<(i64, i64)> {
    let start = simplify_expr(loop_.start.clone()).as_long()?;
    let stop = simplify_expr(loop_.stop.clone()).as_long()?;
    Some((start, stop))
}

/// Constant trip count, if the bounds are constants.
pub fn trip_count(loop_: &For) -> Option<i64> {
    let (start, stop) = loop_bounds(loop_)?;
    Some((stop - start).max(0))
}

/// True if all loops have equal constant bounds.
pub fn loop_bounds_all_equal(loops: &[&For]) -> bool {
    let Some(first) = loops.first().and_then(|l| loop_bounds(l)) else {
        return false;
    };
    loops.iter().all(|l| loop_bounds(l) == Some(first))
}

/// True if the tree contains a reduction: a store whose value reads the
/// buffer being written.
pub fn has_reduction(stmt: &Stmt) -> bool {
    let mut found = false;
    stmt.visit(&mut |s| {
        if let Stmt::Store(store) = s {
            store.value.visit(&mut |e| {
                if let Expr::Load { buf, .. } = e {
                    if *buf == store.buf {
                        found = true;
                    }
                }
            });
        }
    });
    found
}

/// Conservative loop-carried dependence check for `loop_`.
///
/// Reports a dependence when, within the loop body:
/// - a buffer is written by more than one store,
/// - a store reads any buffer that is also written in the body, or
/// - a store's indices do not mention the loop variable (every iteration
///   hits the same location).
pub fn has_loop_carried_dependence(loop_: &For) -> bool {
    let written = loop_.body.stored_bufs();
    let mut dependence = false;
    loop_.body.visit(&mut |s| {
        if let Stmt::Store(store) = s {
            store.value.visit(&mut |e| {
                if let Expr::Load { buf, .. } = e {
                    if written.contains(buf) {
                        dependence = true;
                    }
                }
            });
            if !store
                .indices
                .iter()
                .any(|index| index.uses_var(&loop_.var))
            {
                dependence = true;
            }
        }
    });
    if dependence {
        return true;
    }
    // More than one store to the same buffer.
    let mut stores_per_buf = rustc_hash::FxHashMap::default();
    loop_.body.visit(&mut |s| {
        if let Stmt::Store(store) = s {
            *stores_per_buf.entry(store.buf.clone()).or_insert(0usize) += 1;
        }
    });
    stores_per_buf.values().any(|&count| count > 1)
}
