//! The loop-nest engine: structural transformations over a root statement
//! and the set of output buffers.
//!
//! The engine supplies the mechanisms (inline, fuse, flatten, split,
//! prepare-for-codegen); the policies that decide when to apply them live in
//! the kernel driver.

pub mod analysis;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dtype::ScalarType;
use crate::ir::simplify::{simplify_expr, simplify_stmt};
use crate::ir::{sanitize_name, Buf, Expr, For, Stmt, Var};
use analysis::{loop_bounds_all_equal, trip_count};

/// A loop nest under transformation.
pub struct LoopNest {
    root: Stmt,
    output_bufs: FxHashSet<Buf>,
}

impl LoopNest {
    pub fn new(root: Stmt, output_bufs: FxHashSet<Buf>) -> LoopNest {
        let root = match root {
            Stmt::Block(_) => root,
            other => Stmt::Block(vec![other]),
        };
        LoopNest { root, output_bufs }
    }

    pub fn root(&self) -> &Stmt {
        &self.root
    }

    pub fn into_root(self) -> Stmt {
        self.root
    }

    /// Canonicalizes display names: loop variables become `i0, i1, ...` in
    /// traversal order and buffer names are made identifier-safe and unique.
    /// Identities are untouched.
    pub fn sanitize_names(&mut self) {
        let mut var_renames: FxHashMap<Var, Var> = FxHashMap::default();
        let mut counter = 0usize;
        self.root.visit(&mut |s| {
            if let Stmt::For(f) = s {
                if !var_renames.contains_key(&f.var) {
                    var_renames.insert(f.var.clone(), f.var.renamed(format!("i{counter}")));
                    counter += 1;
                }
            }
        });
        let renamed = self.root.rewrite_stmts(&mut |s| match s {
            Stmt::For(mut f) => {
                if let Some(new_var) = var_renames.get(&f.var) {
                    f.var = new_var.clone();
                }
                Stmt::For(f)
            }
            other => other,
        });
        let substitutions: FxHashMap<Var, Expr> = var_renames
            .into_iter()
            .map(|(old, new)| (old, Expr::Var(new)))
            .collect();
        let renamed = renamed.substitute(&substitutions);

        let mut order: Vec<Buf> = Vec::new();
        let mut push = |buf: &Buf, order: &mut Vec<Buf>| {
            if !order.contains(buf) {
                order.push(buf.clone());
            }
        };
        renamed.visit(&mut |s| {
            if let Stmt::Store(store) = s {
                push(&store.buf, &mut order);
            }
        });
        renamed.visit_exprs(&mut |e| {
            e.visit(&mut |e| {
                if let Expr::Load { buf, .. } = e {
                    push(buf, &mut order);
                }
            });
        });
        let mut used: FxHashMap<String, usize> = FxHashMap::default();
        let mut buf_renames: FxHashMap<Buf, Buf> = FxHashMap::default();
        for buf in order {
            let base = sanitize_name(buf.name());
            let count = used.entry(base.clone()).or_insert(0);
            let name = if *count == 0 {
                base.clone()
            } else {
                format!("{base}_{count}")
            };
            *count += 1;
            if name != buf.name() {
                buf_renames.insert(buf.clone(), buf.renamed(name));
            }
        }
        self.root = renamed.rewrite_bufs(&mut |b| {
            buf_renames.get(b).cloned().unwrap_or_else(|| b.clone())
        });
    }

    pub fn simplify(&mut self) {
        self.root = simplify_stmt(&self.root);
    }

    /// Buffers written by the nest that are not kernel outputs.
    pub fn intermediate_bufs(&self) -> Vec<Buf> {
        self.root
            .stored_bufs()
            .into_iter()
            .filter(|buf| !self.output_bufs.contains(buf))
            .collect()
    }

    /// Name-to-buffer map of every buffer referenced by the nest. Block
    /// codegen records this before inlining drops multi-dim metadata.
    pub fn record_buffer_map(&self) -> FxHashMap<String, Buf> {
        let mut map = FxHashMap::default();
        self.root.visit(&mut |s| {
            if let Stmt::Store(store) = s {
                map.insert(store.buf.name().to_string(), store.buf.clone());
            }
        });
        self.root.visit_exprs(&mut |e| {
            e.visit(&mut |e| {
                if let Expr::Load { buf, .. } = e {
                    map.insert(buf.name().to_string(), buf.clone());
                }
            });
        });
        map
    }

    /// Substitutes single-store intermediate buffers into their loads and
    /// removes the defining nests. Work duplicated across consumers is
    /// accepted; the caller decides when that is profitable.
    pub fn inline_intermediate_bufs(&mut self, _allow_duplicated_work: bool) {
        while let Some((buf, axes, rhs, position)) = self.find_inlinable() {
            debug!("inlining intermediate buffer {}", buf.name());
            let Stmt::Block(mut children) =
                std::mem::replace(&mut self.root, Stmt::Block(vec![]))
            else {
                return;
            };
            children.remove(position);
            self.root = Stmt::Block(children).rewrite_exprs(&mut |e| match &e {
                Expr::Load { buf: b, indices } if *b == buf => {
                    let map: FxHashMap<Var, Expr> = axes
                        .iter()
                        .cloned()
                        .zip(indices.iter().cloned())
                        .collect();
                    rhs.substitute(&map)
                }
                _ => e,
            });
        }
    }

    /// A root-level definition `for i0 ... { buf[i0, ...] = rhs }` that is
    /// the only store to a non-output buffer.
    fn find_inlinable(&self) -> Option<(Buf, Vec<Var>, Expr, usize)> {
        let Stmt::Block(children) = &self.root else {
            return None;
        };
        let mut store_counts: FxHashMap<Buf, usize> = FxHashMap::default();
        self.root.visit(&mut |s| {
            if let Stmt::Store(store) = s {
                *store_counts.entry(store.buf.clone()).or_insert(0) += 1;
            }
        });
        for (position, child) in children.iter().enumerate() {
            let mut axes = Vec::new();
            let mut cur = child;
            while let Stmt::For(f) = cur {
                axes.push(f.var.clone());
                cur = match &f.body {
                    Stmt::Block(v) if v.len() == 1 => &v[0],
                    other => other,
                };
            }
            let Stmt::Store(store) = cur else { continue };
            if self.output_bufs.contains(&store.buf) {
                continue;
            }
            if store_counts.get(&store.buf) != Some(&1) {
                continue;
            }
            if store.indices.len() != axes.len() {
                continue;
            }
            let plain_axes = store
                .indices
                .iter()
                .zip(&axes)
                .all(|(index, var)| matches!(index, Expr::Var(v) if v == var));
            if !plain_axes {
                continue;
            }
            return Some((store.buf.clone(), axes, store.value.clone(), position));
        }
        None
    }

    /// Hoists conditionals whose condition is invariant in the enclosing
    /// loop, so the test runs once instead of every iteration.
    pub fn optimize_conditionals(&mut self) {
        self.root = self.root.rewrite_stmts(&mut |s| match s {
            Stmt::For(f) => {
                let inner = match &f.body {
                    Stmt::Block(v) if v.len() == 1 => &v[0],
                    other => other,
                };
                if let Stmt::Cond {
                    condition,
                    then_body,
                    else_body,
                } = inner
                {
                    if !condition.uses_var(&f.var) {
                        let wrap = |body: &Stmt| {
                            Stmt::For(Box::new(For {
                                var: f.var.clone(),
                                start: f.start.clone(),
                                stop: f.stop.clone(),
                                body: body.clone(),
                                opts: f.opts.clone(),
                            }))
                        };
                        return Stmt::Cond {
                            condition: condition.clone(),
                            then_body: Box::new(wrap(then_body)),
                            else_body: else_body.as_ref().map(|e| Box::new(wrap(e))),
                        };
                    }
                }
                Stmt::For(f)
            }
            other => other,
        });
    }

    /// Recursively fuses sibling loops with equal constant bounds. Stops at
    /// any level containing a non-loop or a bound mismatch; the restriction
    /// avoids guard conditionals that would block vectorization.
    pub fn fuse_all_loops(&mut self) {
        let root = std::mem::replace(&mut self.root, Stmt::Block(vec![]));
        let fused = Self::fuse_stmt(root);
        self.root = match fused {
            Stmt::Block(_) => fused,
            other => Stmt::Block(vec![other]),
        };
    }

    fn fuse_stmt(stmt: Stmt) -> Stmt {
        let Stmt::Block(children) = stmt else {
            return stmt;
        };
        {
            let mut loops = Vec::new();
            for child in &children {
                let Stmt::For(f) = child else {
                    return Stmt::Block(children);
                };
                loops.push(f.as_ref());
            }
            if loops.is_empty() || !loop_bounds_all_equal(&loops) {
                return Stmt::Block(children);
            }
        }
        let mut iter = children.into_iter();
        let Some(Stmt::For(first)) = iter.next() else {
            return Stmt::Block(vec![]);
        };
        let For {
            var,
            start,
            stop,
            body,
            opts,
        } = *first;
        let mut body_stmts = match body {
            Stmt::Block(v) => v,
            other => vec![other],
        };
        for child in iter {
            let Stmt::For(f) = child else { continue };
            let mut map = FxHashMap::default();
            map.insert(f.var.clone(), Expr::Var(var.clone()));
            match f.body.substitute(&map) {
                Stmt::Block(v) => body_stmts.extend(v),
                other => body_stmts.push(other),
            }
        }
        let fused_body = Self::fuse_stmt(Stmt::Block(body_stmts));
        Stmt::For(Box::new(For {
            var,
            start,
            stop,
            body: fused_body,
            opts,
        }))
    }

    /// Applies `f` to the perfect loop chain enclosing the first store to
    /// `buf`. `f` may return a replacement for the whole chain; `None`
    /// leaves the nest untouched.
    pub fn transform_loops_for(
        &mut self,
        buf: &Buf,
        f: impl FnOnce(&[For]) -> Option<Stmt>,
    ) {
        fn stores_buf(stmt: &Stmt, buf: &Buf) -> bool {
            let mut found = false;
            stmt.visit(&mut |s| {
                if let Stmt::Store(store) = s {
                    if store.buf == *buf {
                        found = true;
                    }
                }
            });
            found
        }

        let Stmt::Block(children) = &mut self.root else {
            return;
        };
        for child in children.iter_mut() {
            if !stores_buf(child, buf) {
                continue;
            }
            let chain = Self::peel_chain(child);
            if chain.is_empty() {
                // A bare store (0-dim output); nothing to transform.
                return;
            }
            if let Some(replacement) = f(&chain) {
                *child = replacement;
            }
            return;
        }
    }

    /// The perfect prefix of the loop nest rooted at `stmt`: loops are
    /// collected while each body holds exactly the next loop.
    fn peel_chain(stmt: &Stmt) -> Vec<For> {
        let mut chain = Vec::new();
        let mut cur = stmt;
        while let Stmt::For(f) = cur {
            chain.push((**f).clone());
            cur = match &f.body {
                Stmt::Block(v) if v.len() == 1 => &v[0],
                other => other,
            };
        }
        chain
    }

    /// Collapses the first `keep` loops of a perfect chain into one loop.
    /// Loop indices are reconstructed with division and modulus; the body is
    /// the innermost kept loop's body. Returns `None` when the chain cannot
    /// be flattened (non-zero starts).
    pub fn flatten(chain: &[For], keep: usize) -> Option<For> {
        let keep = keep.min(chain.len());
        if keep == 0 {
            return None;
        }
        if keep == 1 {
            return Some(chain[0].clone());
        }
        for f in &chain[..keep] {
            if simplify_expr(f.start.clone()).as_long() != Some(0) {
                return None;
            }
        }
        let stops: Vec<Expr> = chain[..keep].iter().map(|f| f.stop.clone()).collect();
        let mut total = stops[0].clone();
        for stop in &stops[1..] {
            total = total * stop.clone();
        }
        let flat_var = Var::new(
            format!("{}_flat", chain[0].var.name()),
            ScalarType::Long,
        );
        let mut strides = vec![Expr::long(1); keep];
        for i in (0..keep - 1).rev() {
            strides[i] = strides[i + 1].clone() * stops[i + 1].clone();
        }
        let mut substitutions = FxHashMap::default();
        for i in 0..keep {
            let mut index = Expr::Var(flat_var.clone()) / strides[i].clone();
            if i > 0 {
                index = index % stops[i].clone();
            }
            substitutions.insert(chain[i].var.clone(), simplify_expr(index));
        }
        let body = chain[keep - 1].body.substitute(&substitutions);
        Some(For::new(
            flat_var,
            Expr::long(0),
            simplify_expr(total),
            body,
        ))
    }

    /// Splits a zero-based loop by `factor`. Returns `(outer, inner)`; the
    /// caller assembles `outer.body = Stmt::For(inner)` after setting any
    /// scheduling options. The body is masked unless the trip count is a
    /// known multiple of the factor.
    pub fn split_with_mask(loop_: &For, factor: i64) -> (For, For) {
        let trip = simplify_expr(loop_.stop.clone());
        let outer_var = Var::new(format!("{}_outer", loop_.var.name()), ScalarType::Long);
        let inner_var = Var::new(format!("{}_inner", loop_.var.name()), ScalarType::Long);
        let combined =
            Expr::Var(outer_var.clone()) * Expr::long(factor) + Expr::Var(inner_var.clone());
        let mut map = FxHashMap::default();
        map.insert(loop_.var.clone(), combined.clone());
        let mut body = loop_.body.substitute(&map);
        let divides = trip
            .as_long()
            .map(|n| n % factor == 0)
            .unwrap_or(false);
        if !divides {
            body = Stmt::Cond {
                condition: combined.lt(trip.clone()),
                then_body: Box::new(body),
                else_body: None,
            };
        }
        let outer_stop =
            simplify_expr((trip + Expr::long(factor - 1)) / Expr::long(factor));
        let inner = For::new(inner_var, Expr::long(0), Expr::long(factor), body);
        let mut outer = For::new(outer_var, Expr::long(0), outer_stop, Stmt::Block(vec![]));
        outer.opts = loop_.opts.clone();
        (outer, inner)
    }

    /// Splits innermost constant-bound loops by the SIMD lane width and
    /// marks the split-off inner loop as vectorized.
    pub fn vectorize_inner_loops(&mut self) {
        const LANES: i64 = 8;
        fn contains_loop(stmt: &Stmt) -> bool {
            let mut found = false;
            stmt.visit(&mut |s| {
                if matches!(s, Stmt::For(_)) {
                    found = true;
                }
            });
            found
        }
        self.root = self.root.rewrite_stmts(&mut |s| {
            let Stmt::For(f) = s else { return s };
            // Parallel loops may still be split (the parallel mark stays on
            // the outer half); GPU-bound or already-vectorized loops may
            // not.
            let splittable = f.opts.gpu_block_index.is_none()
                && f.opts.gpu_thread_index.is_none()
                && f.opts.vector_lanes.is_none();
            if contains_loop(&f.body) || !splittable {
                return Stmt::For(f);
            }
            let divisible = trip_count(&f)
                .map(|n| n >= LANES && n % LANES == 0)
                .unwrap_or(false);
            let zero_based = simplify_expr(f.start.clone()).as_long() == Some(0);
            if !divisible || !zero_based {
                return Stmt::For(f);
            }
            let (mut outer, mut inner) = Self::split_with_mask(&f, LANES);
            inner.opts.vector_lanes = Some(LANES as usize);
            outer.body = Stmt::For(Box::new(inner));
            Stmt::For(Box::new(outer))
        });
    }

    /// Inserts allocate/free pairs for dynamic intermediates and rewrites
    /// every multi-dimensional access to a flat row-major index. Buffers in
    /// `preallocated` are backed by kernel-owned memory and get no
    /// allocation here.
    pub fn prepare_for_codegen(&mut self, preallocated: &FxHashSet<Buf>) {
        fn linear_index(buf: &Buf, indices: &[Expr]) -> Expr {
            if indices.len() == 1 && buf.ndim() <= 1 {
                return indices[0].clone();
            }
            if indices.is_empty() {
                return Expr::long(0);
            }
            let strides = buf.contiguous_stride_exprs();
            let mut linear = Expr::long(0);
            for (index, stride) in indices.iter().zip(strides) {
                linear = linear + index.clone() * stride;
            }
            simplify_expr(linear)
        }

        let dynamic: Vec<Buf> = self
            .intermediate_bufs()
            .into_iter()
            .filter(|buf| !preallocated.contains(buf))
            .collect();

        let flattened = self
            .root
            .rewrite_exprs(&mut |e| match &e {
                Expr::Load { buf, indices } => {
                    Expr::Load {
                        buf: buf.clone(),
                        indices: vec![linear_index(buf, indices)],
                    }
                }
                _ => e,
            })
            .rewrite_stmts(&mut |s| match s {
                Stmt::Store(store) => {
                    let index = linear_index(&store.buf, &store.indices);
                    Stmt::Store(crate::ir::Store {
                        buf: store.buf,
                        indices: vec![index],
                        value: store.value,
                    })
                }
                other => other,
            });

        let mut children: Vec<Stmt> =
            dynamic.iter().cloned().map(Stmt::Allocate).collect();
        match flattened {
            Stmt::Block(stmts) => children.extend(stmts),
            other => children.push(other),
        }
        children.extend(dynamic.into_iter().map(Stmt::Free));
        self.root = Stmt::Block(children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowering::compute;

    fn elementwise(name: &str, n: i64, src: &Buf) -> (Buf, Stmt) {
        let t = compute(name, &[Expr::long(n)], ScalarType::Float, |axes| {
            Ok(Expr::load(src, axes.to_vec()) + Expr::from(1.0f32))
        })
        .unwrap();
        (t.buf, t.stmt.unwrap())
    }

    #[test]
    fn test_fuse_equal_bounds() {
        let x = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let (a_buf, a) = elementwise("a", 8, &x);
        let (b_buf, b) = elementwise("b", 8, &x);
        let outputs = [a_buf, b_buf].into_iter().collect();
        let mut nest = LoopNest::new(Stmt::Block(vec![a, b]), outputs);
        nest.fuse_all_loops();
        let Stmt::Block(children) = nest.root() else {
            panic!("root is not a block")
        };
        assert_eq!(children.len(), 1, "loops with equal bounds should fuse");
        let Stmt::For(f) = &children[0] else {
            panic!("expected a fused loop")
        };
        assert_eq!(f.body.stored_bufs().len(), 2);
    }

    #[test]
    fn test_fuse_refuses_unequal_bounds() {
        let x = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let y = Buf::new("y", vec![Expr::long(4)], ScalarType::Float);
        let (a_buf, a) = elementwise("a", 8, &x);
        let (b_buf, b) = elementwise("b", 4, &y);
        let outputs = [a_buf, b_buf].into_iter().collect();
        let mut nest = LoopNest::new(Stmt::Block(vec![a, b]), outputs);
        nest.fuse_all_loops();
        let Stmt::Block(children) = nest.root() else {
            panic!("root is not a block")
        };
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_inline_intermediate() {
        let x = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let (mid_buf, mid) = elementwise("mid", 8, &x);
        let out = compute("out", &[Expr::long(8)], ScalarType::Float, |axes| {
            Ok(Expr::load(&mid_buf, axes.to_vec()) * Expr::from(2.0f32))
        })
        .unwrap();
        let outputs = [out.buf.clone()].into_iter().collect();
        let mut nest = LoopNest::new(Stmt::Block(vec![mid, out.stmt.unwrap()]), outputs);
        nest.inline_intermediate_bufs(true);
        let Stmt::Block(children) = nest.root() else {
            panic!("root is not a block")
        };
        assert_eq!(children.len(), 1, "the intermediate nest should be gone");
        let text = nest.root().to_string();
        assert!(text.contains("((x[i0] + 1f) * 2f)"), "got:\n{text}");
    }

    #[test]
    fn test_flatten_reconstructs_indices() {
        let x = Buf::new("x", vec![Expr::long(2), Expr::long(3)], ScalarType::Float);
        let t = compute("out", &[Expr::long(2), Expr::long(3)], ScalarType::Float, |axes| {
            Ok(Expr::load(&x, axes.to_vec()))
        })
        .unwrap();
        let chain = LoopNest::peel_chain(t.stmt.as_ref().unwrap());
        assert_eq!(chain.len(), 2);
        let flat = LoopNest::flatten(&chain, 2).unwrap();
        assert_eq!(analysis::trip_count(&flat), Some(6));
        let text = Stmt::For(Box::new(flat)).to_string();
        assert!(text.contains("/ 3"), "outer index should divide: {text}");
        assert!(text.contains("% 3"), "inner index should wrap: {text}");
    }

    #[test]
    fn test_split_with_mask_masks_ragged_trips() {
        let x = Buf::new("x", vec![Expr::long(10)], ScalarType::Float);
        let t = compute("out", &[Expr::long(10)], ScalarType::Float, |axes| {
            Ok(Expr::load(&x, axes.to_vec()))
        })
        .unwrap();
        let chain = LoopNest::peel_chain(t.stmt.as_ref().unwrap());
        let (outer, inner) = LoopNest::split_with_mask(&chain[0], 4);
        assert_eq!(analysis::trip_count(&outer), Some(3));
        assert_eq!(analysis::trip_count(&inner), Some(4));
        assert!(matches!(inner.body, Stmt::Cond { .. }));
    }

    #[test]
    fn test_split_without_mask_when_divisible() {
        let x = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let t = compute("out", &[Expr::long(8)], ScalarType::Float, |axes| {
            Ok(Expr::load(&x, axes.to_vec()))
        })
        .unwrap();
        let chain = LoopNest::peel_chain(t.stmt.as_ref().unwrap());
        let (_, inner) = LoopNest::split_with_mask(&chain[0], 4);
        assert!(matches!(inner.body, Stmt::Store(_)));
    }

    #[test]
    fn test_prepare_for_codegen_flattens_and_allocates() {
        let x = Buf::new("x", vec![Expr::long(2), Expr::long(3)], ScalarType::Float);
        let (mid_buf, mid) = {
            let t = compute("mid", &[Expr::long(2), Expr::long(3)], ScalarType::Float, |axes| {
                Ok(Expr::load(&x, axes.to_vec()))
            })
            .unwrap();
            (t.buf, t.stmt.unwrap())
        };
        let out = compute("out", &[Expr::long(2), Expr::long(3)], ScalarType::Float, |axes| {
            Ok(Expr::load(&mid_buf, axes.to_vec()))
        })
        .unwrap();
        let outputs = [out.buf.clone()].into_iter().collect();
        let mut nest = LoopNest::new(Stmt::Block(vec![mid, out.stmt.unwrap()]), outputs);
        nest.prepare_for_codegen(&FxHashSet::default());
        let text = nest.root().to_string();
        assert!(text.contains("alloc mid"), "got:\n{text}");
        assert!(text.contains("free mid"), "got:\n{text}");
        assert!(text.contains("out[((i0 * 3) + i1)]"), "got:\n{text}");
    }

    #[test]
    fn test_vectorize_inner_loops() {
        let x = Buf::new("x", vec![Expr::long(16)], ScalarType::Float);
        let t = compute("out", &[Expr::long(16)], ScalarType::Float, |axes| {
            Ok(Expr::load(&x, axes.to_vec()))
        })
        .unwrap();
        let outputs = [t.buf.clone()].into_iter().collect();
        let mut nest = LoopNest::new(t.stmt.unwrap(), outputs);
        nest.vectorize_inner_loops();
        let text = nest.root().to_string();
        assert!(text.contains("@vec8"), "got:\n{text}");
    }

    #[test]
    fn test_hoist_invariant_conditional() {
        let x = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let flag = Var::new("flag", ScalarType::Long);
        let i = Var::new("i", ScalarType::Long);
        let store = Stmt::store(&x, vec![Expr::Var(i.clone())], Expr::from(1.0f32));
        let body = Stmt::Cond {
            condition: Expr::Var(flag).lt(Expr::long(1)),
            then_body: Box::new(store),
            else_body: None,
        };
        let loop_ = Stmt::loop_over(i, Expr::long(8), body);
        let mut nest = LoopNest::new(loop_, FxHashSet::default());
        nest.optimize_conditionals();
        let Stmt::Block(children) = nest.root() else {
            panic!("root is not a block")
        };
        assert!(
            matches!(children[0], Stmt::Cond { .. }),
            "conditional should be hoisted above the loop"
        );
    }
}
