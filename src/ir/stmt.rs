//! Statements: blocks, loops, stores, conditionals, allocations.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::ir::{Buf, Expr, Var};

/// Scheduling metadata attached to a loop.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Execute iterations on the host thread pool.
    pub parallel: bool,
    /// GPU grid binding for this loop's index.
    pub gpu_block_index: Option<usize>,
    /// GPU thread binding for this loop's index.
    pub gpu_thread_index: Option<usize>,
    /// SIMD lane count; set by inner-loop vectorization.
    pub vector_lanes: Option<usize>,
    /// Multi-dimensional buffer metadata for block codegen, recorded before
    /// inlining drops it.
    pub buffer_map: Option<FxHashMap<String, Buf>>,
}

impl LoopOptions {
    pub fn is_default(&self) -> bool {
        !self.parallel
            && self.gpu_block_index.is_none()
            && self.gpu_thread_index.is_none()
            && self.vector_lanes.is_none()
            && self.buffer_map.is_none()
    }
}

/// A counted loop over `[start, stop)`.
#[derive(Debug, Clone)]
pub struct For {
    pub var: Var,
    pub start: Expr,
    pub stop: Expr,
    pub body: Stmt,
    pub opts: LoopOptions,
}

impl For {
    pub fn new(var: Var, start: Expr, stop: Expr, body: Stmt) -> For {
        For {
            var,
            start,
            stop,
            body,
            opts: LoopOptions::default(),
        }
    }
}

/// An assignment into a buffer element.
#[derive(Debug, Clone)]
pub struct Store {
    pub buf: Buf,
    pub indices: Vec<Expr>,
    pub value: Expr,
}

/// A statement in the loop-nest IR.
#[derive(Debug, Clone)]
pub enum Stmt {
    Block(Vec<Stmt>),
    For(Box<For>),
    Store(Store),
    Cond {
        condition: Expr,
        then_body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    /// Reserve backing memory for a dynamic intermediate.
    Allocate(Buf),
    Free(Buf),
}

impl Stmt {
    pub fn store(buf: &Buf, indices: Vec<Expr>, value: Expr) -> Stmt {
        Stmt::Store(Store {
            buf: buf.clone(),
            indices,
            value,
        })
    }

    pub fn loop_over(var: Var, stop: Expr, body: Stmt) -> Stmt {
        Stmt::For(Box::new(For::new(var, Expr::long(0), stop, body)))
    }

    /// Child statements, if any.
    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Stmt::Block(stmts) => stmts.iter().collect(),
            Stmt::For(f) => vec![&f.body],
            Stmt::Cond {
                then_body,
                else_body,
                ..
            } => {
                let mut out = vec![then_body.as_ref()];
                if let Some(e) = else_body {
                    out.push(e.as_ref());
                }
                out
            }
            _ => vec![],
        }
    }

    /// Visits every statement in the tree, outermost first.
    pub fn visit(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Visits every expression held directly by statements in the tree.
    pub fn visit_exprs(&self, f: &mut impl FnMut(&Expr)) {
        self.visit(&mut |stmt| match stmt {
            Stmt::For(fl) => {
                f(&fl.start);
                f(&fl.stop);
            }
            Stmt::Store(store) => {
                for index in &store.indices {
                    f(index);
                }
                f(&store.value);
            }
            Stmt::Cond { condition, .. } => f(condition),
            _ => {}
        });
    }

    /// Rebuilds the tree with every held expression rewritten bottom-up
    /// through `f`.
    pub fn rewrite_exprs(&self, f: &mut impl FnMut(Expr) -> Expr) -> Stmt {
        match self {
            Stmt::Block(stmts) => {
                Stmt::Block(stmts.iter().map(|s| s.rewrite_exprs(f)).collect())
            }
            Stmt::For(fl) => Stmt::For(Box::new(For {
                var: fl.var.clone(),
                start: fl.start.rewrite(f),
                stop: fl.stop.rewrite(f),
                body: fl.body.rewrite_exprs(f),
                opts: fl.opts.clone(),
            })),
            Stmt::Store(store) => Stmt::Store(Store {
                buf: store.buf.clone(),
                indices: store.indices.iter().map(|i| i.rewrite(f)).collect(),
                value: store.value.rewrite(f),
            }),
            Stmt::Cond {
                condition,
                then_body,
                else_body,
            } => Stmt::Cond {
                condition: condition.rewrite(f),
                then_body: Box::new(then_body.rewrite_exprs(f)),
                else_body: else_body.as_ref().map(|e| Box::new(e.rewrite_exprs(f))),
            },
            Stmt::Allocate(buf) => Stmt::Allocate(buf.clone()),
            Stmt::Free(buf) => Stmt::Free(buf.clone()),
        }
    }

    /// Rebuilds the tree with every buffer reference (stores, loads,
    /// allocations) mapped through `f`.
    pub fn rewrite_bufs(&self, f: &mut impl FnMut(&Buf) -> Buf) -> Stmt {
        let stmt = self.rewrite_exprs(&mut |e| match e {
            Expr::Load { buf, indices } => Expr::Load {
                buf: f(&buf),
                indices,
            },
            other => other,
        });
        stmt.rewrite_stmts(&mut |s| match s {
            Stmt::Store(store) => Stmt::Store(Store {
                buf: f(&store.buf),
                indices: store.indices,
                value: store.value,
            }),
            Stmt::Allocate(buf) => Stmt::Allocate(f(&buf)),
            Stmt::Free(buf) => Stmt::Free(f(&buf)),
            other => other,
        })
    }

    /// Rebuilds the tree bottom-up, applying `f` to every statement after
    /// its children have been rewritten.
    pub fn rewrite_stmts(&self, f: &mut impl FnMut(Stmt) -> Stmt) -> Stmt {
        let rebuilt = match self {
            Stmt::Block(stmts) => {
                Stmt::Block(stmts.iter().map(|s| s.rewrite_stmts(f)).collect())
            }
            Stmt::For(fl) => Stmt::For(Box::new(For {
                var: fl.var.clone(),
                start: fl.start.clone(),
                stop: fl.stop.clone(),
                body: fl.body.rewrite_stmts(f),
                opts: fl.opts.clone(),
            })),
            Stmt::Cond {
                condition,
                then_body,
                else_body,
            } => Stmt::Cond {
                condition: condition.clone(),
                then_body: Box::new(then_body.rewrite_stmts(f)),
                else_body: else_body.as_ref().map(|e| Box::new(e.rewrite_stmts(f))),
            },
            other => other.clone(),
        };
        f(rebuilt)
    }

    /// Substitutes variables by id across the whole tree.
    pub fn substitute(&self, map: &FxHashMap<Var, Expr>) -> Stmt {
        self.rewrite_exprs(&mut |e| match &e {
            Expr::Var(var) => map.get(var).cloned().unwrap_or(e),
            _ => e,
        })
    }

    /// All buffers written by stores in the tree.
    pub fn stored_bufs(&self) -> Vec<Buf> {
        let mut out = Vec::new();
        self.visit(&mut |stmt| {
            if let Stmt::Store(store) = stmt {
                if !out.contains(&store.buf) {
                    out.push(store.buf.clone());
                }
            }
        });
        out
    }

    /// All buffers read by loads in the tree.
    pub fn loaded_bufs(&self) -> Vec<Buf> {
        let mut out = Vec::new();
        self.visit_exprs(&mut |expr| {
            expr.visit(&mut |e| {
                if let Expr::Load { buf, .. } = e {
                    if !out.contains(buf) {
                        out.push(buf.clone());
                    }
                }
            });
        });
        out
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    stmt.fmt_indented(f, indent)?;
                }
                Ok(())
            }
            Stmt::For(fl) => {
                let mut marks = String::new();
                if fl.opts.parallel {
                    marks.push_str(" @parallel");
                }
                if let Some(b) = fl.opts.gpu_block_index {
                    marks.push_str(&format!(" @block{b}"));
                }
                if let Some(t) = fl.opts.gpu_thread_index {
                    marks.push_str(&format!(" @thread{t}"));
                }
                if let Some(lanes) = fl.opts.vector_lanes {
                    marks.push_str(&format!(" @vec{lanes}"));
                }
                writeln!(
                    f,
                    "{pad}for ({} = {}; {} < {}; {}++){marks} {{",
                    fl.var, fl.start, fl.var, fl.stop, fl.var
                )?;
                fl.body.fmt_indented(f, indent + 1)?;
                writeln!(f, "{pad}}}")
            }
            Stmt::Store(store) => {
                write!(f, "{pad}{}[", store.buf.name())?;
                for (i, index) in store.indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{index}")?;
                }
                writeln!(f, "] = {};", store.value)
            }
            Stmt::Cond {
                condition,
                then_body,
                else_body,
            } => {
                writeln!(f, "{pad}if {condition} {{")?;
                then_body.fmt_indented(f, indent + 1)?;
                if let Some(e) = else_body {
                    writeln!(f, "{pad}}} else {{")?;
                    e.fmt_indented(f, indent + 1)?;
                }
                writeln!(f, "{pad}}}")
            }
            Stmt::Allocate(buf) => {
                write!(f, "{pad}alloc {}: {}[", buf.name(), buf.dtype())?;
                for (i, dim) in buf.dims().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{dim}")?;
                }
                writeln!(f, "];")
            }
            Stmt::Free(buf) => writeln!(f, "{pad}free {};", buf.name()),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ScalarType;

    fn sample_loop() -> Stmt {
        let buf = Buf::new("out", vec![Expr::long(8)], ScalarType::Float);
        let src = Buf::new("x", vec![Expr::long(8)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let body = Stmt::store(
            &buf,
            vec![Expr::from(i.clone())],
            Expr::load(&src, vec![Expr::from(i.clone())]) + Expr::from(1.0f32),
        );
        Stmt::loop_over(i, Expr::long(8), body)
    }

    #[test]
    fn test_display() {
        let text = sample_loop().to_string();
        assert!(text.contains("for (i = 0; i < 8; i++) {"));
        assert!(text.contains("out[i] = (x[i] + 1f);"));
    }

    #[test]
    fn test_stored_and_loaded_bufs() {
        let stmt = sample_loop();
        let stored = stmt.stored_bufs();
        let loaded = stmt.loaded_bufs();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name(), "out");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "x");
    }
}
