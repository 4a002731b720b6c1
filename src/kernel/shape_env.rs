//! Mapping from symbolic shape identifiers to length variables.

use rustc_hash::FxHashMap;

use crate::dtype::ScalarType;
use crate::error::{Error, Result};
use crate::graph::shape::SymDim;
use crate::graph::ValueInfo;
use crate::ir::{Expr, Var};

/// Resolves symbolic dimensions to 64-bit length variables. Within one
/// kernel a symbol id maps to exactly one variable.
#[derive(Default)]
pub struct ShapeEnv {
    vars: FxHashMap<i64, Var>,
}

impl ShapeEnv {
    /// Pre-binds a symbol id to an existing variable (the scalar input that
    /// carries the length at run time).
    pub fn bind(&mut self, sym_id: i64, var: Var) {
        self.vars.insert(sym_id, var);
    }

    pub fn var_for_id(&self, sym_id: i64) -> Option<&Var> {
        self.vars.get(&sym_id)
    }

    /// Static entries become immediates; symbolic entries resolve to a
    /// stable variable, created on first use as `ss<|id|>`.
    pub fn var_for_symbol(&mut self, dim: SymDim) -> Expr {
        match dim {
            SymDim::Static(size) => Expr::long(size),
            SymDim::Sym(id) => {
                let var = self
                    .vars
                    .entry(id)
                    .or_insert_with(|| Var::new(format!("ss{}", id.abs()), ScalarType::Long));
                Expr::Var(var.clone())
            }
        }
    }

    /// Dimension expressions for a value's symbolic shape; fails when the
    /// rank is unknown.
    pub fn sizes_from_symbolic_shape(&mut self, info: &ValueInfo) -> Result<Vec<Expr>> {
        let dims = info.sym_sizes.as_ref().ok_or_else(|| {
            Error::MalformedInput(format!("value '{}' has no ranked shape", info.name))
        })?;
        Ok(dims.iter().map(|&d| self.var_for_symbol(d)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_symbol_is_immediate() {
        let mut env = ShapeEnv::default();
        assert_eq!(env.var_for_symbol(SymDim::Static(7)), Expr::long(7));
    }

    #[test]
    fn test_symbol_var_is_stable() {
        let mut env = ShapeEnv::default();
        let a = env.var_for_symbol(SymDim::Sym(-1));
        let b = env.var_for_symbol(SymDim::Sym(-1));
        assert_eq!(a, b);
        let Expr::Var(var) = a else { panic!("expected a variable") };
        assert_eq!(var.name(), "ss1");
        assert_eq!(var.dtype(), ScalarType::Long);
    }

    #[test]
    fn test_bound_symbol_reuses_input_var() {
        let mut env = ShapeEnv::default();
        let input_var = Var::new("vn", ScalarType::Long);
        env.bind(-2, input_var.clone());
        assert_eq!(env.var_for_symbol(SymDim::Sym(-2)), Expr::Var(input_var));
    }
}
