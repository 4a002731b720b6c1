//! chord: a just-in-time kernel compiler for fused tensor-operator graphs.
//!
//! A fusion group — a typed dataflow graph selected by an upstream graph
//! optimizer — is lowered into a loop-nest IR, transformed for a target
//! backend, and dispatched at run time:
//!
//! - **graph**: the inbound fusion-group IR (values, nodes, symbolic shapes)
//! - **ir**: the loop-nest IR (buffers, expressions, statements) and its
//!   arithmetic simplifier
//! - **lowering**: the operator lowering tables and the `compute` helper
//! - **loopnest**: structural loop transformations (inline, fuse, flatten,
//!   split, vectorize)
//! - **kernel**: graph binding, the transformation pipeline, argument
//!   packing, and the [`FusionKernel`] facade
//! - **backend**: backend selection, the codegen registry, and the bundled
//!   `simple_ir_eval` interpreter
//! - **runtime**: host tensors, call arguments, and the value stack

pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod ir;
pub mod kernel;
pub mod loopnest;
pub mod lowering;
pub mod runtime;

pub use config::{Config, FallbackPolicy};
pub use dtype::{Device, ScalarType};
pub use error::{Error, Result};
pub use kernel::{CompileOptions, FallbackFn, FusionKernel};

/// Commonly used types and traits.
pub mod prelude {
    pub use crate::backend::{register_codegen, BackendKind, CodeGen};
    pub use crate::config::{Config, FallbackPolicy};
    pub use crate::dtype::{Device, ScalarType};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{shape::SymDim, ConstPayload, Graph, Symbol, ValueType};
    pub use crate::kernel::{CompileOptions, FusionKernel};
    pub use crate::lowering::{ArgValue, LoweringFn, Tensor};
    pub use crate::runtime::{RtValue, Stack, TensorData};
}
