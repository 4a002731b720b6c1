//! The compiled-kernel facade: construction with a fallback policy,
//! stack-based invocation, and the raw fast path.

mod args;
mod binder;
mod compiler;
mod driver;
mod lowerer;
mod output;
mod shape_env;

use std::sync::Arc;

use log::{debug, warn};

use crate::config::{Config, FallbackPolicy};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::ir::Stmt;
use crate::lowering::CustomLoweringTable;
use crate::runtime::{RtValue, Stack};

use compiler::{CompiledKernel, KernelCompiler};
pub use shape_env::ShapeEnv;

/// The fallback interpreter: invoked with the original value stack when
/// compilation failed or was skipped.
pub type FallbackFn = Arc<dyn Fn(&mut Stack) -> Result<()> + Send + Sync>;

/// Construction-time options for a kernel.
#[derive(Default)]
pub struct CompileOptions {
    /// Per-kernel lowerings, keyed by node kind; consulted before the
    /// standard table.
    pub custom_lowerings: CustomLoweringTable,
    /// Symbol ids carried by the trailing integer inputs, in input order.
    pub symbolic_shape_inputs: Vec<i64>,
    /// Pre-allocate static-shape intermediates. The pre-allocated memory is
    /// shared scratch owned by the kernel, so a kernel compiled with this
    /// flag must not be run reentrantly.
    pub pre_alloc: bool,
    /// Compiler flags; defaults come from the process environment.
    pub config: Option<Config>,
    /// The interpreter to delegate to when the fallback policy applies.
    pub fallback: Option<FallbackFn>,
}

/// A graph compiled into a callable kernel, or a recorded decision to
/// delegate to the fallback interpreter.
pub struct FusionKernel {
    kernel_name: String,
    n_inputs: usize,
    compiled: Option<CompiledKernel>,
    allow_fallback: bool,
    use_fallback: bool,
    fallback: Option<FallbackFn>,
}

impl FusionKernel {
    /// Compiles `graph` under the options' fallback policy: `Disallow`
    /// propagates compile errors, `Allow` records failures and delegates at
    /// run time, `Enforce` skips compilation entirely.
    pub fn compile(graph: &Graph, name: &str, options: CompileOptions) -> Result<FusionKernel> {
        let config = options
            .config
            .unwrap_or_else(|| Config::from_env().clone());
        let policy = config.effective_fallback();
        let n_inputs = graph.inputs().len();
        let build = |config: Config| {
            KernelCompiler::new(
                graph,
                name,
                config,
                options.custom_lowerings,
                options.symbolic_shape_inputs,
                options.pre_alloc,
            )
            .compile()
        };

        match policy {
            FallbackPolicy::Disallow => Ok(FusionKernel {
                kernel_name: name.to_string(),
                n_inputs,
                compiled: Some(build(config)?),
                allow_fallback: false,
                use_fallback: false,
                fallback: options.fallback,
            }),
            FallbackPolicy::Enforce => Ok(FusionKernel {
                kernel_name: name.to_string(),
                n_inputs,
                compiled: None,
                allow_fallback: true,
                use_fallback: true,
                fallback: options.fallback,
            }),
            FallbackPolicy::Allow => match build(config) {
                Ok(compiled) => Ok(FusionKernel {
                    kernel_name: name.to_string(),
                    n_inputs,
                    compiled: Some(compiled),
                    allow_fallback: true,
                    use_fallback: false,
                    fallback: options.fallback,
                }),
                Err(error) => {
                    warn!("compilation of '{name}' failed, will fall back: {error}");
                    Ok(FusionKernel {
                        kernel_name: name.to_string(),
                        n_inputs,
                        compiled: None,
                        allow_fallback: true,
                        use_fallback: true,
                        fallback: options.fallback,
                    })
                }
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.kernel_name
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// True when the kernel delegates every call to the fallback
    /// interpreter.
    pub fn falls_back(&self) -> bool {
        self.use_fallback
    }

    /// The post-transform loop nest, for introspection. `None` when the
    /// kernel fell back before code was generated.
    pub fn stmt(&self) -> Option<&Stmt> {
        self.compiled.as_ref().map(|c| c.stmt.as_ref())
    }

    /// Pops `n_inputs` values off the stack and pushes the outputs in
    /// graph-output order. Run-time failures re-execute through the
    /// fallback interpreter when the policy allows it.
    pub fn run(&self, stack: &mut Stack) -> Result<()> {
        if !self.use_fallback && !self.allow_fallback {
            return self.run_kernel(stack);
        }
        if !self.use_fallback {
            return match self.run_kernel(stack) {
                Ok(()) => Ok(()),
                Err(error) => {
                    debug!(
                        "kernel '{}' failed at run time, falling back: {error}",
                        self.kernel_name
                    );
                    self.run_fallback(stack)
                }
            };
        }
        self.run_fallback(stack)
    }

    /// Raw fast path: one pointer per input and per pre-allocated output;
    /// no stack and no allocation.
    pub fn run_fast(&self, inputs: &[*mut u8], outputs: &[*mut u8]) -> Result<()> {
        let compiled = self.compiled.as_ref().ok_or_else(|| {
            Error::Internal(format!("kernel '{}' was not compiled", self.kernel_name))
        })?;
        let mut raw_args = Vec::with_capacity(
            inputs.len() + outputs.len() + compiled.constants.len(),
        );
        raw_args.extend_from_slice(inputs);
        raw_args.extend_from_slice(outputs);
        for constant in &compiled.constants {
            raw_args.push(constant.ptr());
        }
        compiled.codegen.call_raw(&raw_args)
    }

    fn run_kernel(&self, stack: &mut Stack) -> Result<()> {
        let compiled = self.compiled.as_ref().ok_or_else(|| {
            Error::Internal(format!("kernel '{}' was not compiled", self.kernel_name))
        })?;
        if stack.len() < self.n_inputs {
            return Err(Error::MalformedInput(format!(
                "kernel '{}' expects {} stack inputs, found {}",
                self.kernel_name,
                self.n_inputs,
                stack.len()
            )));
        }
        let first_input = stack.len() - self.n_inputs;
        let (run_args, outputs) = compiled.prepare_run_args(&stack[first_input..])?;
        compiled.codegen.call(&run_args)?;
        stack.truncate(first_input);
        for output in outputs {
            stack.push(RtValue::Tensor(output));
        }
        Ok(())
    }

    fn run_fallback(&self, stack: &mut Stack) -> Result<()> {
        let fallback = self.fallback.as_ref().ok_or_else(|| {
            Error::MalformedInput(format!(
                "kernel '{}' must fall back but no interpreter was provided",
                self.kernel_name
            ))
        })?;
        fallback(stack)
    }
}
