//! Backend selection and the codegen factory seam.
//!
//! Code generators are looked up by name in a process-wide registry. The
//! bundled `simple_ir_eval` interpreter is always present; `llvm_codegen`,
//! `cuda_codegen`, and `block_codegen` become selectable once a factory is
//! registered for them, which is how "the backend is built into this binary"
//! is expressed here.

pub mod interp;

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::dtype::{Device, ScalarType};
use crate::error::{Error, Result};
use crate::ir::{Buf, Stmt, Var};
use crate::runtime::{CallArg, TensorData};

/// The kernel parameter list: buffers (tensor inputs, outputs, constants)
/// and scalar variables, in call-argument order.
#[derive(Debug, Clone)]
pub enum BufferArg {
    Buf(Buf),
    Var(Var),
}

/// Which code generator a kernel is shaped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cuda,
    Llvm,
    SimpleIrEval,
    Block,
}

impl BackendKind {
    pub fn codegen_name(self) -> &'static str {
        match self {
            BackendKind::Cuda => "cuda_codegen",
            BackendKind::Llvm => "llvm_codegen",
            BackendKind::SimpleIrEval => "simple_ir_eval",
            BackendKind::Block => "block_codegen",
        }
    }
}

/// Picks the backend for a device under the given configuration.
pub fn infer_backend(device: Device, config: &Config) -> Result<BackendKind> {
    match device {
        Device::Cuda(_) => Ok(BackendKind::Cuda),
        Device::Cpu if config.generate_block_code => Ok(BackendKind::Block),
        Device::Cpu => {
            if codegen_registered(BackendKind::Llvm.codegen_name()) && !config.dont_use_llvm {
                return Ok(BackendKind::Llvm);
            }
            if config.must_use_llvm_on_cpu {
                return Err(Error::BackendUnavailable(
                    BackendKind::Llvm.codegen_name().to_string(),
                ));
            }
            Ok(BackendKind::SimpleIrEval)
        }
    }
}

/// Everything a factory needs to build a code generator.
#[derive(Clone)]
pub struct CodeGenSpec {
    pub stmt: Arc<Stmt>,
    pub buffer_args: Vec<BufferArg>,
    pub device: Device,
    pub kernel_name: String,
}

/// A compiled-kernel handle. `call` must be reentrant: the compiled artifact
/// is read-only after construction and concurrent calls each own their
/// argument vector.
pub trait CodeGen: Send + Sync {
    fn call(&self, args: &[CallArg]) -> Result<()>;

    /// Raw fast path: one pointer per buffer argument; scalar arguments are
    /// read through their pointer.
    fn call_raw(&self, args: &[*mut u8]) -> Result<()>;

    fn stmt(&self) -> &Stmt;

    /// Allocates an output tensor. Host allocation by default; device
    /// backends override.
    fn empty_strided(
        &self,
        sizes: &[i64],
        strides: &[i64],
        dtype: ScalarType,
        device: Device,
    ) -> Result<TensorData> {
        Ok(TensorData::empty_strided(sizes, strides, dtype, device))
    }
}

pub type CodeGenFactory = Arc<dyn Fn(CodeGenSpec) -> Result<Box<dyn CodeGen>> + Send + Sync>;

static REGISTRY: Lazy<RwLock<FxHashMap<String, CodeGenFactory>>> = Lazy::new(|| {
    let mut table: FxHashMap<String, CodeGenFactory> = FxHashMap::default();
    table.insert(
        BackendKind::SimpleIrEval.codegen_name().to_string(),
        Arc::new(|spec| Ok(Box::new(interp::SimpleIrEval::new(spec)) as Box<dyn CodeGen>)),
    );
    RwLock::new(table)
});

/// Registers (or replaces) a codegen factory under `name`.
pub fn register_codegen(name: &str, factory: CodeGenFactory) {
    if let Ok(mut table) = REGISTRY.write() {
        table.insert(name.to_string(), factory);
    }
}

pub fn codegen_registered(name: &str) -> bool {
    REGISTRY
        .read()
        .map(|table| table.contains_key(name))
        .unwrap_or(false)
}

/// Resolves a factory and builds the code generator.
pub fn create_codegen(
    name: &str,
    stmt: Arc<Stmt>,
    buffer_args: Vec<BufferArg>,
    device: Device,
    kernel_name: &str,
) -> Result<Box<dyn CodeGen>> {
    let factory = REGISTRY
        .read()
        .ok()
        .and_then(|table| table.get(name).cloned())
        .ok_or_else(|| Error::BackendUnavailable(name.to_string()))?;
    factory(CodeGenSpec {
        stmt,
        buffer_args,
        device,
        kernel_name: kernel_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_prefers_interpreter_without_llvm() {
        let config = Config::default();
        assert_eq!(
            infer_backend(Device::Cpu, &config).unwrap(),
            BackendKind::SimpleIrEval
        );
    }

    #[test]
    fn test_selector_block_flag() {
        let config = Config {
            generate_block_code: true,
            ..Config::default()
        };
        assert_eq!(
            infer_backend(Device::Cpu, &config).unwrap(),
            BackendKind::Block
        );
    }

    #[test]
    fn test_selector_cuda() {
        let config = Config::default();
        assert_eq!(
            infer_backend(Device::Cuda(0), &config).unwrap(),
            BackendKind::Cuda
        );
    }

    #[test]
    fn test_must_use_llvm_errors_when_unregistered() {
        let config = Config {
            must_use_llvm_on_cpu: true,
            ..Config::default()
        };
        assert!(matches!(
            infer_backend(Device::Cpu, &config),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_unknown_codegen_name() {
        let stmt = Arc::new(Stmt::Block(vec![]));
        let result = create_codegen("nonexistent", stmt, vec![], Device::Cpu, "k");
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }
}
