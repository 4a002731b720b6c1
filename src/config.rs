//! Process-wide compiler configuration.
//!
//! All tuning knobs are collected in a [`Config`] that is threaded into the
//! kernel at construction time. The environment is consulted exactly once per
//! process; a kernel keeps the configuration it was compiled with, so flag
//! changes never affect already-compiled kernels.

use once_cell::sync::Lazy;

/// What to do when compilation fails or is undesired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Compilation failures propagate out of `compile`.
    Disallow,
    /// Compilation failures are caught; the kernel delegates to the fallback
    /// interpreter at run time.
    Allow,
    /// Compilation is skipped entirely; every call goes to the interpreter.
    Enforce,
}

/// Compiler flags. `Config::default()` gives the built-in defaults;
/// [`Config::from_env`] layers the process environment on top.
#[derive(Debug, Clone)]
pub struct Config {
    pub fallback: FallbackPolicy,
    /// Emit block-accelerator code for CPU-device kernels.
    pub generate_block_code: bool,
    /// Refuse to fall back to the simple evaluator on CPU.
    pub must_use_llvm_on_cpu: bool,
    /// Skip the LLVM backend even when a factory is registered.
    pub dont_use_llvm: bool,
    /// Enable the conditional-hoisting pass in the loop-nest pipeline.
    pub opt_conditionals: bool,
    /// CUDA pointwise split depth; `None` means the default of 2.
    pub cuda_pointwise_loop_levels: Option<i64>,
    pub cuda_pointwise_block_count: Option<i64>,
    pub cuda_pointwise_block_size: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fallback: FallbackPolicy::Allow,
            generate_block_code: false,
            must_use_llvm_on_cpu: false,
            dont_use_llvm: false,
            opt_conditionals: false,
            cuda_pointwise_loop_levels: None,
            cuda_pointwise_block_count: None,
            cuda_pointwise_block_size: None,
        }
    }
}

static ENV_CONFIG: Lazy<Config> = Lazy::new(|| {
    let mut config = Config::default();
    match std::env::var("PYTORCH_TENSOREXPR_FALLBACK").as_deref() {
        Ok("0") => config.fallback = FallbackPolicy::Disallow,
        Ok("2") => config.fallback = FallbackPolicy::Enforce,
        _ => config.fallback = FallbackPolicy::Allow,
    }
    if std::env::var("PYTORCH_TENSOREXPR_DONT_USE_LLVM").as_deref() == Ok("1") {
        config.dont_use_llvm = true;
    }
    config
});

impl Config {
    /// The process-wide configuration derived from the environment. Read
    /// once and cached.
    pub fn from_env() -> &'static Config {
        &ENV_CONFIG
    }

    /// Effective fallback policy: block codegen is incompatible with the
    /// interpreter, so enforced fallback is downgraded when it is on.
    pub fn effective_fallback(&self) -> FallbackPolicy {
        if self.generate_block_code && self.fallback == FallbackPolicy::Enforce {
            return FallbackPolicy::Allow;
        }
        self.fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_code_overrides_enforced_fallback() {
        let config = Config {
            fallback: FallbackPolicy::Enforce,
            generate_block_code: true,
            ..Config::default()
        };
        assert_eq!(config.effective_fallback(), FallbackPolicy::Allow);

        let config = Config {
            fallback: FallbackPolicy::Enforce,
            ..Config::default()
        };
        assert_eq!(config.effective_fallback(), FallbackPolicy::Enforce);
    }
}
