//! Error types for kernel compilation and execution.

use crate::dtype::Device;

/// Errors produced while compiling or running a fusion kernel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A value's scalar type has no lowering path.
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// The graph is missing information the compiler requires.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Tensor inputs disagree on device.
    #[error("inputs placed on conflicting devices: {0} vs {1}")]
    DeviceMismatch(Device, Device),

    /// The CUDA pointwise loop-levels knob is outside {2, 3}.
    #[error("invalid loop-level: {0}")]
    InvalidLoopLevels(i64),

    /// Random-fill kernels cannot coexist with broadcasting.
    #[error("cannot support broadcast and random within one kernel")]
    RandomWithBroadcast,

    /// A codegen backend was requested but no factory is registered for it.
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),

    /// A loop-nest invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
