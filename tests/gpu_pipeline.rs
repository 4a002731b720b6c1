//! CUDA and block-accelerator loop shaping, asserted on the post-transform
//! statement through stub codegen factories.

use std::sync::Arc;

use chord::backend::{register_codegen, CodeGen, CodeGenSpec};
use chord::graph::shape::static_dims;
use chord::graph::Graph;
use chord::ir::Stmt;
use chord::prelude::*;
use chord::runtime::CallArg;
use chord::{CompileOptions, Config, Error, FallbackPolicy, FusionKernel};

/// A codegen that generates nothing; kernels built with it exist only for
/// statement introspection.
struct NullCodeGen {
    spec: CodeGenSpec,
}

impl CodeGen for NullCodeGen {
    fn call(&self, _args: &[CallArg]) -> chord::Result<()> {
        Ok(())
    }
    fn call_raw(&self, _args: &[*mut u8]) -> chord::Result<()> {
        Ok(())
    }
    fn stmt(&self) -> &Stmt {
        self.spec.stmt.as_ref()
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    for name in ["cuda_codegen", "block_codegen"] {
        register_codegen(
            name,
            Arc::new(|spec| Ok(Box::new(NullCodeGen { spec }) as Box<dyn CodeGen>)),
        );
    }
}

fn options_with(config: Config) -> CompileOptions {
    CompileOptions {
        config: Some(Config {
            fallback: FallbackPolicy::Disallow,
            ..config
        }),
        ..Default::default()
    }
}

fn tanh_graph(n: i64, device: Device) -> Graph {
    let mut g = Graph::new();
    let x = g.tensor_input("x", &[n], ScalarType::Float, device);
    let y = g.add_op(
        "aten::tanh",
        Some("aten::tanh"),
        &[x],
        "y",
        &static_dims(&[n]),
        ScalarType::Float,
        device,
    );
    g.mark_output(y);
    g
}

#[test]
fn test_cuda_two_level_split_binds_block_and_thread() {
    init();
    let g = tanh_graph(2048, Device::Cuda(0));
    let kernel =
        FusionKernel::compile(&g, "cuda_tanh", options_with(Config::default())).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    // 2048 / 512 grid blocks, 512 threads each; the trip divides evenly so
    // no mask is emitted.
    assert!(text.contains("< 4") && text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("< 512") && text.contains("@thread0"), "got:\n{text}");
    assert!(!text.contains("if "), "got:\n{text}");
    let outer_loops = text.lines().filter(|l| l.starts_with("for (")).count();
    assert_eq!(outer_loops, 1, "one flattened outer loop per output");
}

#[test]
fn test_cuda_masks_ragged_trip_counts() {
    init();
    let g = tanh_graph(1000, Device::Cuda(0));
    let kernel =
        FusionKernel::compile(&g, "cuda_ragged", options_with(Config::default())).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    assert!(text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("@thread0"), "got:\n{text}");
    assert!(text.contains("if "), "1000 % 512 != 0 needs a mask:\n{text}");
}

#[test]
fn test_cuda_three_level_split() {
    init();
    let g = tanh_graph(2048, Device::Cuda(0));
    let config = Config {
        cuda_pointwise_loop_levels: Some(3),
        ..Config::default()
    };
    let kernel = FusionKernel::compile(&g, "cuda_l3", options_with(config)).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    // Grid stride over 1280 * 256, then 256 threads per block; the serial
    // outermost loop stays unbound.
    assert!(text.contains("< 1280") && text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("< 256") && text.contains("@thread0"), "got:\n{text}");
}

#[test]
fn test_cuda_invalid_loop_levels() {
    init();
    let g = tanh_graph(2048, Device::Cuda(0));
    let config = Config {
        cuda_pointwise_loop_levels: Some(4),
        ..Config::default()
    };
    let result = FusionKernel::compile(&g, "cuda_bad", options_with(config));
    assert!(matches!(result, Err(Error::InvalidLoopLevels(4))));
}

#[test]
fn test_cuda_custom_block_size() {
    init();
    let g = tanh_graph(2048, Device::Cuda(0));
    let config = Config {
        cuda_pointwise_block_size: Some(128),
        ..Config::default()
    };
    let kernel = FusionKernel::compile(&g, "cuda_bs", options_with(config)).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    assert!(text.contains("< 16") && text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("< 128") && text.contains("@thread0"), "got:\n{text}");
}

#[test]
fn test_block_codegen_float_block_size() {
    init();
    let g = tanh_graph(64, Device::Cpu);
    let config = Config {
        generate_block_code: true,
        ..Config::default()
    };
    let kernel = FusionKernel::compile(&g, "block_f32", options_with(config)).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    assert!(text.contains("< 4") && text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("< 16") && text.contains("@thread0"), "got:\n{text}");
}

#[test]
fn test_block_codegen_uint8_block_size() {
    init();
    let mut g = Graph::new();
    let x = g.tensor_input("x", &[64], ScalarType::Float, Device::Cpu);
    let y = g.add_op(
        "aten::to",
        Some("aten::to.dtype"),
        &[x],
        "y",
        &static_dims(&[64]),
        ScalarType::Byte,
        Device::Cpu,
    );
    g.mark_output(y);
    let config = Config {
        generate_block_code: true,
        ..Config::default()
    };
    let kernel = FusionKernel::compile(&g, "block_u8", options_with(config)).unwrap();
    let text = kernel.stmt().unwrap().to_string();
    assert!(text.contains("< 2") && text.contains("@block0"), "got:\n{text}");
    assert!(text.contains("< 32") && text.contains("@thread0"), "got:\n{text}");
}
