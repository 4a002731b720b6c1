//! The loop-nest transformation pipeline and its backend policies.

use log::debug;
use rustc_hash::FxHashSet;

use crate::backend::BackendKind;
use crate::dtype::ScalarType;
use crate::error::{Error, Result};
use crate::ir::{Buf, Stmt};
use crate::loopnest::analysis::{has_loop_carried_dependence, has_reduction, trip_count};
use crate::loopnest::LoopNest;
use crate::runtime::RawBuffer;

use super::compiler::{ConstStorage, ConstantEntry, KernelCompiler};

/// Minimum iterations under a parallel loop; below this, thread startup
/// costs dominate the work.
const MIN_GRAIN_SIZE: i64 = 32_768;

const CUDA_DEFAULT_BLOCK_SIZE: i64 = 512;
const CUDA_DEFAULT_BLOCK_COUNT_L3: i64 = 1280;
const CUDA_DEFAULT_BLOCK_SIZE_L3: i64 = 256;
const BLOCK_FP16_BLOCK_SIZE: i64 = 16;
const BLOCK_UINT8_BLOCK_SIZE: i64 = 32;

impl<'a> KernelCompiler<'a> {
    /// Runs the transformation pipeline. Stage order is load-bearing: the
    /// buffer map must be recorded before inlining, conditional optimization
    /// must run after inlining and before fusion, and vectorization runs on
    /// the prepared nest.
    pub(crate) fn transform_loops(
        &mut self,
        backend: BackendKind,
        root: Stmt,
        output_bufs: &[Buf],
    ) -> Result<Stmt> {
        let output_set: FxHashSet<Buf> = output_bufs.iter().cloned().collect();
        let mut nest = LoopNest::new(root, output_set);
        nest.sanitize_names();
        debug!("original stmt:\n{}", nest.root());

        let had_reduction = has_reduction(nest.root());
        let block_buffer_map =
            (backend == BackendKind::Block).then(|| nest.record_buffer_map());

        nest.simplify();
        debug!("after simplify:\n{}", nest.root());

        // Inlining duplicates work across consumers; downstream CSE on CPU
        // and spare compute on GPU absorb it.
        nest.inline_intermediate_bufs(true);
        debug!("after inline:\n{}", nest.root());

        if self.config.opt_conditionals {
            nest.optimize_conditionals();
            debug!("after optimizing conditionals:\n{}", nest.root());
        }

        match backend {
            BackendKind::Llvm => {
                nest.fuse_all_loops();
                debug!("after fuse:\n{}", nest.root());
                self.parallelize_outer_loops(&mut nest, output_bufs);
                debug!("after parallelize:\n{}", nest.root());
            }
            BackendKind::Cuda => self.cuda_shape_loops(&mut nest, output_bufs)?,
            BackendKind::Block => {
                let buffer_map = block_buffer_map.unwrap_or_default();
                self.block_shape_loops(&mut nest, output_bufs, buffer_map)?;
            }
            BackendKind::SimpleIrEval => {}
        }

        let preallocated = if self.pre_alloc {
            self.pre_allocate_interm_bufs(&nest)
        } else {
            FxHashSet::default()
        };
        nest.prepare_for_codegen(&preallocated);
        debug!("after prepare_for_codegen:\n{}", nest.root());

        nest.simplify();
        if backend == BackendKind::Llvm && !had_reduction {
            nest.vectorize_inner_loops();
            debug!("after vectorization:\n{}", nest.root());
        }
        nest.simplify();
        Ok(nest.into_root())
    }

    /// Flattens and parallelizes each output's outer loops, subject to a
    /// minimum grain size below the parallel loop and a cap on thread-level
    /// parallelism across it.
    fn parallelize_outer_loops(&self, nest: &mut LoopNest, output_bufs: &[Buf]) {
        let threads = rayon::current_num_threads() as i64;
        for buf in output_bufs {
            nest.transform_loops_for(buf, |chain| {
                let mut keep = chain.len();
                let mut grain = 1i64;
                for i in (0..chain.len()).rev() {
                    let Some(tc) = trip_count(&chain[i]) else { break };
                    grain *= tc;
                    if grain < MIN_GRAIN_SIZE {
                        keep = i;
                    }
                }
                let mut kept = 0usize;
                let mut trips = 1i64;
                while kept < keep {
                    if trips >= threads {
                        break;
                    }
                    let Some(tc) = trip_count(&chain[kept]) else { break };
                    trips *= tc;
                    kept += 1;
                }
                // No loops survive the pruning; give up.
                if kept == 0 {
                    return None;
                }
                // Reductions and loop-carried dependences disqualify the
                // whole nest.
                if has_reduction(&Stmt::For(Box::new(chain[0].clone()))) {
                    return None;
                }
                if has_loop_carried_dependence(&chain[0]) {
                    return None;
                }
                let mut flat = LoopNest::flatten(chain, kept)?;
                flat.opts.parallel = true;
                Some(Stmt::For(Box::new(flat)))
            });
        }
    }

    /// Flattens each output's loops and splits them into grid and thread
    /// loops per the loop-levels policy.
    fn cuda_shape_loops(&self, nest: &mut LoopNest, output_bufs: &[Buf]) -> Result<()> {
        let loop_levels = self.config.cuda_pointwise_loop_levels.unwrap_or(2);
        if loop_levels != 2 && loop_levels != 3 {
            return Err(Error::InvalidLoopLevels(loop_levels));
        }
        let block_count = self
            .config
            .cuda_pointwise_block_count
            .unwrap_or(CUDA_DEFAULT_BLOCK_COUNT_L3);
        let block_size = self.config.cuda_pointwise_block_size.unwrap_or(match loop_levels {
            2 => CUDA_DEFAULT_BLOCK_SIZE,
            _ => CUDA_DEFAULT_BLOCK_SIZE_L3,
        });

        for buf in output_bufs {
            nest.transform_loops_for(buf, |chain| {
                // 0-dim outputs have no loops to bind.
                let flat = LoopNest::flatten(chain, chain.len())?;
                if loop_levels == 2 {
                    let (mut outer, mut inner) = LoopNest::split_with_mask(&flat, block_size);
                    outer.opts.gpu_block_index = Some(0);
                    inner.opts.gpu_thread_index = Some(0);
                    outer.body = Stmt::For(Box::new(inner));
                    Some(Stmt::For(Box::new(outer)))
                } else {
                    let (mut outer, grid) =
                        LoopNest::split_with_mask(&flat, block_count * block_size);
                    let (mut mid, mut innermost) = LoopNest::split_with_mask(&grid, block_size);
                    mid.opts.gpu_block_index = Some(0);
                    innermost.opts.gpu_thread_index = Some(0);
                    mid.body = Stmt::For(Box::new(innermost));
                    outer.body = Stmt::For(Box::new(mid));
                    Some(Stmt::For(Box::new(outer)))
                }
            });
        }
        Ok(())
    }

    /// Block-accelerator shaping: one flattened loop per output, split by
    /// the dtype-dependent block size, with the recorded buffer map attached
    /// to the block-bound loop.
    fn block_shape_loops(
        &self,
        nest: &mut LoopNest,
        output_bufs: &[Buf],
        buffer_map: rustc_hash::FxHashMap<String, Buf>,
    ) -> Result<()> {
        for buf in output_bufs {
            let block_size = if buf.dtype() == ScalarType::Byte {
                BLOCK_UINT8_BLOCK_SIZE
            } else {
                BLOCK_FP16_BLOCK_SIZE
            };
            let mut shaped = false;
            nest.transform_loops_for(buf, |chain| {
                let flat = LoopNest::flatten(chain, chain.len())?;
                shaped = true;
                let (mut outer, mut inner) = LoopNest::split_with_mask(&flat, block_size);
                outer.opts.gpu_block_index = Some(0);
                outer.opts.buffer_map = Some(buffer_map.clone());
                inner.opts.gpu_thread_index = Some(0);
                outer.body = Stmt::For(Box::new(inner));
                Some(Stmt::For(Box::new(outer)))
            });
            if !shaped {
                return Err(Error::Internal(format!(
                    "no loops found for the buffer {}",
                    buf.name()
                )));
            }
        }
        Ok(())
    }

    /// Allocates raw memory for every static-shape intermediate and
    /// registers it as a kernel constant. Dynamic or unallocatable buffers
    /// stay with run-time allocation.
    fn pre_allocate_interm_bufs(&mut self, nest: &LoopNest) -> FxHashSet<Buf> {
        let mut preallocated = FxHashSet::default();
        for buf in nest.intermediate_bufs() {
            let Some(numel) = buf.static_numel() else {
                continue;
            };
            let size = buf.dtype().size_bytes() * numel.max(1) as usize;
            let Some(memory) = RawBuffer::allocate(size) else {
                continue;
            };
            debug!("pre-allocated {size} bytes for intermediate '{}'", buf.name());
            self.constants.push(ConstantEntry {
                buf: buf.clone(),
                storage: ConstStorage::Raw(memory),
                node: None,
            });
            preallocated.insert(buf);
        }
        preallocated
    }
}
