//! Tensor-to-buffer conversion.
//!
//! The pipeline runs in fixed order on a copy of the module:
//!
//! 1. empty-tensor elimination, then `tensor.empty` → `tensor.alloc`
//! 2. [`analyze`]: in-place decisions for every tensor write
//! 3. rewrite: tensor ops become memref ops, allocations and copies come
//!    from the [`BufferCallbacks`]
//! 4. deallocation of buffers that do not escape their block
//!
//! The module is replaced only when every step succeeds, so a failing
//! analysis or rewrite leaves it exactly as it was.

mod analysis;
mod callbacks;
mod dealloc;
mod empty;
mod rewrite;

pub use analysis::{AnalysisState, Conflict, Decision, analyze};
pub use callbacks::{BufferCallbacks, FnCallbacks, GpuCallbacks, HeapCallbacks};
pub use empty::{eliminate_empty_tensors, empty_to_alloc_tensor};

use tracing::{debug, info};
use trellis_ir::{Module, verify_module};

use crate::config::BufferizeConfig;
use crate::error::*;

/// What [`bufferize`] did.
#[derive(Debug, Clone, Default)]
pub struct BufferizeReport {
    pub analysis: AnalysisState,
    pub eliminated_empties: usize,
    pub allocations: usize,
    pub copies: usize,
    pub deallocations: usize,
}

/// Bufferize every function in `module`.
///
/// With `config.test_analysis_only` the module is left untouched and the
/// report carries the analysis decisions only.
#[tracing::instrument(skip_all)]
pub fn bufferize(
    module: &mut Module,
    config: &BufferizeConfig,
    callbacks: &dyn BufferCallbacks,
) -> Result<BufferizeReport> {
    let mut work = module.clone();
    let eliminated_empties = eliminate_empty_tensors(&mut work)?;
    empty_to_alloc_tensor(&mut work);

    let analysis = analyze(&work, config)?;
    if config.print_conflicts {
        for c in analysis.conflicts() {
            info!(write_op = %c.write.op, write_operand = c.write.index, read_op = %c.read.op, value = %c.value, "conflict");
        }
    }
    if config.test_analysis_only {
        return Ok(BufferizeReport { analysis, eliminated_empties, ..Default::default() });
    }

    let rewritten = rewrite::rewrite(&mut work, &analysis, config, callbacks)?;
    let deallocations = if config.create_deallocs {
        dealloc::place_deallocations(&mut work, &rewritten.allocations, callbacks)?
    } else {
        0
    };
    verify_module(&work)?;

    *module = work;
    debug!(
        allocations = rewritten.allocations.len(),
        copies = rewritten.copies,
        deallocations,
        "bufferized module"
    );
    Ok(BufferizeReport {
        analysis,
        eliminated_empties,
        allocations: rewritten.allocations.len(),
        copies: rewritten.copies,
        deallocations,
    })
}
