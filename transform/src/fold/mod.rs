//! Local algebraic folders and the canonicalization driver.
//!
//! Each folder looks at one op and either declines, rewrites the op in
//! place, or hands back values that replace its results. [`canonicalize`]
//! sweeps the module until nothing changes, erasing pure ops that lost their
//! users along the way.

pub mod align;
pub mod arith;
pub mod range;
pub mod subspan;

pub use align::is_aligned_to;

use smallvec::SmallVec;
use snafu::ensure;
use tracing::{debug, trace};
use trellis_ir::{Module, Op, OpId, ValueId};

use crate::config::FoldConfig;
use crate::error::*;

/// Outcome of running a folder on one op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldResult {
    /// The folder does not apply.
    NoMatch,
    /// The op was modified in place.
    Updated,
    /// The op's results should be replaced by these values.
    Replaced(SmallVec<[ValueId; 2]>),
}

impl FoldResult {
    pub(crate) fn value(v: ValueId) -> Self {
        FoldResult::Replaced(SmallVec::from_elem(v, 1))
    }
}

pub type Folder = fn(&mut Module, OpId) -> Result<FoldResult>;

fn folders_for(op: &Op) -> &'static [Folder] {
    match op {
        Op::Binary(_) => &[arith::fold_binary],
        Op::Unary(_) => &[arith::fold_unary],
        Op::Cast(_) => &[arith::fold_cast],
        Op::Select => &[arith::fold_select, subspan::fold_select_of_subspans],
        Op::Dim { .. } => &[arith::fold_dim],
        Op::RangeMin | Op::RangeMax => &[range::fold_range_min_max],
        Op::RangeExtents => &[range::fold_range_extents],
        Op::Align => &[align::fold_align],
        Op::SizeOf(_) => &[align::fold_sizeof],
        Op::BufferSubspan => &[subspan::fold_identity_subspan, subspan::fold_subspan_of_subspan],
        Op::BufferSize => &[subspan::fold_buffer_size],
        Op::BufferLoad | Op::BufferStore | Op::BufferFill | Op::BufferCopy | Op::BufferSlice | Op::BufferCompare => {
            &[subspan::fold_subspan_operands]
        }
        _ => &[],
    }
}

/// Run the first applicable folder on `op`, replacing and erasing it if the folder says so.
pub fn fold_op(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let kind = module.try_op(op)?.op.clone();
    for folder in folders_for(&kind) {
        let mark = module.watermark();
        match folder(module, op)? {
            FoldResult::NoMatch => module.rollback(mark),
            FoldResult::Updated => {
                trace!(op = %op, name = kind.name(), "updated in place");
                return Ok(FoldResult::Updated);
            }
            FoldResult::Replaced(values) => {
                trace!(op = %op, name = kind.name(), "folded");
                module.replace_op_results(op, &values);
                module.erase_op(op);
                return Ok(FoldResult::Replaced(values));
            }
        }
    }
    Ok(FoldResult::NoMatch)
}

/// Erase pure ops whose results are all unused. Returns how many were erased.
pub fn eliminate_dead_ops(module: &mut Module) -> usize {
    let mut erased = 0;
    for op in module.walk().into_iter().rev() {
        if !module.is_live(op) {
            continue;
        }
        let data = module.op(op);
        if data.op.is_pure() && data.results.iter().all(|r| !module.has_uses(*r)) {
            module.erase_op(op);
            erased += 1;
        }
    }
    erased
}

/// What [`canonicalize`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    /// Sweeps over the module, including the final one that changed nothing.
    pub iterations: usize,
    pub rewrites: usize,
    pub erased: usize,
    pub converged: bool,
}

/// Apply every folder and dead-op elimination until the module stops changing.
///
/// Stops after `config.max_iterations` sweeps; with `config.strict` that is
/// an error, otherwise the stats report `converged: false`.
#[tracing::instrument(skip_all)]
pub fn canonicalize(module: &mut Module, config: &FoldConfig) -> Result<FoldStats> {
    let mut stats = FoldStats::default();
    while stats.iterations < config.max_iterations {
        stats.iterations += 1;
        let mut changed = 0;
        for op in module.walk() {
            if module.is_live(op) && fold_op(module, op)? != FoldResult::NoMatch {
                changed += 1;
            }
        }
        let erased = eliminate_dead_ops(module);
        stats.rewrites += changed;
        stats.erased += erased;
        if changed == 0 && erased == 0 {
            stats.converged = true;
            break;
        }
    }
    ensure!(stats.converged || !config.strict, NoFixedPointSnafu { iterations: stats.iterations });
    debug!(iterations = stats.iterations, rewrites = stats.rewrites, erased = stats.erased, "canonicalized");
    Ok(stats)
}
