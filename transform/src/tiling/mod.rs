//! Tiling engine for structured ops.
//!
//! [`tile`] materializes one tile of an op next to it and reports where the
//! tile's results land in the full results. [`tile_to_loops`] drives it over
//! a loop nest and replaces the op; [`lower_to_loops`] turns a buffer-form op
//! into scalar loops.
//!
//! Every entry point is transactional: on failure the ops it created are
//! erased and the original op is left untouched.

mod loops;

pub use loops::{TiledLoops, lower_all_to_loops, lower_to_loops, tile_to_loops};

use smallvec::SmallVec;
use snafu::ensure;
use tracing::debug;
use trellis_ir::structured::{iteration_domain, loop_iterator_kinds, result_tile_position, tiled_implementation};
use trellis_ir::{Builder, IteratorKind, LoopRange, Module, Op, OpId, SInt, SIntVec, StructuredParts, ValueId};

use crate::error::*;

/// One materialized tile of a structured op.
#[derive(Debug, Clone, Default)]
pub struct TileResult {
    /// Ops created for the tile; the last one is the tiled structured op.
    pub ops: SmallVec<[OpId; 2]>,
    /// Tile of each result; empty with buffer semantics.
    pub values: SmallVec<[ValueId; 2]>,
    /// Offsets of each output's tile within the full output.
    pub result_offsets: Vec<SIntVec>,
    /// Sizes of each output's tile.
    pub result_sizes: Vec<SIntVec>,
}

/// Build the op restricted to `offsets/sizes` of its iteration domain, just before it.
///
/// The original op is not modified. Reduction dimensions must be covered
/// whole: their tile has to match the domain's offset and extent.
#[tracing::instrument(skip_all, fields(op = %op))]
pub fn tile(module: &mut Module, op: OpId, offsets: &[SInt], sizes: &[SInt]) -> Result<TileResult> {
    let kinds = loop_iterator_kinds(module, op)?;
    let rank = kinds.len();
    let actual = if offsets.len() != rank { offsets.len() } else { sizes.len() };
    ensure!(actual == rank, TileRankSnafu { op, expected: rank, actual });

    let mark = module.watermark();
    if kinds.contains(&IteratorKind::Reduction) {
        let domain = iteration_domain(&mut Builder::before(module, op), op);
        let partial = domain.map(|domain| {
            kinds.iter().enumerate().find(|(d, kind)| {
                **kind == IteratorKind::Reduction && !covers(module, &domain[*d], offsets[*d], sizes[*d])
            })
        });
        let partial = partial.map(|found| found.map(|(dim, _)| dim));
        module.rollback(mark);
        if let Some(dim) = partial? {
            return ReductionTilingSnafu { op, dim }.fail();
        }
    }

    match build_tile(module, op, offsets, sizes) {
        Ok(tiled) => {
            debug!(ops = tiled.ops.len(), "materialized tile");
            Ok(tiled)
        }
        Err(e) => {
            module.rollback(mark);
            debug!(error = %e, "tiling failed, rolled back");
            Err(e)
        }
    }
}

/// Whether `offset/size` provably spans the whole of `range`.
fn covers(module: &Module, range: &LoopRange, offset: SInt, size: SInt) -> bool {
    same_extent(module, range.offset, offset) && same_extent(module, range.size, size)
}

fn same_extent(module: &Module, a: SInt, b: SInt) -> bool {
    if a == b {
        return true;
    }
    let resolve = |s: SInt| match s {
        SInt::Const(c) => i64::try_from(c).ok(),
        SInt::Symbolic(v) => module.constant_int(v),
    };
    if let (Some(x), Some(y)) = (resolve(a), resolve(b)) {
        return x == y;
    }
    // Two reads of the same dynamic extent.
    match (a, b) {
        (SInt::Symbolic(x), SInt::Symbolic(y)) => match (module.defining_op(x), module.defining_op(y)) {
            (Some(dx), Some(dy)) => {
                matches!((&module.op(dx).op, &module.op(dy).op), (Op::Dim { index: i }, Op::Dim { index: j }) if i == j)
                    && module.operands(dx) == module.operands(dy)
            }
            _ => false,
        },
        _ => false,
    }
}

fn build_tile(module: &mut Module, op: OpId, offsets: &[SInt], sizes: &[SInt]) -> Result<TileResult> {
    let num_outputs = StructuredParts::of(module, op)?.outputs.len();
    let mut b = Builder::before(module, op);
    let tiled = tiled_implementation(&mut b, op, offsets, sizes)?;
    let mut result = TileResult { ops: tiled.ops, values: tiled.values, ..Default::default() };
    for i in 0..num_outputs {
        let (o, s) = result_tile_position(&mut b, op, i, offsets, sizes)?;
        result.result_offsets.push(o);
        result.result_sizes.push(s);
    }
    Ok(result)
}
