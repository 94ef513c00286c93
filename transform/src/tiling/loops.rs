use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::debug;
use trellis_ir::structured::{
    generate_scalar_body, iteration_domain, loop_iterator_kinds, result_tile_position, tiled_implementation,
};
use trellis_ir::{Builder, IrMapping, IteratorKind, LoopRange, Module, OpId, SInt, SIntVec, StructuredParts, ValueId};

use crate::config::TilingConfig;
use crate::error::*;

/// Loop nest produced by [`tile_to_loops`].
#[derive(Debug, Clone, Default)]
pub struct TiledLoops {
    /// `scf.for` ops, outermost first.
    pub loops: Vec<OpId>,
    /// Ops of the tile inside the innermost loop.
    pub tiled_ops: SmallVec<[OpId; 2]>,
    /// Values that replaced the op's results.
    pub replacements: SmallVec<[ValueId; 2]>,
}

struct LoopSpec {
    lower: SInt,
    upper: SInt,
    step: SInt,
}

/// Nest one `scf.for` per entry of `specs` around `body`, threading `inits` through every level.
///
/// `body` receives the induction values (outermost first) and the innermost
/// iteration arguments, and returns the values to yield.
fn build_nest<'m, F>(
    b: &mut Builder<'m>,
    specs: &[LoopSpec],
    inits: &[ValueId],
    ivs: &mut Vec<ValueId>,
    loops: &mut Vec<OpId>,
    body: &mut F,
) -> Result<Vec<ValueId>>
where
    F: FnMut(&mut Builder<'m>, &[ValueId], &[ValueId]) -> Result<Vec<ValueId>>,
{
    let Some((spec, rest)) = specs.split_first() else {
        return body(b, ivs, inits);
    };
    let mut failure = None;
    let op = b.for_loop(spec.lower, spec.upper, spec.step, inits, |b, iv, iters| {
        ivs.push(iv);
        let yielded = build_nest(b, rest, iters, ivs, loops, body);
        ivs.pop();
        match yielded {
            Ok(values) => Ok(values),
            Err(e) => {
                failure = Some(e);
                Ok(iters.to_vec())
            }
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }
    loops.insert(0, op);
    Ok(b.module().results(op).to_vec())
}

/// Extent of the tile starting at `iv`: `min(tile, upper - iv)`, or `tile`
/// when the range is static and divides evenly.
fn tile_extent(b: &mut Builder, range: &LoopRange, upper: SInt, iv: ValueId, tile: usize, fold: bool) -> Result<SInt> {
    if fold && range.offset.as_const().is_some() && range.size.as_const().is_some_and(|n| n % tile == 0) {
        return Ok(SInt::Const(tile));
    }
    let remaining = b.sub(upper, SInt::Symbolic(iv))?;
    Ok(b.min(SInt::Const(tile), remaining)?)
}

// ============================================================================
// Tiling into loops
// ============================================================================

/// Tile `op` by `config.tile_sizes` into an `scf.for` nest and replace it.
///
/// With tensor semantics the loops carry the outputs as iteration arguments
/// and each tile is inserted back with `tensor.insert_slice`; with buffer
/// semantics the tile writes through subviews. Reduction dimensions cannot be
/// tiled. A request that tiles nothing leaves the op in place.
#[tracing::instrument(skip_all, fields(op = %op))]
pub fn tile_to_loops(module: &mut Module, op: OpId, config: &TilingConfig) -> Result<TiledLoops> {
    let parts = StructuredParts::of(module, op)?;
    let kinds = loop_iterator_kinds(module, op)?;
    ensure!(
        config.tile_sizes.len() <= kinds.len(),
        TileRankSnafu { op, expected: kinds.len(), actual: config.tile_sizes.len() }
    );

    let mut tile_sizes: Vec<usize> = (0..kinds.len()).map(|d| config.tile_size(d)).collect();
    for (dim, kind) in kinds.iter().enumerate() {
        if *kind == IteratorKind::Reduction && tile_sizes[dim] != 0 {
            ensure!(config.skip_reductions, ReductionTilingSnafu { op, dim });
            tile_sizes[dim] = 0;
        }
    }
    if tile_sizes.iter().all(|t| *t == 0) {
        debug!("no dimension tiled");
        return Ok(TiledLoops { replacements: parts.results.clone(), ..Default::default() });
    }

    let mark = module.watermark();
    match build_tiled_loops(module, &parts, &tile_sizes, config) {
        Ok(tiled) => {
            module.replace_op_results(op, &tiled.replacements);
            module.erase_op(op);
            debug!(loops = tiled.loops.len(), "tiled into loop nest");
            Ok(tiled)
        }
        Err(e) => {
            module.rollback(mark);
            Err(e)
        }
    }
}

fn build_tiled_loops(
    module: &mut Module,
    p: &StructuredParts,
    tile_sizes: &[usize],
    config: &TilingConfig,
) -> Result<TiledLoops> {
    let op = p.op;
    let mut b = Builder::before(module, op);
    let domain = iteration_domain(&mut b, op)?;

    let mut specs = Vec::new();
    let mut tiled_dims = Vec::new();
    for (dim, (range, &tile)) in domain.iter().zip(tile_sizes).enumerate() {
        if tile == 0 {
            continue;
        }
        if !range.stride.is(1) {
            let step = range.stride.as_const().context(UnsupportedSnafu {
                op,
                name: p.name(),
                what: "tiling a loop with a symbolic step",
            })?;
            ensure!(tile % step == 0, TileStepSnafu { op, dim, size: tile, step });
        }
        let upper = b.add(range.offset, range.size)?;
        specs.push(LoopSpec { lower: range.offset, upper, step: SInt::Const(tile) });
        tiled_dims.push(dim);
    }

    let inits: Vec<ValueId> = if p.tensor_semantics() { p.outputs.to_vec() } else { Vec::new() };
    let mut tiled_ops = SmallVec::new();
    let mut body = |b: &mut Builder, ivs: &[ValueId], iters: &[ValueId]| -> Result<Vec<ValueId>> {
        let mut offsets: SIntVec = domain.iter().map(|r| r.offset).collect();
        let mut sizes: SIntVec = domain.iter().map(|r| r.size).collect();
        for ((&dim, &iv), spec) in tiled_dims.iter().zip(ivs).zip(&specs) {
            offsets[dim] = SInt::Symbolic(iv);
            sizes[dim] = tile_extent(b, &domain[dim], spec.upper, iv, tile_sizes[dim], config.fold_full_tiles)?;
        }

        if !p.tensor_semantics() {
            let tiled = tiled_implementation(b, op, &offsets, &sizes)?;
            tiled_ops.extend(tiled.ops);
            return Ok(Vec::new());
        }

        // Tile a copy whose outputs are the loop-carried destinations.
        let mut mapping = IrMapping::new();
        for (output, iter) in p.outputs.iter().zip(iters) {
            mapping.map(*output, *iter);
        }
        let carried = b.clone_op(op, &mut mapping)?;
        let tiled = tiled_implementation(b, carried, &offsets, &sizes)?;
        let mut yields = Vec::with_capacity(iters.len());
        for (i, dest) in iters.iter().enumerate() {
            let value = tiled.values.get(i).copied().context(UnsupportedSnafu {
                op,
                name: p.name(),
                what: "tiling without a tile per result",
            })?;
            let (ro, rs) = result_tile_position(b, carried, i, &offsets, &sizes)?;
            yields.push(b.insert_slice(value, *dest, &ro, &rs)?);
        }
        b.module_mut().erase_op(carried);
        tiled_ops.extend(tiled.ops);
        Ok(yields)
    };

    let mut loops = Vec::new();
    let replacements = build_nest(&mut b, &specs, &inits, &mut Vec::new(), &mut loops, &mut body)?;
    Ok(TiledLoops { loops, tiled_ops, replacements: replacements.into() })
}

// ============================================================================
// Scalar lowering
// ============================================================================

/// Replace a buffer-form structured op with a loop nest over its iteration
/// domain running the op's scalar body. Returns the loops, outermost first.
#[tracing::instrument(skip_all, fields(op = %op))]
pub fn lower_to_loops(module: &mut Module, op: OpId) -> Result<Vec<OpId>> {
    let p = StructuredParts::of(module, op)?;
    ensure!(!p.tensor_semantics(), UnsupportedSnafu { op, name: p.name(), what: "loop lowering with tensor semantics" });

    let mark = module.watermark();
    match build_scalar_loops(module, op) {
        Ok(loops) => {
            module.erase_op(op);
            debug!(name = p.name(), loops = loops.len(), "lowered to loops");
            Ok(loops)
        }
        Err(e) => {
            module.rollback(mark);
            Err(e)
        }
    }
}

fn build_scalar_loops(module: &mut Module, op: OpId) -> Result<Vec<OpId>> {
    let mut b = Builder::before(module, op);
    let domain = iteration_domain(&mut b, op)?;
    let mut specs = Vec::with_capacity(domain.len());
    for range in &domain {
        let upper = b.add(range.offset, range.size)?;
        specs.push(LoopSpec { lower: range.offset, upper, step: range.stride });
    }
    let mut body = |b: &mut Builder, ivs: &[ValueId], _: &[ValueId]| -> Result<Vec<ValueId>> {
        generate_scalar_body(b, op, ivs)?;
        Ok(Vec::new())
    };
    let mut loops = Vec::new();
    build_nest(&mut b, &specs, &[], &mut Vec::new(), &mut loops, &mut body)?;
    Ok(loops)
}

/// Lower every buffer-form structured op in the module. Returns how many were lowered.
pub fn lower_all_to_loops(module: &mut Module) -> Result<usize> {
    let ops: Vec<OpId> = module
        .walk()
        .into_iter()
        .filter(|op| module.op(*op).op.as_structured().is_some_and(|s| !s.tensor_semantics))
        .collect();
    for op in &ops {
        lower_to_loops(module, *op)?;
    }
    Ok(ops.len())
}
