//! Grouping ops into `flow.dispatch.region`s.
//!
//! A dispatch region is an op with a single body block terminated by
//! `func.return`. Its results are the returned values; its operands are the
//! dynamic extents of those results, flattened in result order.
//!
//! Regions are not isolated from above: ops moved into a body keep reading
//! values defined outside it.

use itertools::Itertools;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::{debug, trace};
use trellis_ir::{Builder, DominanceInfo, Module, Op, OpId, Type, ValueId};

use crate::error::*;
use crate::shape::reify_dynamic_result_dims;

fn check_region(module: &Module, region: OpId) -> Result<()> {
    ensure!(matches!(module.try_op(region)?.op, Op::DispatchRegion), NotDispatchRegionSnafu { op: region });
    Ok(())
}

fn body(module: &Module, region: OpId) -> Result<trellis_ir::BlockId> {
    module.regions(region).first().copied().context(NotDispatchRegionSnafu { op: region })
}

fn terminator(module: &Module, region: OpId) -> Result<OpId> {
    let block = body(module, region)?;
    Ok(module.terminator(block).context(trellis_ir::error::MissingTerminatorSnafu { block })?)
}

/// Dispatch region without results whose body only returns, at the builder's insertion point.
pub fn make_empty_dispatch_region(b: &mut Builder) -> Result<OpId> {
    let block = b.module_mut().create_block(&[]);
    let region = b.create_with_regions(Op::DispatchRegion, [], [], [block])?;
    b.with_ip(trellis_ir::InsertPoint::End(block), |b| b.return_op(&[]))?;
    trace!(region = %region, "created empty dispatch region");
    Ok(region)
}

/// Make `value` (defined inside the region) an extra result of `region`.
///
/// `dynamic_dims` holds one index value per dynamic extent of `value` and
/// must be available before the region. Since results cannot be added in
/// place, a new region op takes over the body; the old op's results are
/// rewired to it and the old op is erased. Returns the new region op.
pub fn append_dispatch_region_result(
    module: &mut Module,
    region: OpId,
    value: ValueId,
    dynamic_dims: &[ValueId],
) -> Result<OpId> {
    check_region(module, region)?;
    let ty = module.value_type(value).clone();
    let expected = ty.shape().map_or(0, |s| s.iter().filter(|d| d.as_static().is_none()).count());
    ensure!(dynamic_dims.len() == expected, DynamicDimCountSnafu { value, expected, actual: dynamic_dims.len() });

    let block = body(module, region)?;
    let ret = terminator(module, region)?;
    let old_results = module.results(region).to_vec();
    let result_types: Vec<Type> =
        old_results.iter().map(|r| module.value_type(*r).clone()).chain(std::iter::once(ty)).collect();
    let operands: Vec<ValueId> = module.operands(region).iter().copied().chain(dynamic_dims.iter().copied()).collect();

    let replacement = Builder::before(module, region).create(Op::DispatchRegion, operands, result_types)?;
    module.set_region(replacement, 0, block);
    let new_results = module.results(replacement).to_vec();
    module.replace_op_results(region, &new_results);
    module.erase_op(region);

    let returned = module.operands(ret).iter().copied().chain(std::iter::once(value)).collect_vec();
    module.set_operands(ret, returned);
    trace!(old = %region, new = %replacement, value = %value, "appended dispatch region result");
    Ok(replacement)
}

/// Clone `target` to the start of the region body and rewire the uses
/// inside the region to the clone. Uses outside the region still see the
/// original. Returns the clone.
pub fn clone_preceding_op_into_dispatch_region(module: &mut Module, target: OpId, region: OpId) -> Result<OpId> {
    check_region(module, region)?;
    ensure!(!module.op(target).op.is_terminator(), NotPrecedingSnafu { op: target, region });
    let block = body(module, region)?;

    let mut mapping = trellis_ir::IrMapping::new();
    let mut b = Builder::at_end(module, block);
    b.set_start(block);
    let clone = b.clone_op(target, &mut mapping)?;

    let results = module.results(target).to_vec();
    let cloned = module.results(clone).to_vec();
    for (old, new) in results.iter().zip(&cloned) {
        module.replace_uses_if(*old, *new, |m, u| u.op != clone && m.is_proper_ancestor(region, u.op));
    }
    trace!(target = %target, clone = %clone, region = %region, "cloned producer into dispatch region");
    Ok(clone)
}

/// Move `target` to the start of the region body.
///
/// Every result of `target` used outside the region becomes a new region
/// result, and those outside uses are rewired to it. Each such use must be
/// properly dominated by the region in `dominance`, a snapshot taken before
/// this call. Extents of dynamic results are reified before the move, so they
/// stay available to the region op. Returns the (possibly new) region op.
#[tracing::instrument(skip_all, fields(target = %target, region = %region))]
pub fn move_preceding_op_into_dispatch_region(
    module: &mut Module,
    target: OpId,
    region: OpId,
    dominance: &DominanceInfo,
) -> Result<OpId> {
    check_region(module, region)?;
    ensure!(dominance.properly_dominates(module, target, region)?, NotPrecedingSnafu { op: target, region });

    let mut escaping: SmallVec<[ValueId; 2]> = SmallVec::new();
    for result in module.results(target).to_vec() {
        let outside: Vec<OpId> =
            module.users(result).into_iter().filter(|u| *u != region && !module.is_proper_ancestor(region, *u)).collect();
        for user in &outside {
            ensure!(
                dominance.properly_dominates(module, region, *user)?,
                UndominatedUseSnafu { value: result, user: *user, region }
            );
        }
        if !outside.is_empty() {
            escaping.push(result);
        }
    }

    let mut dims = Vec::with_capacity(escaping.len());
    for value in &escaping {
        dims.push(reify_dynamic_result_dims(module, *value)?);
    }

    let block = body(module, region)?;
    module.move_op_to(target, block, 0);

    let mut region = region;
    for (value, dims) in escaping.iter().zip(dims) {
        let index = module.results(region).len();
        region = append_dispatch_region_result(module, region, *value, &dims)?;
        let replacement = module.result(region, index);
        module.replace_uses_if(*value, replacement, |m, u| u.op != region && !m.is_proper_ancestor(region, u.op));
    }
    debug!(escaping = escaping.len(), "moved producer into dispatch region");
    Ok(region)
}

/// Put `op` alone into a new dispatch region placed right after it, and
/// rewire its uses to the region's results. Returns the region.
#[tracing::instrument(skip_all, fields(op = %op))]
pub fn wrap_op_in_dispatch_region(module: &mut Module, op: OpId) -> Result<OpId> {
    let region = {
        let mut b = Builder::after(module, op)?;
        make_empty_dispatch_region(&mut b)?
    };
    let dominance = DominanceInfo::compute(module);
    move_preceding_op_into_dispatch_region(module, op, region, &dominance)
}

/// Producers cheap enough to duplicate into every region that reads them.
fn is_clonable_producer(op: &Op) -> bool {
    matches!(op, Op::Constant(_) | Op::DenseConstant(_) | Op::Empty)
}

/// Wrap every tensor-form structured op outside a dispatch region into its
/// own region, then clone its constant and `tensor.empty` producers into the
/// region. Producers left without uses are erased. Returns the regions.
#[tracing::instrument(skip_all)]
pub fn form_dispatch_regions(module: &mut Module) -> Result<Vec<OpId>> {
    let roots: Vec<OpId> = module
        .walk()
        .into_iter()
        .filter(|op| module.op(*op).op.as_structured().is_some_and(|s| s.tensor_semantics))
        .filter(|op| !module.ancestors(*op).iter().any(|a| matches!(module.op(*a).op, Op::DispatchRegion)))
        .collect();

    let mut regions = Vec::with_capacity(roots.len());
    for root in roots {
        let region = wrap_op_in_dispatch_region(module, root)?;
        let producers: Vec<OpId> = module
            .operands(root)
            .iter()
            .filter_map(|v| module.defining_op(*v))
            .filter(|p| is_clonable_producer(&module.op(*p).op) && !module.is_proper_ancestor(region, *p))
            .unique()
            .collect();
        for producer in producers {
            clone_preceding_op_into_dispatch_region(module, producer, region)?;
            if module.results(producer).iter().all(|r| !module.has_uses(*r)) {
                module.erase_op(producer);
            }
        }
        regions.push(region);
    }
    debug!(regions = regions.len(), "formed dispatch regions");
    Ok(regions)
}
