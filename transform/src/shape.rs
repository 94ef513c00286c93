//! Loop ranges and extent recovery shared by tiling and dispatch grouping.

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::trace;
use trellis_ir::structured::{self, iteration_domain, loop_iterator_kinds};
use trellis_ir::{
    Builder, Dim, IteratorKind, LoopRange, Module, Op, OpId, SInt, SIntVec, SliceAttrs, ValueDef, ValueId,
};

use crate::error::*;

/// Loop ranges an op iterates over, emitted at the builder's insertion point.
///
/// Structured ops report their iteration domain with every reduction loop
/// collapsed to a single iteration. Slices iterate zero-based over the
/// extents of the slice.
pub fn loop_ranges(b: &mut Builder, op: OpId) -> Result<Vec<LoopRange>> {
    let data = b.module().try_op(op)?.clone();
    let name = data.name();
    match data.op {
        Op::InsertSlice(_) => {
            let source = data.operands[0];
            Ok(b.dims(source)?.into_iter().map(LoopRange::zero_based).collect())
        }
        Op::ExtractSlice(attrs) => {
            let (_, sizes) = attrs.mixed(&data.operands[1..]);
            Ok(sizes.into_iter().map(LoopRange::zero_based).collect())
        }
        Op::Structured(_) => {
            let kinds = loop_iterator_kinds(b.module(), op)?;
            let mut ranges = iteration_domain(b, op)?;
            for (range, kind) in ranges.iter_mut().zip(kinds) {
                if kind == IteratorKind::Reduction {
                    range.size = SInt::Const(1);
                }
            }
            Ok(ranges)
        }
        _ => UnsupportedSnafu { op, name, what: "loop ranges" }.fail(),
    }
}

/// Index values holding the dynamic extents of `value`, in dimension order.
///
/// Prefers values that already exist: a tied operand, the size operands of
/// the defining op, or the extents recorded on a dispatch region. Falls back
/// to `shape.dim` ops placed right after the definition (or at the start of
/// the block for block arguments).
pub fn reify_dynamic_result_dims(module: &mut Module, value: ValueId) -> Result<SmallVec<[ValueId; 4]>> {
    let ty = module.value_type(value).clone();
    let shape = ty.shape().context(ReificationSnafu { value, reason: "value is not shaped" })?;
    let dynamic: SmallVec<[usize; 4]> =
        shape.iter().enumerate().filter(|(_, d)| matches!(d, Dim::Dynamic)).map(|(i, _)| i).collect();
    if dynamic.is_empty() {
        return Ok(SmallVec::new());
    }

    let (op, index) = match module.value(value).def {
        ValueDef::BlockArg { block, .. } => {
            let mut b = Builder::at_end(module, block);
            b.set_start(block);
            return dims_of(&mut b, value, &dynamic);
        }
        ValueDef::OpResult { op, index } => (op, index),
    };

    let data = module.try_op(op)?.clone();
    let tied = match &data.op {
        Op::Structured(s) if s.tensor_semantics => Some(structured::tied_output(module, op, index)?),
        Op::InsertSlice(_) | Op::Insert => Some(data.operands[1]),
        _ => None,
    };
    if let Some(tied) = tied
        && module.value_type(tied) == &ty
    {
        trace!(value = %value, tied = %tied, "reifying through tied operand");
        return reify_dynamic_result_dims(module, tied);
    }

    match &data.op {
        Op::Empty | Op::AllocTensor => return Ok(data.operands.iter().copied().collect()),
        Op::DispatchRegion => {
            let start: usize = data.results[..index]
                .iter()
                .map(|r| module.value_type(*r).shape().map_or(0, |s| s.iter().filter(|d| d.as_static().is_none()).count()))
                .sum();
            let dims = data.operands.get(start..start + dynamic.len()).context(ReificationSnafu {
                value,
                reason: "dispatch region records fewer extents than its results need",
            })?;
            return Ok(dims.iter().copied().collect());
        }
        Op::ExtractSlice(attrs) => {
            let (_, sizes) = attrs.mixed(&data.operands[1..]);
            return Ok(sizes.iter().filter_map(SInt::as_symbolic).collect());
        }
        _ => {}
    }

    let mut b = Builder::after(module, op)?;
    dims_of(&mut b, value, &dynamic)
}

fn dims_of(b: &mut Builder, value: ValueId, dynamic: &[usize]) -> Result<SmallVec<[ValueId; 4]>> {
    dynamic
        .iter()
        .map(|d| {
            let extent = b.dim(value, *d)?;
            extent.as_symbolic().context(ReificationSnafu { value, reason: "dynamic extent folded to a constant" })
        })
        .collect()
}

/// Every extent of `value`, static ones as constants.
pub fn reify_result_dims(module: &mut Module, value: ValueId) -> Result<SIntVec> {
    let shape = module.value_type(value).shape().context(ReificationSnafu { value, reason: "value is not shaped" })?;
    let shape: SmallVec<[Dim; 4]> = shape.into();
    let dynamic = reify_dynamic_result_dims(module, value)?;
    ensure!(
        dynamic.len() == shape.iter().filter(|d| d.as_static().is_none()).count(),
        ReificationSnafu { value, reason: "wrong number of dynamic extents" }
    );
    let mut next = dynamic.into_iter();
    Ok(shape
        .iter()
        .map(|d| match d {
            Dim::Static(n) => SInt::Const(*n),
            Dim::Dynamic => next.next().map_or(SInt::Const(0), SInt::Symbolic),
        })
        .collect())
}

// ============================================================================
// Structural equality
// ============================================================================

const MATCH_DEPTH: usize = 8;

/// Two index values compute the same thing: same value, equal constants, or
/// the same pure op applied to matching operands.
pub fn values_match(module: &Module, a: ValueId, b: ValueId) -> bool {
    match_values(module, a, b, MATCH_DEPTH)
}

fn match_values(module: &Module, a: ValueId, b: ValueId, depth: usize) -> bool {
    if a == b {
        return true;
    }
    if depth == 0 || module.value_type(a) != module.value_type(b) || module.value_type(a).as_scalar().is_none() {
        return false;
    }
    if let (Some(x), Some(y)) = (module.constant_value(a), module.constant_value(b)) {
        return x == y;
    }
    let (ValueDef::OpResult { op: da, index: ia }, ValueDef::OpResult { op: db, index: ib }) =
        (module.value(a).def, module.value(b).def)
    else {
        return false;
    };
    let (x, y) = (module.op(da), module.op(db));
    ia == ib
        && x.op == y.op
        && x.op.is_pure()
        && x.regions.is_empty()
        && x.operands.len() == y.operands.len()
        && x.operands.iter().zip(&y.operands).all(|(p, q)| match_values(module, *p, *q, depth - 1))
}

fn mixed_match(module: &Module, a: &[SInt], b: &[SInt]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (SInt::Const(p), SInt::Const(q)) => p == q,
            (SInt::Symbolic(p), SInt::Symbolic(q)) => values_match(module, *p, *q),
            (SInt::Const(c), SInt::Symbolic(v)) | (SInt::Symbolic(v), SInt::Const(c)) => {
                module.constant_int(*v) == Some(*c as i64)
            }
        })
}

/// Offsets and sizes of a slice-like op (extract/insert slice, subview).
pub fn slice_window(module: &Module, op: OpId) -> Option<(SIntVec, SIntVec)> {
    let data = module.op(op);
    let (attrs, dynamic): (&SliceAttrs, &[ValueId]) = match &data.op {
        Op::ExtractSlice(a) | Op::SubView(a) => (a, &data.operands[1..]),
        Op::InsertSlice(a) => (a, &data.operands[2..]),
        _ => return None,
    };
    Some(attrs.mixed(dynamic))
}

/// Both ops address the same window of their sources.
pub fn slices_match(module: &Module, a: OpId, b: OpId) -> bool {
    match (slice_window(module, a), slice_window(module, b)) {
        (Some((oa, sa)), Some((ob, sb))) => mixed_match(module, &oa, &ob) && mixed_match(module, &sa, &sb),
        _ => false,
    }
}
