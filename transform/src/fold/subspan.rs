//! Byte-buffer subspan coalescing.
//!
//! A `util.buffer.subspan` is a view `[offset, offset + length)` of its
//! source. Accesses through a view are rewritten to address the source
//! directly, chains of views collapse into one, and a `select` between two
//! views of the same buffer becomes a single view at a selected offset.

use trellis_ir::{Builder, Module, Op, OpId, Type, ValueId};

use super::FoldResult;
use crate::error::*;

/// Operands of a subspan: `(source, source_size, offset, length)`.
fn subspan_of(module: &Module, buffer: ValueId) -> Option<(ValueId, ValueId, ValueId, ValueId)> {
    let def = module.defining_op(buffer)?;
    match (&module.op(def).op, module.operands(def)) {
        (Op::BufferSubspan, &[source, size, offset, length]) => Some((source, size, offset, length)),
        _ => None,
    }
}

/// `offset + delta` as an index value, inserted before `op`.
fn add_offsets(module: &mut Module, op: OpId, offset: ValueId, delta: ValueId) -> Result<ValueId> {
    let mut b = Builder::before(module, op);
    let (x, y) = (b.fold(offset), b.fold(delta));
    let sum = b.add(x, y)?;
    Ok(b.materialize(sum)?)
}

fn same_extent(module: &Module, a: ValueId, b: ValueId) -> bool {
    a == b || matches!((module.constant_int(a), module.constant_int(b)), (Some(x), Some(y)) if x == y)
}

/// `subspan(source, size, 0, size) → source`.
pub fn fold_identity_subspan(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let &[source, size, offset, length] = module.operands(op) else {
        return Ok(FoldResult::NoMatch);
    };
    if module.constant_int(offset) == Some(0) && same_extent(module, size, length) {
        return Ok(FoldResult::value(source));
    }
    Ok(FoldResult::NoMatch)
}

/// `subspan(subspan(s, n, o1, l1), l1, o2, l2) → subspan(s, n, o1 + o2, l2)`.
pub fn fold_subspan_of_subspan(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let &[inner, _, offset, length] = module.operands(op) else {
        return Ok(FoldResult::NoMatch);
    };
    let Some((source, size, inner_offset, _)) = subspan_of(module, inner) else {
        return Ok(FoldResult::NoMatch);
    };
    let offset = add_offsets(module, op, inner_offset, offset)?;
    module.set_operands(op, [source, size, offset, length]);
    Ok(FoldResult::Updated)
}

/// `select(c, subspan(s, n, o1, l), subspan(s, n, o2, l)) → subspan(s, n, select(c, o1, o2), l)`.
pub fn fold_select_of_subspans(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let &[cond, t, f] = module.operands(op) else {
        return Ok(FoldResult::NoMatch);
    };
    if !matches!(module.value_type(t), Type::ByteBuffer) {
        return Ok(FoldResult::NoMatch);
    }
    let (Some((s1, n1, o1, l1)), Some((s2, n2, o2, l2))) = (subspan_of(module, t), subspan_of(module, f)) else {
        return Ok(FoldResult::NoMatch);
    };
    if s1 != s2 || !same_extent(module, n1, n2) || !same_extent(module, l1, l2) {
        return Ok(FoldResult::NoMatch);
    }
    let mut b = Builder::before(module, op);
    let offset = b.select(cond, o1, o2)?;
    let view = b.create1(Op::BufferSubspan, [s1, n1, offset, l1], Type::ByteBuffer)?;
    Ok(FoldResult::value(view))
}

/// Size of a view, slice, fresh allocation or select between buffers.
pub fn fold_buffer_size(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let buffer = module.operands(op)[0];
    let Some(def) = module.defining_op(buffer) else {
        return Ok(FoldResult::NoMatch);
    };
    let operands = module.operands(def);
    let forwarded = match module.op(def).op {
        Op::BufferSubspan | Op::BufferSlice => Some(operands[3]),
        Op::BufferAlloc => Some(operands[0]),
        _ => None,
    };
    if let Some(size) = forwarded {
        return Ok(FoldResult::value(size));
    }
    if !matches!(module.op(def).op, Op::Select) {
        return Ok(FoldResult::NoMatch);
    }
    let [cond, t, f] = [operands[0], operands[1], operands[2]];
    let ty = module.value_type(module.result(op, 0)).clone();
    let mut b = Builder::before(module, op);
    let t = b.create1(Op::BufferSize, [t], ty.clone())?;
    let f = b.create1(Op::BufferSize, [f], ty)?;
    let size = b.select(cond, t, f)?;
    Ok(FoldResult::value(size))
}

/// `(buffer, size, offset)` operand triples of a byte-buffer access.
fn access_triples(op: &Op) -> &'static [[usize; 3]] {
    match op {
        Op::BufferLoad | Op::BufferSlice => &[[0, 1, 2]],
        Op::BufferStore | Op::BufferFill => &[[1, 2, 3]],
        Op::BufferCopy | Op::BufferCompare => &[[0, 1, 2], [3, 4, 5]],
        _ => &[],
    }
}

/// Accesses through a subspan address its source at the summed offset.
pub fn fold_subspan_operands(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let triples = access_triples(&module.op(op).op);
    let mut changed = false;
    for &[buffer, size, offset] in triples {
        let view = module.operands(op)[buffer];
        let Some((source, source_size, view_offset, _)) = subspan_of(module, view) else {
            continue;
        };
        let access_offset = module.operands(op)[offset];
        let summed = add_offsets(module, op, view_offset, access_offset)?;
        module.set_operand(op, buffer, source);
        module.set_operand(op, size, source_size);
        module.set_operand(op, offset, summed);
        changed = true;
    }
    Ok(if changed { FoldResult::Updated } else { FoldResult::NoMatch })
}
