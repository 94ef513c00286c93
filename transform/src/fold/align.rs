//! `util.align` and `util.sizeof` folders.

use trellis_ir::eval::align_up;
use trellis_ir::{BinaryOp, BlockId, Builder, ConstValue, DType, Module, Op, OpId, ValueId};

use super::FoldResult;
use crate::error::*;

/// How far [`is_aligned_to`] follows producer chains.
const MAX_ALIGNMENT_DEPTH: usize = 8;

/// Whether `value` is provably a multiple of `alignment`.
///
/// Constants are checked directly. Beyond that the proof follows
/// `util.align`, `add`, `sub` and `mul` producers, but only through values
/// with a single use defined in the same block as `value`.
pub fn is_aligned_to(module: &Module, value: ValueId, alignment: ValueId) -> bool {
    match module.value_block(value) {
        Some(block) => aligned(module, value, alignment, block, MAX_ALIGNMENT_DEPTH),
        None => false,
    }
}

fn aligned(module: &Module, value: ValueId, alignment: ValueId, block: BlockId, depth: usize) -> bool {
    if value == alignment {
        return true;
    }
    let align_const = module.constant_int(alignment).filter(|a| *a > 0);
    if let (Some(v), Some(a)) = (module.constant_int(value), align_const) {
        return v % a == 0;
    }
    if depth == 0 {
        return false;
    }
    let Some(def) = module.defining_op(value) else {
        return false;
    };
    let operands = module.operands(def);
    let follow = |v: ValueId| {
        let local = module.value_block(v) == Some(block) && module.has_one_use(v);
        (local || v == alignment || module.constant_int(v).is_some()) && aligned(module, v, alignment, block, depth - 1)
    };
    match module.op(def).op {
        Op::Align => {
            let step = operands[1];
            step == alignment
                || matches!(
                    (module.constant_int(step), align_const),
                    (Some(s), Some(a)) if s > 0 && s % a == 0
                )
        }
        Op::Binary(BinaryOp::Add | BinaryOp::Sub) => follow(operands[0]) && follow(operands[1]),
        Op::Binary(BinaryOp::Mul) => follow(operands[0]) || follow(operands[1]),
        _ => false,
    }
}

/// `align(v, a)` folds to a constant when both are known, and to `v` when
/// `v` is already a multiple of `a`.
pub fn fold_align(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let &[value, alignment] = module.operands(op) else {
        return Ok(FoldResult::NoMatch);
    };
    let Some(dtype) = module.value_type(module.result(op, 0)).as_scalar() else {
        return Ok(FoldResult::NoMatch);
    };
    if let (Some(v), Some(a)) = (module.constant_int(value), module.constant_int(alignment))
        && a > 0
    {
        let c = Builder::before(module, op).constant(ConstValue::Int(align_up(v, a)), dtype)?;
        return Ok(FoldResult::value(c));
    }
    if is_aligned_to(module, value, alignment) {
        return Ok(FoldResult::value(value));
    }
    Ok(FoldResult::NoMatch)
}

pub fn fold_sizeof(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let Op::SizeOf(dtype) = module.op(op).op else {
        return Ok(FoldResult::NoMatch);
    };
    let c = Builder::before(module, op).constant(ConstValue::Int(dtype.bytes() as i64), DType::Index)?;
    Ok(FoldResult::value(c))
}
