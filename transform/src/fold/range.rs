//! Folders for `util.range.min`, `util.range.max` and `util.range.extents`.

use itertools::Itertools;
use smallvec::{SmallVec, smallvec};
use trellis_ir::{BinaryOp, Builder, ConstValue, DType, Module, Op, OpId, SInt, ValueId};

use super::FoldResult;
use crate::error::*;

/// Constants collapse into one operand, duplicates are dropped, a single
/// survivor replaces the op and two survivors become a binary `min`/`max`.
pub fn fold_range_min_max(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let is_min = match module.op(op).op {
        Op::RangeMin => true,
        Op::RangeMax => false,
        _ => return Ok(FoldResult::NoMatch),
    };
    let operands: SmallVec<[ValueId; 4]> = module.operands(op).iter().copied().collect();
    let Some(dtype) = module.value_type(module.result(op, 0)).as_scalar() else {
        return Ok(FoldResult::NoMatch);
    };
    if let [single] = operands[..] {
        return Ok(FoldResult::value(single));
    }

    let (constants, dynamic): (Vec<ValueId>, Vec<ValueId>) =
        operands.iter().copied().partition(|v| module.constant_int(*v).is_some());
    let pick = |a: i64, b: i64| if is_min { a.min(b) } else { a.max(b) };
    let merged = constants.iter().filter_map(|v| module.constant_int(*v)).reduce(pick);

    let mut survivors: SmallVec<[ValueId; 4]> = dynamic.into_iter().unique().collect();
    match (merged, constants.as_slice()) {
        (Some(_), [only]) => survivors.push(*only),
        (Some(c), _) => survivors.push(Builder::before(module, op).constant(ConstValue::Int(c), dtype)?),
        (None, _) => {}
    }

    match survivors[..] {
        [single] => Ok(FoldResult::value(single)),
        [a, b] => {
            let bin = if is_min { BinaryOp::Min } else { BinaryOp::Max };
            let v = Builder::before(module, op).binary(bin, a, b)?;
            Ok(FoldResult::value(v))
        }
        _ if survivors != operands => {
            module.set_operands(op, survivors.iter().copied());
            Ok(FoldResult::Updated)
        }
        _ => Ok(FoldResult::NoMatch),
    }
}

/// Repeated `(offset, length)` pairs are dropped. Fully constant ranges fold
/// to constants, and one or two ranges are expanded into index arithmetic.
pub fn fold_range_extents(module: &mut Module, op: OpId) -> Result<FoldResult> {
    if !matches!(module.op(op).op, Op::RangeExtents) {
        return Ok(FoldResult::NoMatch);
    }
    let operands = module.operands(op);
    let half = operands.len() / 2;
    if half == 0 {
        return Ok(FoldResult::NoMatch);
    }
    let pairs: Vec<(ValueId, ValueId)> = operands[..half].iter().copied().zip(operands[half..].iter().copied()).collect();
    let Some(dtype) = module.value_type(module.result(op, 0)).as_scalar() else {
        return Ok(FoldResult::NoMatch);
    };

    let unique: Vec<(ValueId, ValueId)> = pairs.iter().copied().unique().collect();
    if unique.len() != pairs.len() {
        let (offsets, lengths): (Vec<_>, Vec<_>) = unique.into_iter().unzip();
        module.set_operands(op, offsets.into_iter().chain(lengths));
        return Ok(FoldResult::Updated);
    }

    let constant: Option<Vec<(i64, i64)>> =
        pairs.iter().map(|(o, l)| Some((module.constant_int(*o)?, module.constant_int(*l)?))).collect();
    if let Some(ranges) = constant {
        let min = ranges.iter().map(|(o, _)| *o).min().unwrap_or_default();
        let ends: Option<Vec<i64>> = ranges.iter().map(|(o, l)| o.checked_add(*l)?.checked_sub(1)).collect();
        // An end past i64 is left to the runtime.
        let Some(ends) = ends else {
            return Ok(FoldResult::NoMatch);
        };
        let max = ends.into_iter().max().unwrap_or(min);
        let mut b = Builder::before(module, op);
        let min = b.constant(ConstValue::Int(min), dtype)?;
        let max = b.constant(ConstValue::Int(max), dtype)?;
        return Ok(FoldResult::Replaced(smallvec![min, max]));
    }

    if dtype != DType::Index {
        return Ok(FoldResult::NoMatch);
    }
    let mut b = Builder::before(module, op);
    match pairs[..] {
        [single] => {
            let max = inclusive_end(&mut b, single)?;
            Ok(FoldResult::Replaced(smallvec![single.0, max]))
        }
        [first, second] => {
            let min = b.binary(BinaryOp::Min, first.0, second.0)?;
            let (e0, e1) = (inclusive_end(&mut b, first)?, inclusive_end(&mut b, second)?);
            let max = b.binary(BinaryOp::Max, e0, e1)?;
            Ok(FoldResult::Replaced(smallvec![min, max]))
        }
        _ => Ok(FoldResult::NoMatch),
    }
}

/// `offset + length - 1` as an index value.
fn inclusive_end(b: &mut Builder, (offset, length): (ValueId, ValueId)) -> Result<ValueId> {
    let past = b.add(SInt::Symbolic(offset), SInt::Symbolic(length))?;
    let past = b.materialize(past)?;
    let one = b.const_index(1)?;
    Ok(b.binary(BinaryOp::Sub, past, one)?)
}
