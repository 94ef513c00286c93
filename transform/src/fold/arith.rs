//! Scalar folders: constant evaluation, integer identities, `select` and `dim`.
//!
//! Constant folding goes through `trellis_ir::eval` and narrows to the result
//! dtype exactly as the interpreter does. Identities are applied to integers
//! only; float `x + 0.0` is not `x` for `x = -0.0`.

use trellis_ir::eval::{eval_binary_op, eval_unary_op};
use trellis_ir::{BinaryOp, Builder, ConstValue, DType, Module, Op, OpId, ValueId};

use super::FoldResult;
use crate::error::*;

fn result_dtype(module: &Module, op: OpId) -> Option<DType> {
    module.value_type(module.result(op, 0)).as_scalar()
}

fn constant(module: &mut Module, op: OpId, value: ConstValue, dtype: DType) -> Result<FoldResult> {
    let v = Builder::before(module, op).constant(value, dtype)?;
    Ok(FoldResult::value(v))
}

fn is_const(module: &Module, value: ValueId, n: i64) -> bool {
    module.constant_int(value) == Some(n)
}

pub fn fold_binary(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let Op::Binary(bin) = module.op(op).op else {
        return Ok(FoldResult::NoMatch);
    };
    let (lhs, rhs) = (module.operands(op)[0], module.operands(op)[1]);
    let Some(dtype) = result_dtype(module, op) else {
        return Ok(FoldResult::NoMatch);
    };

    if let (Some(a), Some(b)) = (module.constant_value(lhs), module.constant_value(rhs))
        && let Some(v) = eval_binary_op(bin, a, b)
    {
        return constant(module, op, v, dtype);
    }

    let int = module.value_type(lhs).as_scalar().is_some_and(|dt| dt.is_int());
    if !int {
        return Ok(FoldResult::NoMatch);
    }
    let same = lhs == rhs;
    let folded = match bin {
        BinaryOp::Add if is_const(module, rhs, 0) => Some(lhs),
        BinaryOp::Add if is_const(module, lhs, 0) => Some(rhs),
        BinaryOp::Sub if is_const(module, rhs, 0) => Some(lhs),
        BinaryOp::Mul | BinaryOp::Idiv | BinaryOp::CeilDiv if is_const(module, rhs, 1) => Some(lhs),
        BinaryOp::Mul if is_const(module, lhs, 1) => Some(rhs),
        BinaryOp::Mul if is_const(module, lhs, 0) => Some(lhs),
        BinaryOp::Mul if is_const(module, rhs, 0) => Some(rhs),
        b if b.is_idempotent() && same => Some(lhs),
        _ => None,
    };
    if let Some(v) = folded {
        return Ok(FoldResult::value(v));
    }

    if same {
        let value = match bin {
            BinaryOp::Sub | BinaryOp::Xor => ConstValue::Int(0),
            BinaryOp::Eq | BinaryOp::Le => ConstValue::Bool(true),
            BinaryOp::Ne | BinaryOp::Lt => ConstValue::Bool(false),
            _ => return Ok(FoldResult::NoMatch),
        };
        return constant(module, op, value, dtype);
    }
    Ok(FoldResult::NoMatch)
}

pub fn fold_unary(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let Op::Unary(un) = module.op(op).op else {
        return Ok(FoldResult::NoMatch);
    };
    let x = module.operands(op)[0];
    match (module.constant_value(x), result_dtype(module, op)) {
        (Some(c), Some(dtype)) => match eval_unary_op(un, c) {
            Some(v) => constant(module, op, v, dtype),
            None => Ok(FoldResult::NoMatch),
        },
        _ => Ok(FoldResult::NoMatch),
    }
}

pub fn fold_cast(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let Op::Cast(dtype) = module.op(op).op else {
        return Ok(FoldResult::NoMatch);
    };
    let x = module.operands(op)[0];
    if module.value_type(x).as_scalar() == Some(dtype) {
        return Ok(FoldResult::value(x));
    }
    match module.constant_value(x) {
        Some(c) => constant(module, op, c, dtype),
        None => Ok(FoldResult::NoMatch),
    }
}

/// `select(true, a, b) → a`, `select(c, a, a) → a`.
///
/// Arms whose type differs from the result (memrefs with distinct layouts)
/// are left alone.
pub fn fold_select(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let &[cond, t, f] = module.operands(op) else {
        return Ok(FoldResult::NoMatch);
    };
    let chosen = if t == f {
        Some(t)
    } else {
        module.constant_value(cond).and_then(|c| c.as_bool()).map(|c| if c { t } else { f })
    };
    let result_ty = module.value_type(module.result(op, 0));
    match chosen {
        Some(v) if module.value_type(v) == result_ty => Ok(FoldResult::value(v)),
        _ => Ok(FoldResult::NoMatch),
    }
}

/// Static extents become constants; dynamic extents of a fresh tensor or
/// buffer resolve to the size operand it was created with.
pub fn fold_dim(module: &mut Module, op: OpId) -> Result<FoldResult> {
    let Op::Dim { index } = module.op(op).op else {
        return Ok(FoldResult::NoMatch);
    };
    let source = module.operands(op)[0];
    let Some(shape) = module.value_type(source).shape() else {
        return Ok(FoldResult::NoMatch);
    };
    let Some(dim) = shape.get(index).copied() else {
        return Ok(FoldResult::NoMatch);
    };
    let position = shape[..index].iter().filter(|d| d.is_dynamic()).count();
    if let Some(n) = dim.as_static() {
        let v = Builder::before(module, op).const_index(n)?;
        return Ok(FoldResult::value(v));
    }
    let Some(def) = module.defining_op(source) else {
        return Ok(FoldResult::NoMatch);
    };
    match module.op(def).op {
        Op::Empty | Op::AllocTensor | Op::Alloc { .. } | Op::Alloca => match module.operands(def).get(position) {
            Some(&size) => Ok(FoldResult::value(size)),
            None => Ok(FoldResult::NoMatch),
        },
        _ => Ok(FoldResult::NoMatch),
    }
}
