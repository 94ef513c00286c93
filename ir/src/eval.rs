//! Constant evaluation of scalar operations.
//!
//! Shared by the folders (constant folding of `Binary`, `Unary`, `Cast`,
//! `Select`) and by the interpreter, so folded and executed programs agree
//! bit for bit.

use crate::types::{BinaryOp, ConstValue, UnaryOp};

/// Evaluate a unary operation on a constant value.
///
/// Returns `None` when the operation is not defined for the value kind.
pub fn eval_unary_op(op: UnaryOp, v: ConstValue) -> Option<ConstValue> {
    match op {
        UnaryOp::Neg => eval_neg(v),
        UnaryOp::Not => eval_not(v),
        UnaryOp::Sqrt => float_unary(v, f64::sqrt),
        UnaryOp::Sin => float_unary(v, f64::sin),
        UnaryOp::Cos => float_unary(v, f64::cos),
    }
}

/// Evaluate a binary operation on constant values.
///
/// Returns `None` if the operands have mismatched kinds, the operation is
/// not defined for them, or the result is undefined (division by zero,
/// out-of-range shift). Integer arithmetic wraps at 64 bits; narrowing to the
/// operand dtype is the caller's job.
pub fn eval_binary_op(op: BinaryOp, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match op {
        BinaryOp::Add => arith(a, b, i64::wrapping_add, |x, y| x + y),
        BinaryOp::Sub => arith(a, b, i64::wrapping_sub, |x, y| x - y),
        BinaryOp::Mul => arith(a, b, i64::wrapping_mul, |x, y| x * y),
        BinaryOp::Min => arith(a, b, i64::min, f64::min),
        BinaryOp::Max => arith(a, b, i64::max, f64::max),
        BinaryOp::Idiv => eval_idiv(a, b),
        BinaryOp::Mod => eval_mod(a, b),
        BinaryOp::CeilDiv => eval_ceil_div(a, b),
        BinaryOp::Fdiv => eval_fdiv(a, b),
        BinaryOp::Lt => eval_lt(a, b),
        BinaryOp::Le => eval_le(a, b),
        BinaryOp::Eq => eval_eq(a, b).map(ConstValue::Bool),
        BinaryOp::Ne => eval_eq(a, b).map(|eq| ConstValue::Bool(!eq)),
        BinaryOp::And => bitwise(a, b, |x, y| x & y, |x, y| x & y),
        BinaryOp::Or => bitwise(a, b, |x, y| x | y, |x, y| x | y),
        BinaryOp::Xor => bitwise(a, b, |x, y| x ^ y, |x, y| x ^ y),
        BinaryOp::Shl => eval_shift(a, b, i64::wrapping_shl),
        BinaryOp::Shr => eval_shift(a, b, i64::wrapping_shr),
    }
}

/// Round `value` up to the next multiple of `alignment` (which must be positive).
pub fn align_up(value: i64, alignment: i64) -> i64 {
    match value.rem_euclid(alignment) {
        0 => value,
        r => value + (alignment - r),
    }
}

// ============================================================================
// Unary Operations
// ============================================================================

#[inline]
fn eval_neg(v: ConstValue) -> Option<ConstValue> {
    match v {
        ConstValue::Int(x) => Some(ConstValue::Int(x.wrapping_neg())),
        ConstValue::Float(x) => Some(ConstValue::Float(-x)),
        _ => None,
    }
}

#[inline]
fn eval_not(v: ConstValue) -> Option<ConstValue> {
    match v {
        ConstValue::Int(x) => Some(ConstValue::Int(!x)),
        ConstValue::Bool(x) => Some(ConstValue::Bool(!x)),
        _ => None,
    }
}

#[inline]
fn float_unary(v: ConstValue, f: fn(f64) -> f64) -> Option<ConstValue> {
    match v {
        ConstValue::Float(x) => Some(ConstValue::Float(f(x))),
        _ => None,
    }
}

// ============================================================================
// Binary Arithmetic Operations
// ============================================================================

#[inline]
fn arith(a: ConstValue, b: ConstValue, int: fn(i64, i64) -> i64, float: fn(f64, f64) -> f64) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => Some(ConstValue::Int(int(x, y))),
        (ConstValue::Float(x), ConstValue::Float(y)) => Some(ConstValue::Float(float(x, y))),
        _ => None,
    }
}

#[inline]
fn eval_idiv(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) if y != 0 => Some(ConstValue::Int(x.wrapping_div(y))),
        _ => None,
    }
}

#[inline]
fn eval_mod(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) if y != 0 => Some(ConstValue::Int(x.wrapping_rem(y))),
        _ => None,
    }
}

#[inline]
fn eval_ceil_div(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) if y != 0 => {
            let q = x.wrapping_div(y);
            let adjust = x.wrapping_rem(y) != 0 && ((x < 0) == (y < 0));
            Some(ConstValue::Int(if adjust { q + 1 } else { q }))
        }
        _ => None,
    }
}

#[inline]
fn eval_fdiv(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Float(x), ConstValue::Float(y)) => Some(ConstValue::Float(x / y)),
        _ => None,
    }
}

// ============================================================================
// Binary Comparison Operations
// ============================================================================

#[inline]
fn eval_lt(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => Some(ConstValue::Bool(x < y)),
        (ConstValue::Float(x), ConstValue::Float(y)) => Some(ConstValue::Bool(x < y)),
        (ConstValue::Bool(x), ConstValue::Bool(y)) => Some(ConstValue::Bool(!x & y)),
        _ => None,
    }
}

#[inline]
fn eval_le(a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => Some(ConstValue::Bool(x <= y)),
        (ConstValue::Float(x), ConstValue::Float(y)) => Some(ConstValue::Bool(x <= y)),
        (ConstValue::Bool(x), ConstValue::Bool(y)) => Some(ConstValue::Bool(!x | y)),
        _ => None,
    }
}

#[inline]
fn eval_eq(a: ConstValue, b: ConstValue) -> Option<bool> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => Some(x == y),
        (ConstValue::Float(x), ConstValue::Float(y)) => Some(x == y),
        (ConstValue::Bool(x), ConstValue::Bool(y)) => Some(x == y),
        _ => None,
    }
}

// ============================================================================
// Binary Bitwise Operations
// ============================================================================

#[inline]
fn bitwise(a: ConstValue, b: ConstValue, int: fn(i64, i64) -> i64, boolean: fn(bool, bool) -> bool) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) => Some(ConstValue::Int(int(x, y))),
        (ConstValue::Bool(x), ConstValue::Bool(y)) => Some(ConstValue::Bool(boolean(x, y))),
        _ => None,
    }
}

#[inline]
fn eval_shift(a: ConstValue, b: ConstValue, shift: fn(i64, u32) -> i64) -> Option<ConstValue> {
    match (a, b) {
        (ConstValue::Int(x), ConstValue::Int(y)) if (0..64).contains(&y) => Some(ConstValue::Int(shift(x, y as u32))),
        _ => None,
    }
}
