//! Structural verification of a module.

use snafu::ensure;

use crate::dominance::DominanceInfo;
use crate::error::*;
use crate::module::{Module, OpId};
use crate::op::Op;
use crate::structured;
use crate::ty::Type;

fn fail(module: &Module, op: OpId, reason: impl Into<String>) -> Error {
    Error::VerificationFailed { op, name: module.op(op).name(), reason: reason.into() }
}

fn check(module: &Module, op: OpId, cond: bool, reason: &str) -> Result<()> {
    if cond { Ok(()) } else { Err(fail(module, op, reason)) }
}

/// Verify every op in the module.
#[tracing::instrument(skip_all)]
pub fn verify_module(module: &Module) -> Result<()> {
    let dom = DominanceInfo::compute(module);
    for op in module.walk() {
        verify_op(module, op)?;
        for &operand in module.operands(op) {
            check(module, op, dom.value_dominates(module, operand, op)?, "operand does not dominate its use")?;
        }
    }
    Ok(())
}

fn types_of(module: &Module, values: &[crate::module::ValueId]) -> Vec<Type> {
    values.iter().map(|v| module.value_type(*v).clone()).collect()
}

/// Verify one op in isolation (operand dominance is checked by [`verify_module`]).
pub fn verify_op(module: &Module, op: OpId) -> Result<()> {
    let data = module.try_op(op)?;
    let operands = &data.operands;
    let results = types_of(module, &data.results);
    let scalar = |i: usize| module.value_type(operands[i]).as_scalar();

    for &region in &data.regions {
        ensure!(module.terminator(region).is_some(), MissingTerminatorSnafu { block: region });
    }
    let terminator_operands =
        |i: usize| module.terminator(data.regions[i]).map(|t| types_of(module, module.operands(t))).unwrap_or_default();

    match &data.op {
        Op::Binary(_) => {
            check(module, op, operands.len() == 2, "binary op takes two operands")?;
            check(module, op, scalar(0).is_some() && scalar(0) == scalar(1), "binary operands must share a scalar type")?;
        }
        Op::Select => {
            check(module, op, operands.len() == 3, "select takes three operands")?;
            check(module, op, scalar(0) == Some(trellis_dtype::DType::Bool), "select condition must be i1")?;
            check(
                module,
                op,
                module.value_type(operands[1]).elem() == module.value_type(operands[2]).elem(),
                "select arms must have the same element type",
            )?;
        }
        Op::Load | Op::Extract => {
            let rank = module.value_type(operands[0]).rank().unwrap_or(0);
            check(module, op, operands.len() == rank + 1, "one index per dimension required")?;
        }
        Op::Store | Op::Insert => {
            let rank = module.value_type(operands[1]).rank().unwrap_or(0);
            check(module, op, operands.len() == rank + 2, "one index per dimension required")?;
        }
        Op::ExtractSlice(attrs) | Op::SubView(attrs) => {
            let rank = module.value_type(operands[0]).rank().unwrap_or(0);
            check(module, op, attrs.rank() == rank, "slice rank differs from source rank")?;
            check(module, op, operands.len() == 1 + attrs.num_dynamic(), "wrong number of dynamic slice operands")?;
        }
        Op::InsertSlice(attrs) => {
            let rank = module.value_type(operands[1]).rank().unwrap_or(0);
            check(module, op, attrs.rank() == rank, "slice rank differs from destination rank")?;
            check(module, op, operands.len() == 2 + attrs.num_dynamic(), "wrong number of dynamic slice operands")?;
        }
        Op::Empty | Op::AllocTensor | Op::Alloc { .. } | Op::Alloca => {
            let dynamic = results[0].shape().map_or(0, |s| s.iter().filter(|d| d.is_dynamic()).count());
            check(module, op, operands.len() == dynamic, "one size operand per dynamic dim required")?;
        }
        Op::For => {
            check(module, op, operands.len() >= 3, "for takes lower, upper and step")?;
            check(module, op, (0..3).all(|i| module.value_type(operands[i]).is_index()), "loop bounds must be index")?;
            check(module, op, types_of(module, &operands[3..]) == results, "iter_args and results must match")?;
            check(module, op, terminator_operands(0) == results, "yielded values must match the results")?;
        }
        Op::If => {
            check(module, op, data.regions.len() == 2, "if has then and else regions")?;
            check(module, op, scalar(0) == Some(trellis_dtype::DType::Bool), "if condition must be i1")?;
            for i in 0..2 {
                check(module, op, terminator_operands(i) == results, "branches must yield the results")?;
            }
        }
        Op::Func { results: declared, .. } => {
            check(module, op, data.regions.len() == 1, "func has one body")?;
            check(module, op, &terminator_operands(0) == declared, "returned values must match the signature")?;
        }
        Op::DispatchRegion => {
            check(module, op, data.regions.len() == 1, "dispatch region has one body")?;
            let dynamic: usize = results.iter().map(|t| t.shape().map_or(0, |s| s.iter().filter(|d| d.is_dynamic()).count())).sum();
            check(module, op, operands.len() == dynamic, "one dim operand per dynamic result dim required")?;
            check(module, op, terminator_operands(0) == results, "returned values must match the results")?;
        }
        Op::Structured(_) => structured::verify(module, op)?,
        _ => {}
    }
    Ok(())
}
