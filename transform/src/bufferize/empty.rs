//! `tensor.empty` elimination ahead of the analysis.
//!
//! An op that fills an empty tensor whose contents end up inserted into a
//! larger destination can write into that destination directly. Replacing
//! the empty tensor with a slice of the destination turns the insertion into
//! a self-copy that the analysis accepts in place.

use tracing::{debug, trace};
use trellis_ir::{Builder, DominanceInfo, Module, Op, OpId, ValueDef, ValueId};

use crate::error::*;
use crate::shape::slice_window;

/// Follow `value` back through single-use tied outputs to a `tensor.empty`.
///
/// Returns the empty op and the op consuming it.
fn trace_to_empty(module: &Module, mut value: ValueId, mut user: OpId) -> Option<(OpId, OpId)> {
    loop {
        if !module.has_one_use(value) {
            return None;
        }
        let ValueDef::OpResult { op, index } = module.value(value).def else {
            return None;
        };
        let data = module.try_op(op).ok()?;
        match &data.op {
            Op::Empty => return Some((op, user)),
            Op::Structured(s) if s.tensor_semantics => {
                value = data.operands[s.num_inputs + index];
                user = op;
            }
            _ => return None,
        }
    }
}

/// Replace empty tensors feeding an `insert_slice` with slices of its destination.
///
/// Only applies when the destination and the slice extents are available
/// where the empty tensor is consumed. Returns the number of replacements.
#[tracing::instrument(skip_all)]
pub fn eliminate_empty_tensors(module: &mut Module) -> Result<usize> {
    let inserts: Vec<OpId> =
        module.walk().into_iter().filter(|op| matches!(module.op(*op).op, Op::InsertSlice(_))).collect();

    let mut eliminated = 0;
    for insert in inserts {
        if !module.is_live(insert) {
            continue;
        }
        let source = module.operands(insert)[0];
        let Some((empty, user)) = trace_to_empty(module, source, insert) else {
            continue;
        };
        let Some((offsets, sizes)) = slice_window(module, insert) else {
            continue;
        };

        let dominance = DominanceInfo::compute(module);
        let needed = module.operands(insert)[1..].to_vec();
        let mut available = true;
        for value in needed {
            available &= dominance.value_dominates(module, value, user)?;
        }
        if !available {
            trace!(insert = %insert, "destination not available at the empty tensor's user");
            continue;
        }

        let empty_value = module.result(empty, 0);
        let dest = module.operands(insert)[1];
        let mark = module.watermark();
        let slice = Builder::before(module, user).extract_slice(dest, &offsets, &sizes)?;
        if module.value_type(slice) != module.value_type(empty_value) {
            module.rollback(mark);
            continue;
        }
        module.replace_all_uses_with(empty_value, slice);
        module.erase_op(empty);
        trace!(empty = %empty, insert = %insert, "replaced empty tensor with destination slice");
        eliminated += 1;
    }
    debug!(eliminated, "eliminated empty tensors");
    Ok(eliminated)
}

/// Turn every remaining `tensor.empty` into `tensor.alloc`. Returns how many changed.
pub fn empty_to_alloc_tensor(module: &mut Module) -> usize {
    let empties: Vec<OpId> =
        module.walk().into_iter().filter(|op| matches!(module.op(*op).op, Op::Empty)).collect();
    for op in &empties {
        module.set_op_kind(*op, Op::AllocTensor);
    }
    empties.len()
}
