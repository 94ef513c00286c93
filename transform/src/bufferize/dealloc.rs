//! Deallocation placement for buffers that die in their allocating block.

use std::collections::HashSet;

use tracing::trace;
use trellis_ir::{Builder, Module, Op, Use, ValueId};

use super::callbacks::BufferCallbacks;
use crate::error::*;

/// The buffer (or a view of it) leaves the block it was allocated in.
fn escapes(module: &Module, alloc: ValueId) -> bool {
    let Some(home) = module.value_block(alloc) else {
        return true;
    };
    let mut seen = HashSet::new();
    let mut worklist = vec![alloc];
    while let Some(value) = worklist.pop() {
        if !seen.insert(value) {
            continue;
        }
        for Use { op, index } in module.uses(value) {
            let data = module.op(op);
            if data.op.is_terminator() && data.parent == Some(home) {
                return true;
            }
            match &data.op {
                Op::SubView(_) | Op::MemRefCast | Op::Select => worklist.extend(data.results.iter().copied()),
                Op::For if index >= 3 => {
                    worklist.push(data.results[index - 3]);
                    if let Some(body) = data.regions.first() {
                        worklist.extend(module.block(*body).args.get(index - 2).copied());
                    }
                }
                Op::Yield | Op::Return => match module.parent_op(op).map(|p| (p, &module.op(p).op)) {
                    Some((p, Op::For | Op::DispatchRegion)) => worklist.push(module.result(p, index)),
                    Some((_, Op::Func { .. })) => return true,
                    _ => {}
                },
                _ => {}
            }
        }
    }
    false
}

/// Free every allocation that does not escape its block, right before the
/// block's terminator. Returns how many deallocations were requested.
pub(crate) fn place_deallocations(
    module: &mut Module,
    allocations: &[ValueId],
    callbacks: &dyn BufferCallbacks,
) -> Result<usize> {
    let mut placed = 0;
    for &alloc in allocations {
        if escapes(module, alloc) {
            trace!(buffer = %alloc, "buffer escapes its block");
            continue;
        }
        let Some(block) = module.value_block(alloc) else {
            continue;
        };
        let mut b = Builder::at_end(module, block);
        b.set_before_terminator(block);
        callbacks.deallocate(&mut b, alloc)?;
        placed += 1;
    }
    Ok(placed)
}
