//! Dominance over structured (single-block region) control flow.
//!
//! With one block per region, `a` dominates `b` when `a` sits earlier in a
//! block that (transitively) contains `b`. The snapshot records the module
//! generation it was computed at and refuses to answer once the module has
//! been mutated.

use std::collections::HashMap;

use snafu::ensure;

use crate::error::*;
use crate::module::{BlockId, Module, OpId, ValueDef, ValueId};

#[derive(Debug, Clone)]
pub struct DominanceInfo {
    generation: u64,
    positions: HashMap<OpId, (BlockId, usize)>,
}

impl DominanceInfo {
    pub fn compute(module: &Module) -> Self {
        let mut positions = HashMap::new();
        let mut stack = vec![module.body()];
        while let Some(block) = stack.pop() {
            for (pos, &op) in module.block(block).ops.iter().enumerate() {
                positions.insert(op, (block, pos));
                stack.extend(module.regions(op).iter().copied());
            }
        }
        Self { generation: module.generation(), positions }
    }

    fn check(&self, module: &Module) -> Result<()> {
        ensure!(
            self.generation == module.generation(),
            StaleDominanceSnafu { computed: self.generation, current: module.generation() }
        );
        Ok(())
    }

    /// Ancestor of `op` (or `op` itself) placed directly in `block`, with its position.
    fn ancestor_in(&self, module: &Module, op: OpId, block: BlockId) -> Option<(OpId, usize)> {
        let mut current = op;
        loop {
            let (b, pos) = *self.positions.get(&current)?;
            if b == block {
                return Some((current, pos));
            }
            current = module.block(b).parent?;
        }
    }

    /// `a` properly dominates `b`: it runs before `b` on every path, or encloses it.
    pub fn properly_dominates(&self, module: &Module, a: OpId, b: OpId) -> Result<bool> {
        self.check(module)?;
        if a == b {
            return Ok(false);
        }
        let Some(&(block, pos_a)) = self.positions.get(&a) else {
            return Ok(false);
        };
        Ok(match self.ancestor_in(module, b, block) {
            Some((anc, _)) if anc == a => true,
            Some((_, pos_b)) => pos_a < pos_b,
            None => false,
        })
    }

    /// `value` is available at `user`.
    pub fn value_dominates(&self, module: &Module, value: ValueId, user: OpId) -> Result<bool> {
        self.check(module)?;
        match module.value(value).def {
            ValueDef::BlockArg { block, .. } => Ok(self.ancestor_in(module, user, block).is_some()),
            ValueDef::OpResult { op, .. } => {
                let Some(&(block, pos_def)) = self.positions.get(&op) else {
                    return Ok(false);
                };
                Ok(matches!(self.ancestor_in(module, user, block), Some((anc, pos)) if anc != op && pos_def < pos))
            }
        }
    }
}
