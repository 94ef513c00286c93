//! Arena-backed module: ops, values and blocks addressed by typed handles.
//!
//! Handles are plain indices, so IR rewrites never fight the borrow checker
//! over parent/child links. Every mutation bumps [`Module::generation`], which
//! lets derived analyses (dominance) detect that they went stale.

use std::fmt;

use smallvec::SmallVec;
use snafu::OptionExt;

use crate::error::*;
use crate::op::Op;
use crate::ty::Type;
use crate::types::ConstValue;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Handle to an operation.
    OpId,
    "op"
);
id_type!(
    /// Handle to an SSA value (op result or block argument).
    ValueId,
    "%"
);
id_type!(
    /// Handle to a block. Every region holds exactly one block.
    BlockId,
    "^bb"
);

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

#[derive(Debug, Clone)]
pub struct OpData {
    pub op: Op,
    pub operands: SmallVec<[ValueId; 4]>,
    pub results: SmallVec<[ValueId; 2]>,
    pub regions: SmallVec<[BlockId; 2]>,
    /// Block the op is attached to, `None` while detached.
    pub parent: Option<BlockId>,
}

impl OpData {
    pub fn result(&self, index: usize) -> ValueId {
        self.results[index]
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub args: SmallVec<[ValueId; 4]>,
    pub ops: Vec<OpId>,
    /// Op owning this block as a region, `None` for the module body and detached blocks.
    pub parent: Option<OpId>,
}

/// An operand slot: operand `index` of `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub op: OpId,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Module {
    ops: Vec<Option<OpData>>,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    body: BlockId,
    generation: u64,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            values: Vec::new(),
            blocks: vec![BlockData::default()],
            body: BlockId(0),
            generation: 0,
        }
    }

    /// Top-level block holding functions.
    pub fn body(&self) -> BlockId {
        self.body
    }

    /// Mutation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Data of a live op.
    ///
    /// # Panics
    ///
    /// Panics if the op has been erased; use [`Module::try_op`] when the handle may be stale.
    pub fn op(&self, id: OpId) -> &OpData {
        match self.ops.get(id.index()).and_then(Option::as_ref) {
            Some(data) => data,
            None => panic!("{id} has been erased"),
        }
    }

    pub fn try_op(&self, id: OpId) -> Result<&OpData> {
        self.ops.get(id.index()).and_then(Option::as_ref).context(ErasedOpSnafu { op: id })
    }

    fn op_mut(&mut self, id: OpId) -> &mut OpData {
        match self.ops.get_mut(id.index()).and_then(Option::as_mut) {
            Some(data) => data,
            None => panic!("{id} has been erased"),
        }
    }

    pub fn is_live(&self, id: OpId) -> bool {
        matches!(self.ops.get(id.index()), Some(Some(_)))
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.index()].ty
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: Type) {
        self.values[id.index()].ty = ty;
        self.touch();
    }

    pub fn block(&self, id: BlockId) -> &BlockData {
        &self.blocks[id.index()]
    }

    pub fn operands(&self, op: OpId) -> &[ValueId] {
        &self.op(op).operands
    }

    pub fn results(&self, op: OpId) -> &[ValueId] {
        &self.op(op).results
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.op(op).results[index]
    }

    pub fn regions(&self, op: OpId) -> &[BlockId] {
        &self.op(op).regions
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } if self.is_live(op) => Some(op),
            _ => None,
        }
    }

    /// Op kind of the value's defining op.
    pub fn defining(&self, value: ValueId) -> Option<&Op> {
        self.defining_op(value).map(|op| &self.op(op).op)
    }

    /// Constant scalar defined by an `arith.constant`.
    pub fn constant_value(&self, value: ValueId) -> Option<ConstValue> {
        self.defining(value).and_then(Op::as_constant)
    }

    pub fn constant_int(&self, value: ValueId) -> Option<i64> {
        self.constant_value(value).and_then(|c| c.as_int())
    }

    /// Block the value is visible in: the block of its defining op, or the block owning the argument.
    pub fn value_block(&self, value: ValueId) -> Option<BlockId> {
        match self.value(value).def {
            ValueDef::OpResult { op, .. } => self.try_op(op).ok().and_then(|d| d.parent),
            ValueDef::BlockArg { block, .. } => Some(block),
        }
    }

    /// Op owning the block the op is attached to.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        self.op(op).parent.and_then(|b| self.block(b).parent)
    }

    /// Chain of enclosing ops, innermost first.
    pub fn ancestors(&self, op: OpId) -> Vec<OpId> {
        let mut chain = Vec::new();
        let mut current = self.parent_op(op);
        while let Some(p) = current {
            chain.push(p);
            current = self.parent_op(p);
        }
        chain
    }

    /// Whether `ancestor` (properly) encloses `op`.
    pub fn is_proper_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        self.ancestors(op).contains(&ancestor)
    }

    /// Position of the op within its block.
    pub fn position(&self, op: OpId) -> Result<(BlockId, usize)> {
        let block = self.op(op).parent.context(DetachedOpSnafu { op })?;
        let pos = self.block(block).ops.iter().position(|o| *o == op).context(DetachedOpSnafu { op })?;
        Ok((block, pos))
    }

    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        self.block(block).ops.last().copied().filter(|op| self.op(*op).op.is_terminator())
    }

    /// All ops nested in `block`, pre-order.
    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<OpId>) {
        for &op in &self.block(block).ops {
            out.push(op);
            for &region in &self.op(op).regions {
                self.walk_into(region, out);
            }
        }
    }

    /// All ops nested inside `op`'s regions, pre-order.
    pub fn walk_nested(&self, op: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        for &region in &self.op(op).regions {
            self.walk_into(region, &mut out);
        }
        out
    }

    /// Every attached op in the module, pre-order.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_block(self.body)
    }

    pub fn funcs(&self) -> impl Iterator<Item = OpId> + '_ {
        self.block(self.body).ops.iter().copied().filter(|op| matches!(self.op(*op).op, Op::Func { .. }))
    }

    pub fn lookup_func(&self, name: &str) -> Option<OpId> {
        self.funcs().find(|op| matches!(&self.op(*op).op, Op::Func { name: n, .. } if n == name))
    }

    // ========================================================================
    // Uses
    // ========================================================================

    /// Operand slots reading `value`, in walk order.
    pub fn uses(&self, value: ValueId) -> Vec<Use> {
        let mut uses = Vec::new();
        for (idx, data) in self.ops.iter().enumerate() {
            let Some(data) = data else { continue };
            for (index, operand) in data.operands.iter().enumerate() {
                if *operand == value {
                    uses.push(Use { op: OpId(idx as u32), index });
                }
            }
        }
        uses
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        self.ops.iter().flatten().any(|d| d.operands.contains(&value))
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.uses(value).len() == 1
    }

    /// Distinct ops reading `value`.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        let mut users: Vec<OpId> = self.uses(value).into_iter().map(|u| u.op).collect();
        users.dedup();
        users
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a detached block with the given argument types.
    pub fn create_block(&mut self, arg_types: &[Type]) -> BlockId {
        let block = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData::default());
        for ty in arg_types {
            self.add_block_arg(block, ty.clone());
        }
        block
    }

    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.index()].args.len();
        let value = self.new_value(ty, ValueDef::BlockArg { block, index });
        self.blocks[block.index()].args.push(value);
        self.touch();
        value
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData { ty, def });
        id
    }

    /// Create a detached op; `regions` become owned by it.
    pub fn create_op(
        &mut self,
        op: Op,
        operands: impl IntoIterator<Item = ValueId>,
        result_types: impl IntoIterator<Item = Type>,
        regions: impl IntoIterator<Item = BlockId>,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty, ValueDef::OpResult { op: id, index }))
            .collect();
        let regions: SmallVec<[BlockId; 2]> = regions.into_iter().collect();
        for region in &regions {
            self.blocks[region.index()].parent = Some(id);
        }
        self.ops.push(Some(OpData { op, operands: operands.into_iter().collect(), results, regions, parent: None }));
        self.touch();
        id
    }

    /// Attach a detached op at `pos` in `block`.
    pub fn insert_op(&mut self, block: BlockId, pos: usize, op: OpId) {
        self.op_mut(op).parent = Some(block);
        self.blocks[block.index()].ops.insert(pos, op);
        self.touch();
    }

    pub fn append_op(&mut self, block: BlockId, op: OpId) {
        let pos = self.block(block).ops.len();
        self.insert_op(block, pos, op);
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn set_op_kind(&mut self, op: OpId, kind: Op) {
        self.op_mut(op).op = kind;
        self.touch();
    }

    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        self.op_mut(op).operands[index] = value;
        self.touch();
    }

    pub fn set_operands(&mut self, op: OpId, operands: impl IntoIterator<Item = ValueId>) {
        self.op_mut(op).operands = operands.into_iter().collect();
        self.touch();
    }

    /// Detach the op from its block, keeping it alive.
    pub fn detach_op(&mut self, op: OpId) {
        if let Some(block) = self.op(op).parent {
            self.blocks[block.index()].ops.retain(|o| *o != op);
            self.op_mut(op).parent = None;
            self.touch();
        }
    }

    /// Erase the op together with everything nested in its regions.
    pub fn erase_op(&mut self, op: OpId) {
        self.detach_op(op);
        let nested = self.walk_nested(op);
        for id in nested.into_iter().chain(std::iter::once(op)) {
            self.ops[id.index()] = None;
        }
        self.touch();
    }

    /// Move an op (attached or not) to `pos` in `block`.
    pub fn move_op_to(&mut self, op: OpId, block: BlockId, pos: usize) {
        self.detach_op(op);
        let pos = pos.min(self.block(block).ops.len());
        self.insert_op(block, pos, op);
    }

    pub fn move_op_before(&mut self, op: OpId, before: OpId) -> Result<()> {
        self.detach_op(op);
        let (block, pos) = self.position(before)?;
        self.insert_op(block, pos, op);
        Ok(())
    }

    pub fn move_op_after(&mut self, op: OpId, after: OpId) -> Result<()> {
        self.detach_op(op);
        let (block, pos) = self.position(after)?;
        self.insert_op(block, pos + 1, op);
        Ok(())
    }

    /// Make `region` the `index`-th region of `op`, taking it from its previous owner.
    pub fn set_region(&mut self, op: OpId, index: usize, region: BlockId) {
        if let Some(prev) = self.block(region).parent
            && self.is_live(prev)
        {
            self.op_mut(prev).regions.retain(|r| *r != region);
        }
        self.blocks[region.index()].parent = Some(op);
        let regions = &mut self.op_mut(op).regions;
        if index < regions.len() {
            regions[index] = region;
        } else {
            regions.push(region);
        }
        self.touch();
    }

    /// Number of ops ever created; ops created later have larger ids.
    pub fn watermark(&self) -> usize {
        self.ops.len()
    }

    /// Erase every op created since `mark` that is still alive.
    ///
    /// Uses of the erased results by older ops are the caller's concern: a
    /// transformation rolling back must not have rewired anything yet.
    pub fn rollback(&mut self, mark: usize) {
        for idx in (mark..self.ops.len()).rev() {
            let id = OpId(idx as u32);
            if self.is_live(id) {
                self.erase_op(id);
            }
        }
    }

    /// Rewire every use of `from` to `to`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) {
        if from == to {
            return;
        }
        for data in self.ops.iter_mut().flatten() {
            for operand in data.operands.iter_mut() {
                if *operand == from {
                    *operand = to;
                }
            }
        }
        self.touch();
    }

    /// Rewire the uses of `from` accepted by `pred`. Returns how many were changed.
    pub fn replace_uses_if(&mut self, from: ValueId, to: ValueId, pred: impl Fn(&Module, Use) -> bool) -> usize {
        let selected: Vec<Use> = self.uses(from).into_iter().filter(|u| pred(self, *u)).collect();
        for u in &selected {
            self.op_mut(u.op).operands[u.index] = to;
        }
        self.touch();
        selected.len()
    }

    /// Rewire uses of the op's results to `values`, pairwise.
    pub fn replace_op_results(&mut self, op: OpId, values: &[ValueId]) {
        let results = self.op(op).results.clone();
        for (from, to) in results.iter().zip(values) {
            self.replace_all_uses_with(*from, *to);
        }
    }
}
