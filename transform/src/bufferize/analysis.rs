//! In-place analysis.
//!
//! Every operand slot that writes a tensor (a destination-passing output, an
//! `insert_slice`/`insert` destination, a loop init) is decided in walk
//! order: in place when no read of an aliasing value can observe the write,
//! out of place (write into a fresh copy) otherwise. In-place decisions merge
//! the operand and its tied result into one equivalence class, so later
//! decisions see the storage they share.

use std::collections::{HashMap, HashSet};

use snafu::ensure;
use tracing::{debug, trace};
use trellis_ir::{DominanceInfo, Module, Op, OpId, StructuredKind, Use, ValueDef, ValueId};

use crate::config::BufferizeConfig;
use crate::error::*;
use crate::shape::slices_match;

// ============================================================================
// Union-find
// ============================================================================

#[derive(Debug, Clone, Default)]
struct UnionFind {
    parent: HashMap<ValueId, ValueId>,
}

impl UnionFind {
    fn find(&self, mut v: ValueId) -> ValueId {
        while let Some(&p) = self.parent.get(&v) {
            if p == v {
                break;
            }
            v = p;
        }
        v
    }

    fn union(&mut self, a: ValueId, b: ValueId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }

    fn same(&self, a: ValueId, b: ValueId) -> bool {
        self.find(a) == self.find(b)
    }
}

// ============================================================================
// State
// ============================================================================

/// Outcome for one tensor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    InPlace,
    OutOfPlace,
}

/// A read that would observe an in-place write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub write: Use,
    pub read: Use,
    /// Aliasing value the read goes through.
    pub value: ValueId,
}

/// Aliasing and in-place decisions for every tensor in a module.
///
/// Built once by [`analyze`] and consumed by the rewrite; it is never
/// updated after the analysis returns.
#[derive(Debug, Clone, Default)]
pub struct AnalysisState {
    aliases: UnionFind,
    equivalences: UnionFind,
    tensors: Vec<ValueId>,
    tensor_set: HashSet<ValueId>,
    read_only: HashSet<ValueId>,
    decisions: HashMap<Use, Decision>,
    conflicts: Vec<Conflict>,
}

impl AnalysisState {
    pub fn decision(&self, u: Use) -> Option<Decision> {
        self.decisions.get(&u).copied()
    }

    pub fn is_in_place(&self, u: Use) -> bool {
        self.decision(u) == Some(Decision::InPlace)
    }

    /// Both values are backed by the same buffer.
    pub fn are_equivalent(&self, a: ValueId, b: ValueId) -> bool {
        self.equivalences.same(a, b)
    }

    /// The buffers of both values may overlap.
    pub fn are_aliasing(&self, a: ValueId, b: ValueId) -> bool {
        self.aliases.same(a, b)
    }

    pub fn is_tensor(&self, v: ValueId) -> bool {
        self.tensor_set.contains(&v)
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn num_in_place(&self) -> usize {
        self.decisions.values().filter(|d| **d == Decision::InPlace).count()
    }

    pub fn num_out_of_place(&self) -> usize {
        self.decisions.values().filter(|d| **d == Decision::OutOfPlace).count()
    }

    /// Every write slot with its decision, in no particular order.
    pub fn decisions(&self) -> impl Iterator<Item = (Use, Decision)> + '_ {
        self.decisions.iter().map(|(u, d)| (*u, *d))
    }

    fn alias_class(&self, v: ValueId) -> Vec<ValueId> {
        let root = self.aliases.find(v);
        self.tensors.iter().copied().filter(|t| self.aliases.find(*t) == root).collect()
    }

    fn union_equivalent(&mut self, a: ValueId, b: ValueId) {
        self.equivalences.union(a, b);
        self.aliases.union(a, b);
    }
}

// ============================================================================
// Op semantics
// ============================================================================

/// Result a write slot is tied to.
pub(crate) fn tied_result(module: &Module, u: Use) -> Option<ValueId> {
    let data = module.op(u.op);
    match &data.op {
        Op::Structured(s) if s.tensor_semantics => {
            let i = u.index.checked_sub(s.num_inputs).filter(|i| *i < s.num_outputs)?;
            data.results.get(i).copied()
        }
        Op::InsertSlice(_) | Op::Insert if u.index == 1 => data.results.first().copied(),
        Op::For if u.index >= 3 => data.results.get(u.index - 3).copied(),
        _ => None,
    }
}

/// Loop-carried block argument for a `scf.for` init slot.
pub(crate) fn iter_arg(module: &Module, u: Use) -> Option<ValueId> {
    let data = module.op(u.op);
    if !matches!(data.op, Op::For) || u.index < 3 {
        return None;
    }
    let body = *data.regions.first()?;
    module.block(body).args.get(u.index - 2).copied()
}

/// The slot reads the contents of its tensor.
fn is_read(module: &Module, u: Use) -> bool {
    let data = module.op(u.op);
    match &data.op {
        Op::Structured(s) => {
            if u.index < s.num_inputs {
                return true;
            }
            u.index < s.num_inputs + s.num_outputs
                && !matches!(
                    s.kind,
                    StructuredKind::Reverse { .. } | StructuredKind::Pack(_) | StructuredKind::UnPack(_)
                )
        }
        Op::InsertSlice(_) => u.index <= 1,
        Op::Insert => u.index == 1,
        Op::Extract => u.index == 0,
        Op::For => u.index >= 3,
        Op::Return | Op::Yield | Op::ToBuffer => true,
        _ => false,
    }
}

/// An out-of-place write has to start from the operand's contents.
pub(crate) fn initializes_result(module: &Module, u: Use) -> bool {
    match &module.op(u.op).op {
        Op::Structured(_) => is_read(module, u),
        Op::InsertSlice(_) | Op::Insert | Op::For => true,
        _ => false,
    }
}

fn is_supported(module: &Module, op: OpId) -> bool {
    let data = module.op(op);
    match &data.op {
        Op::Func { .. }
        | Op::Return
        | Op::Yield
        | Op::DenseConstant(_)
        | Op::Empty
        | Op::AllocTensor
        | Op::ExtractSlice(_)
        | Op::InsertSlice(_)
        | Op::Extract
        | Op::Insert
        | Op::ToTensor
        | Op::ToBuffer
        | Op::Dim { .. }
        | Op::Select
        | Op::For
        | Op::DispatchRegion
        | Op::Structured(_) => true,
        _ => {
            let tensor = |v: &ValueId| module.value_type(*v).is_tensor();
            !data.operands.iter().any(tensor) && !data.results.iter().any(tensor)
        }
    }
}

// ============================================================================
// Conflict detection
// ============================================================================

struct Analyzer<'a> {
    module: &'a Module,
    dominance: DominanceInfo,
    state: AnalysisState,
}

impl Analyzer<'_> {
    /// `value` holds contents produced at or after the write in `w`.
    fn defined_after(&self, value: ValueId, w: OpId, depth: usize) -> Result<bool> {
        let ValueDef::OpResult { op, .. } = self.module.value(value).def else {
            return Ok(false);
        };
        if depth == 0 {
            return Ok(false);
        }
        let data = self.module.op(op);
        match &data.op {
            Op::ExtractSlice(_) => self.defined_after(data.operands[0], w, depth - 1),
            Op::Select => {
                Ok(self.defined_after(data.operands[1], w, depth - 1)?
                    && self.defined_after(data.operands[2], w, depth - 1)?)
            }
            _ => Ok(op == w
                || self.module.is_proper_ancestor(op, w)
                || self.dominance.properly_dominates(self.module, w, op)?),
        }
    }

    /// `value` is defined inside `lp` (or is one of its block arguments).
    fn defined_inside(&self, value: ValueId, lp: OpId) -> bool {
        let Some(block) = self.module.value_block(value) else {
            return false;
        };
        match self.module.block(block).parent {
            Some(owner) => owner == lp || self.module.is_proper_ancestor(lp, owner),
            None => false,
        }
    }

    /// The read completes before the write on every execution.
    fn happens_before(&self, read: Use, write: Use, value: ValueId) -> Result<bool> {
        if !self.dominance.properly_dominates(self.module, read.op, write.op)? {
            return Ok(false);
        }
        // A loop around both runs the read again after the write.
        let carried = self.module.ancestors(write.op).into_iter().any(|lp| {
            matches!(self.module.op(lp).op, Op::For)
                && self.module.is_proper_ancestor(lp, read.op)
                && !self.defined_inside(value, lp)
        });
        Ok(!carried)
    }

    /// `insert_slice(extract_slice(d)[w], d)[w]`: the source only reads the window being overwritten.
    fn is_self_copy(&self, write: Use, read: Use) -> bool {
        if read.op != write.op || read.index != 0 || !matches!(self.module.op(write.op).op, Op::InsertSlice(_)) {
            return false;
        }
        let (source, dest) = (self.module.operands(write.op)[0], self.module.operands(write.op)[1]);
        self.matching_extract(source, dest, write.op)
    }

    /// The write lands in `extract_slice(d)[w]` and the read is the destination of
    /// `insert_slice(.., d)[w]`, which overwrites that window anyway.
    fn is_covered_by_insert(&self, write: Use, read: Use) -> bool {
        if read.index != 1 || !matches!(self.module.op(read.op).op, Op::InsertSlice(_)) {
            return false;
        }
        let written = self.module.operands(write.op)[write.index];
        let dest = self.module.operands(read.op)[1];
        self.matching_extract(written, dest, read.op)
    }

    /// Some value equivalent to `value` is an `extract_slice` of a value
    /// equivalent to `dest` over the same window as `insert`.
    fn matching_extract(&self, value: ValueId, dest: ValueId, insert: OpId) -> bool {
        self.state.tensors.iter().any(|t| {
            if !self.state.are_equivalent(*t, value) {
                return false;
            }
            let Some(extract) = self.module.defining_op(*t) else {
                return false;
            };
            matches!(self.module.op(extract).op, Op::ExtractSlice(_))
                && self.state.are_equivalent(self.module.operands(extract)[0], dest)
                && slices_match(self.module, extract, insert)
        })
    }

    /// Conflicting reads for an in-place write through `write`.
    fn find_conflicts(&self, write: Use) -> Result<Vec<Conflict>> {
        let operand = self.module.operands(write.op)[write.index];
        let mut conflicts = Vec::new();
        for value in self.state.alias_class(operand) {
            for read in self.module.uses(value) {
                if read == write || self.module.op(read.op).parent.is_none() || !is_read(self.module, read) {
                    continue;
                }
                if self.is_self_copy(write, read) || self.is_covered_by_insert(write, read) {
                    continue;
                }
                if self.defined_after(value, write.op, 8)? || self.happens_before(read, write, value)? {
                    continue;
                }
                conflicts.push(Conflict { write, read, value });
            }
        }
        Ok(conflicts)
    }

    fn decide(&mut self, write: Use) -> Result<()> {
        let operand = self.module.operands(write.op)[write.index];
        let Some(result) = tied_result(self.module, write) else {
            return Ok(());
        };
        let read_only = self.state.alias_class(operand).iter().any(|v| self.state.read_only.contains(v));
        let conflicts = if read_only { Vec::new() } else { self.find_conflicts(write)? };

        let decision = if read_only || !conflicts.is_empty() { Decision::OutOfPlace } else { Decision::InPlace };
        for c in &conflicts {
            debug!(write_op = %c.write.op, read_op = %c.read.op, value = %c.value, "read-after-write conflict");
        }
        trace!(op = %write.op, operand = write.index, read_only, decision = %decision, "decided tensor write");
        self.state.conflicts.extend(conflicts);
        self.state.decisions.insert(write, decision);

        let arg = iter_arg(self.module, write);
        match decision {
            Decision::InPlace => {
                self.state.union_equivalent(operand, result);
                if let Some(arg) = arg {
                    self.state.union_equivalent(operand, arg);
                }
            }
            Decision::OutOfPlace => {
                if let Some(arg) = arg {
                    self.state.union_equivalent(arg, result);
                }
            }
        }
        Ok(())
    }

    fn visit(&mut self, op: OpId, config: &BufferizeConfig) -> Result<()> {
        let data = self.module.op(op);
        ensure!(
            is_supported(self.module, op),
            AnalysisSnafu { op, name: data.name(), reason: "op has tensor operands or results" }
        );
        match &data.op {
            Op::Func { .. } if !config.writable_func_args => {
                if let Some(body) = data.regions.first() {
                    self.state.read_only.extend(self.module.block(*body).args.iter().copied());
                }
            }
            Op::DenseConstant(_) | Op::ToTensor => self.state.read_only.extend(data.results.iter().copied()),
            Op::ExtractSlice(_) => self.state.aliases.union(data.operands[0], data.results[0]),
            Op::Select if self.module.value_type(data.results[0]).is_tensor() => {
                self.state.aliases.union(data.operands[1], data.results[0]);
                self.state.aliases.union(data.operands[2], data.results[0]);
            }
            Op::Return => {
                if let Some(parent) = self.module.parent_op(op)
                    && matches!(self.module.op(parent).op, Op::DispatchRegion)
                {
                    let results = self.module.results(parent);
                    for (returned, result) in data.operands.iter().zip(results) {
                        if self.module.value_type(*returned).is_tensor() {
                            self.state.union_equivalent(*returned, *result);
                        }
                    }
                }
            }
            _ => {}
        }

        let writes: Vec<Use> = (0..data.operands.len())
            .map(|index| Use { op, index })
            .filter(|u| self.module.value_type(data.operands[u.index]).is_tensor())
            .filter(|u| tied_result(self.module, *u).is_some())
            .collect();
        for write in writes {
            self.decide(write)?;
        }
        Ok(())
    }
}

/// Decide, for every tensor write in the module, whether it can reuse its operand's buffer.
///
/// Fails when the module contains an op with tensor operands or results the
/// analysis does not model; nothing is decided in that case.
#[tracing::instrument(skip_all)]
pub fn analyze(module: &Module, config: &BufferizeConfig) -> Result<AnalysisState> {
    let ops = module.walk();
    let mut tensors = Vec::new();
    for &op in &ops {
        for region in module.regions(op) {
            tensors.extend(module.block(*region).args.iter().copied());
        }
        tensors.extend(module.results(op).iter().copied());
    }
    tensors.retain(|v| module.value_type(*v).is_tensor());

    let mut analyzer = Analyzer {
        module,
        dominance: DominanceInfo::compute(module),
        state: AnalysisState {
            tensor_set: tensors.iter().copied().collect(),
            tensors,
            ..Default::default()
        },
    };
    for op in ops {
        analyzer.visit(op, config)?;
    }
    let state = analyzer.state;
    debug!(
        in_place = state.num_in_place(),
        out_of_place = state.num_out_of_place(),
        conflicts = state.conflicts.len(),
        "bufferization analysis done"
    );
    Ok(state)
}
