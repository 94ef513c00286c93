//! Structured operations with a uniform tiling and lowering interface.
//!
//! Every structured op has the operand layout `[inputs..., outputs...,
//! extras...]`. With tensor semantics each output is tied to the result of
//! the same index; with buffer semantics the outputs are memrefs written in
//! place and there are no results. Ops with a combinator carry it as a single
//! payload region terminated by `scf.yield`.
//!
//! The capability set (verification, iteration domain, iterator kinds,
//! scalar lowering, tiling, result tile positions, shape reification) is
//! dispatched over the closed [`StructuredKind`] enum.

mod fft;
mod pack;
mod reverse;
mod scan;
mod scatter;
mod sort;
mod topk;

pub use pack::{PackAttrs, packed_type};

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::trace;
use trellis_dtype::DType;

use crate::builder::{Builder, InsertPoint, IrMapping};
use crate::error::*;
use crate::module::{BlockId, Module, OpId, ValueId};
use crate::op::Op;
use crate::sint::{LoopRange, SInt, SIntVec};
use crate::ty::{Shape, Type};
use crate::types::IteratorKind;

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOp {
    pub kind: StructuredKind,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Outputs are tensors and results mirror them; otherwise outputs are memrefs.
    pub tensor_semantics: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredKind {
    /// Inputs `[updates, indices]`, output `[original]`; payload `(update, original) -> value`.
    Scatter { dimension_map: SmallVec<[usize; 4]>, unique_indices: bool },
    /// Outputs only, sorted in place along `dimension`; payload `(a0, b0, a1, b1, ...) -> i1`.
    Sort { dimension: usize },
    /// Inputs `[stage]` or `[stage, real_coeff, imag_coeff]`, outputs `[real, imag]`.
    Fft,
    /// Input `[input]`, outputs `[output, accumulator]`; payload `(prev, x) -> value`.
    Scan { dimension: usize, inclusive: bool },
    /// Input `[input]`, output `[output]`.
    Reverse { dimensions: SmallVec<[usize; 4]> },
    /// Inputs `[values]` or `[values, indices]`, outputs `[values, indices]`; payload `(a, b) -> i1`.
    TopK { dimension: usize },
    /// Input `[source]`, output `[dest]`, extras `[padding?, dynamic tiles...]`.
    Pack(PackAttrs),
    /// Input `[source]`, output `[dest]`, extras `[dynamic tiles...]`.
    UnPack(PackAttrs),
}

impl StructuredKind {
    pub fn name(&self) -> &'static str {
        match self {
            StructuredKind::Scatter { .. } => "linalg_ext.scatter",
            StructuredKind::Sort { .. } => "linalg_ext.sort",
            StructuredKind::Fft => "linalg_ext.fft",
            StructuredKind::Scan { .. } => "linalg_ext.scan",
            StructuredKind::Reverse { .. } => "linalg_ext.reverse",
            StructuredKind::TopK { .. } => "linalg_ext.topk",
            StructuredKind::Pack(_) => "linalg_ext.pack",
            StructuredKind::UnPack(_) => "linalg_ext.unpack",
        }
    }
}

/// Operands and attributes of a structured op, split by role.
#[derive(Debug, Clone)]
pub struct StructuredParts {
    pub op: OpId,
    pub attrs: StructuredOp,
    pub inputs: SmallVec<[ValueId; 4]>,
    pub outputs: SmallVec<[ValueId; 4]>,
    pub extras: SmallVec<[ValueId; 4]>,
    pub payload: Option<BlockId>,
    pub results: SmallVec<[ValueId; 2]>,
}

impl StructuredParts {
    pub fn of(module: &Module, op: OpId) -> Result<Self> {
        let data = module.try_op(op)?;
        let attrs = data.op.as_structured().context(NotStructuredSnafu { op, name: data.name() })?.clone();
        let (n_in, n_out) = (attrs.num_inputs, attrs.num_outputs);
        ensure!(
            data.operands.len() >= n_in + n_out,
            VerificationFailedSnafu { op, name: attrs.kind.name(), reason: "fewer operands than inputs and outputs" }
        );
        Ok(Self {
            op,
            inputs: data.operands[..n_in].into(),
            outputs: data.operands[n_in..n_in + n_out].into(),
            extras: data.operands[n_in + n_out..].into(),
            payload: data.regions.first().copied(),
            results: data.results.clone(),
            attrs,
        })
    }

    pub fn name(&self) -> &'static str {
        self.attrs.kind.name()
    }

    pub fn kind(&self) -> &StructuredKind {
        &self.attrs.kind
    }

    pub fn tensor_semantics(&self) -> bool {
        self.attrs.tensor_semantics
    }

    pub(crate) fn error(&self, reason: impl Into<String>) -> Error {
        Error::VerificationFailed { op: self.op, name: self.name(), reason: reason.into() }
    }

    pub(crate) fn check(&self, cond: bool, reason: &str) -> Result<()> {
        if cond { Ok(()) } else { Err(self.error(reason)) }
    }

    fn payload_block(&self) -> Result<BlockId> {
        self.payload.ok_or_else(|| self.error("missing payload region"))
    }
}

/// Ops and values produced by tiling one structured op.
#[derive(Debug, Clone, Default)]
pub struct TiledImplementation {
    pub ops: SmallVec<[OpId; 2]>,
    /// Tile of each result (empty with buffer semantics).
    pub values: SmallVec<[ValueId; 2]>,
}

// ============================================================================
// Capability dispatch
// ============================================================================

/// Check operand counts, types and attributes.
pub fn verify(module: &Module, op: OpId) -> Result<()> {
    let p = StructuredParts::of(module, op)?;
    for v in p.inputs.iter().chain(&p.outputs) {
        let ty = module.value_type(*v);
        p.check(ty.is_tensor() || ty.is_memref() || ty.as_scalar().is_some(), "operands must be shaped or scalar")?;
    }
    let tensors = p.outputs.iter().all(|v| module.value_type(*v).is_tensor());
    let memrefs = p.outputs.iter().all(|v| module.value_type(*v).is_memref());
    p.check(tensors || memrefs, "outputs must be all tensors or all memrefs")?;
    p.check(p.tensor_semantics() == tensors, "semantics flag disagrees with output types")?;
    if tensors {
        p.check(p.results.len() == p.outputs.len(), "each output needs a tied result")?;
        for (r, o) in p.results.iter().zip(&p.outputs) {
            p.check(module.value_type(*r) == module.value_type(*o), "result type differs from its output")?;
        }
    } else {
        p.check(p.results.is_empty(), "buffer semantics produce no results")?;
    }
    match p.kind() {
        StructuredKind::Scatter { .. } => scatter::verify(module, &p),
        StructuredKind::Sort { .. } => sort::verify(module, &p),
        StructuredKind::Fft => fft::verify(module, &p),
        StructuredKind::Scan { .. } => scan::verify(module, &p),
        StructuredKind::Reverse { .. } => reverse::verify(module, &p),
        StructuredKind::TopK { .. } => topk::verify(module, &p),
        StructuredKind::Pack(_) => pack::verify_pack(module, &p),
        StructuredKind::UnPack(_) => pack::verify_unpack(module, &p),
    }
}

/// Parallel/reduction kind of each loop in the iteration domain.
pub fn loop_iterator_kinds(module: &Module, op: OpId) -> Result<SmallVec<[IteratorKind; 4]>> {
    let p = StructuredParts::of(module, op)?;
    Ok(match p.kind() {
        StructuredKind::Scatter { .. } => scatter::iterator_kinds(module, &p)?,
        StructuredKind::Sort { dimension } => reduce_one(rank(module, p.outputs[0])?, *dimension),
        StructuredKind::Fft => SmallVec::from_elem(IteratorKind::Parallel, rank(module, p.outputs[0])?),
        StructuredKind::Scan { dimension, .. } => reduce_one(rank(module, p.inputs[0])?, *dimension),
        StructuredKind::Reverse { .. } => SmallVec::from_elem(IteratorKind::Parallel, rank(module, p.inputs[0])?),
        StructuredKind::TopK { dimension } => reduce_one(rank(module, p.inputs[0])?, *dimension),
        StructuredKind::Pack(_) => SmallVec::from_elem(IteratorKind::Parallel, rank(module, p.inputs[0])?),
        StructuredKind::UnPack(_) => SmallVec::from_elem(IteratorKind::Parallel, rank(module, p.outputs[0])?),
    })
}

/// Loop ranges of the iteration domain, emitted at the builder's insertion point.
pub fn iteration_domain(b: &mut Builder, op: OpId) -> Result<Vec<LoopRange>> {
    let p = StructuredParts::of(b.module(), op)?;
    match p.kind() {
        StructuredKind::Scatter { .. }
        | StructuredKind::Scan { .. }
        | StructuredKind::Reverse { .. }
        | StructuredKind::TopK { .. } => zero_based_domain(b, p.inputs[0]),
        StructuredKind::Sort { .. } | StructuredKind::UnPack(_) => zero_based_domain(b, p.outputs[0]),
        StructuredKind::Pack(_) => pack::iteration_domain(b, &p),
        StructuredKind::Fft => fft::iteration_domain(b, &p),
    }
}

/// Emit the scalar body for one point of the iteration domain.
///
/// Requires buffer semantics; `ivs` has one induction value per domain loop.
pub fn generate_scalar_body(b: &mut Builder, op: OpId, ivs: &[ValueId]) -> Result<()> {
    let p = StructuredParts::of(b.module(), op)?;
    ensure!(!p.tensor_semantics(), UnsupportedSnafu { name: p.name(), what: "scalar lowering with tensor semantics" });
    trace!(op = %op, name = p.name(), "generating scalar body");
    match p.kind() {
        StructuredKind::Scatter { .. } => scatter::scalar_body(b, &p, ivs),
        StructuredKind::Sort { .. } => sort::scalar_body(b, &p, ivs),
        StructuredKind::Fft => fft::scalar_body(b, &p, ivs),
        StructuredKind::Scan { .. } => scan::scalar_body(b, &p, ivs),
        StructuredKind::Reverse { .. } => reverse::scalar_body(b, &p, ivs),
        StructuredKind::TopK { .. } => topk::scalar_body(b, &p, ivs),
        StructuredKind::Pack(_) => pack::pack_scalar_body(b, &p, ivs),
        StructuredKind::UnPack(_) => pack::unpack_scalar_body(b, &p, ivs),
    }
}

/// Build the op restricted to the tile `offsets/sizes` of its iteration domain.
pub fn tiled_implementation(b: &mut Builder, op: OpId, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let p = StructuredParts::of(b.module(), op)?;
    match p.kind() {
        StructuredKind::Scatter { .. } => scatter::tile(b, &p, offsets, sizes),
        StructuredKind::Sort { .. } | StructuredKind::Fft => {
            let outputs = slice_all(b, &p.outputs, offsets, sizes)?;
            clone_tiled(b, &p, &p.inputs, &outputs, &p.extras)
        }
        StructuredKind::Scan { .. } => scan::tile(b, &p, offsets, sizes),
        StructuredKind::Reverse { .. } => reverse::tile(b, &p, offsets, sizes),
        StructuredKind::TopK { .. } => topk::tile(b, &p, offsets, sizes),
        StructuredKind::Pack(_) => pack::tile_pack(b, &p, offsets, sizes),
        StructuredKind::UnPack(_) => pack::tile_unpack(b, &p, offsets, sizes),
    }
}

/// Offsets and sizes, within result `result`, of the tile produced for the iteration tile `offsets/sizes`.
pub fn result_tile_position(
    b: &mut Builder,
    op: OpId,
    result: usize,
    offsets: &[SInt],
    sizes: &[SInt],
) -> Result<(SIntVec, SIntVec)> {
    let p = StructuredParts::of(b.module(), op)?;
    ensure!(result < p.outputs.len(), DimOutOfRangeSnafu { dim: result, rank: p.outputs.len() });
    match p.kind() {
        StructuredKind::Scatter { .. } => scatter::result_position(b, &p, offsets, sizes),
        StructuredKind::Scan { .. } => scan::result_position(b, &p, result, offsets, sizes),
        StructuredKind::Reverse { .. } => reverse::result_position(b, &p, offsets, sizes),
        StructuredKind::TopK { .. } => topk::result_position(b, &p, result, offsets, sizes),
        StructuredKind::Pack(_) => pack::pack_result_position(b, &p, offsets, sizes),
        StructuredKind::Sort { .. } | StructuredKind::Fft | StructuredKind::UnPack(_) => {
            Ok((offsets.into(), sizes.into()))
        }
    }
}

/// Extents of every result, emitted at the builder's insertion point.
pub fn reify_result_shapes(b: &mut Builder, op: OpId) -> Result<Vec<SIntVec>> {
    let p = StructuredParts::of(b.module(), op)?;
    ensure!(p.tensor_semantics(), UnsupportedSnafu { name: p.name(), what: "shape reification with buffer semantics" });
    p.outputs.iter().map(|o| b.dims(*o)).collect()
}

/// Output operand a result is tied to.
pub fn tied_output(module: &Module, op: OpId, result: usize) -> Result<ValueId> {
    let p = StructuredParts::of(module, op)?;
    p.outputs.get(result).copied().context(DimOutOfRangeSnafu { dim: result, rank: p.outputs.len() })
}

// ============================================================================
// Construction
// ============================================================================

impl Builder<'_> {
    /// Create a structured op. Tensor outputs yield tied results; memref outputs none.
    pub fn create_structured(
        &mut self,
        kind: StructuredKind,
        inputs: &[ValueId],
        outputs: &[ValueId],
        extras: &[ValueId],
        payload: Option<BlockId>,
    ) -> Result<OpId> {
        let tensor_semantics = outputs.iter().all(|o| self.ty(*o).is_tensor());
        let result_types: Vec<Type> =
            if tensor_semantics { outputs.iter().map(|o| self.ty(*o).clone()).collect() } else { Vec::new() };
        let attrs = StructuredOp { kind, num_inputs: inputs.len(), num_outputs: outputs.len(), tensor_semantics };
        let operands = inputs.iter().chain(outputs).chain(extras).copied();
        self.create_with_regions(Op::Structured(attrs), operands, result_types, payload)
    }

    /// Detached block with scalar arguments, terminated by `scf.yield` of what `body` returns.
    pub fn build_block<F>(&mut self, arg_types: &[DType], body: F) -> Result<BlockId>
    where
        F: FnOnce(&mut Self, &[ValueId]) -> Result<Vec<ValueId>>,
    {
        let types: Vec<Type> = arg_types.iter().copied().map(Type::Scalar).collect();
        let block = self.module_mut().create_block(&types);
        let args = self.module().block(block).args.clone();
        let yielded = self.with_ip(InsertPoint::End(block), |b| body(b, &args))?;
        self.with_ip(InsertPoint::End(block), |b| b.yield_op(&yielded))?;
        Ok(block)
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

pub(crate) fn shaped(module: &Module, value: ValueId) -> Result<(Shape, DType)> {
    let ty = module.value_type(value);
    match ty {
        Type::Tensor(t) => Ok((t.shape.clone(), t.elem)),
        Type::MemRef(m) => Ok((m.shape.clone(), m.elem)),
        _ => UnexpectedTypeSnafu { value, expected: "tensor or memref", actual: ty.clone() }.fail(),
    }
}

pub(crate) fn rank(module: &Module, value: ValueId) -> Result<usize> {
    Ok(shaped(module, value)?.0.len())
}

fn reduce_one(rank: usize, dim: usize) -> SmallVec<[IteratorKind; 4]> {
    (0..rank).map(|d| if d == dim { IteratorKind::Reduction } else { IteratorKind::Parallel }).collect()
}

fn zero_based_domain(b: &mut Builder, value: ValueId) -> Result<Vec<LoopRange>> {
    Ok(b.dims(value)?.into_iter().map(LoopRange::zero_based).collect())
}

/// Copy of `ivs` with position `dim` replaced.
pub(crate) fn with_index(ivs: &[ValueId], dim: usize, value: ValueId) -> SmallVec<[ValueId; 4]> {
    let mut out: SmallVec<[ValueId; 4]> = ivs.into();
    out[dim] = value;
    out
}

/// Payload arity and types.
pub(crate) fn verify_payload(module: &Module, p: &StructuredParts, args: &[DType], yields: &[DType]) -> Result<()> {
    let block = p.payload_block()?;
    let arg_types: Vec<&Type> = module.block(block).args.iter().map(|a| module.value_type(*a)).collect();
    p.check(arg_types.len() == args.len(), "payload has the wrong number of arguments")?;
    for (ty, expected) in arg_types.iter().zip(args) {
        p.check(ty.as_scalar() == Some(*expected), "payload argument type mismatch")?;
    }
    let term = module.terminator(block).ok_or_else(|| p.error("payload must end in a yield"))?;
    let yielded: Vec<Option<DType>> = module.operands(term).iter().map(|v| module.value_type(*v).as_scalar()).collect();
    p.check(yielded.len() == yields.len(), "payload yields the wrong number of values")?;
    for (ty, expected) in yielded.iter().zip(yields) {
        p.check(*ty == Some(*expected), "payload yield type mismatch")?;
    }
    Ok(())
}

/// Evaluate the payload on `args` by cloning it at the insertion point.
pub(crate) fn apply_payload(b: &mut Builder, p: &StructuredParts, args: &[ValueId]) -> Result<SmallVec<[ValueId; 2]>> {
    let block = p.payload_block()?;
    b.inline_block(block, args)
}

pub(crate) fn slice_all(b: &mut Builder, values: &[ValueId], offsets: &[SInt], sizes: &[SInt]) -> Result<Vec<ValueId>> {
    values.iter().map(|v| b.slice(*v, offsets, sizes)).collect()
}

/// Clone the op onto new operands, deep-copying its payload.
pub(crate) fn clone_tiled(
    b: &mut Builder,
    p: &StructuredParts,
    inputs: &[ValueId],
    outputs: &[ValueId],
    extras: &[ValueId],
) -> Result<TiledImplementation> {
    let payload = match p.payload {
        Some(block) => Some(b.module_mut().clone_region(block, &mut IrMapping::new())),
        None => None,
    };
    let op = b.create_structured(p.kind().clone(), inputs, outputs, extras, payload)?;
    let values = b.module().results(op).into();
    Ok(TiledImplementation { ops: SmallVec::from_elem(op, 1), values })
}

/// Emit a loop nest over `0..bounds[i]` and call `body` with the induction values, innermost.
pub(crate) fn loop_nest(
    b: &mut Builder,
    bounds: &[SInt],
    body: &mut dyn FnMut(&mut Builder, &[ValueId]) -> Result<()>,
) -> Result<()> {
    fn go(
        b: &mut Builder,
        bounds: &[SInt],
        ivs: &mut Vec<ValueId>,
        body: &mut dyn FnMut(&mut Builder, &[ValueId]) -> Result<()>,
    ) -> Result<()> {
        let Some((first, rest)) = bounds.split_first() else {
            return body(b, ivs);
        };
        let mut inner: Result<()> = Ok(());
        b.for_loop(SInt::Const(0), *first, SInt::Const(1), &[], |b, iv, _| {
            ivs.push(iv);
            inner = go(b, rest, ivs, body);
            ivs.pop();
            Ok(Vec::new())
        })?;
        inner
    }
    go(b, bounds, &mut Vec::new(), body)
}
