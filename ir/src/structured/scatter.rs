//! `scatter`: combine slices of `updates` into `original` at positions read from `indices`.
//!
//! `indices` is `N x depth` (i32). Row `i` of it addresses the dims
//! `dimension_map[0..depth]` of `original`; the trailing `rank(updates) - 1`
//! update dims map onto the trailing dims of `original` and are added to any
//! indexed start of the same dim.

use smallvec::SmallVec;
use trellis_dtype::DType;

use super::{StructuredKind, StructuredParts, TiledImplementation, apply_payload, clone_tiled, shaped, verify_payload};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{BlockId, Module, OpId, ValueId};
use crate::sint::{SInt, SIntVec};
use crate::ty::Dim;
use crate::types::{BinaryOp, IteratorKind};

fn attrs(p: &StructuredParts) -> (&[usize], bool) {
    match p.kind() {
        StructuredKind::Scatter { dimension_map, unique_indices } => (dimension_map, *unique_indices),
        _ => (&[], false),
    }
}

/// First original dim fed by the update window.
fn window_start(original_rank: usize, update_rank: usize) -> usize {
    original_rank + 1 - update_rank
}

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(p.inputs.len() == 2 && p.outputs.len() == 1, "expected inputs (updates, indices) and one output")?;
    let (updates, u_elem) = shaped(module, p.inputs[0])?;
    let (indices, i_elem) = shaped(module, p.inputs[1])?;
    let (original, o_elem) = shaped(module, p.outputs[0])?;
    let (dimension_map, _) = attrs(p);

    p.check(indices.len() == 2, "indices must be rank 2")?;
    p.check(i_elem == DType::Int32, "indices must have i32 elements")?;
    let depth = indices[1].as_static().ok_or_else(|| p.error("index depth must be static"))?;
    p.check(dimension_map.len() == depth, "dimension_map length must equal the index depth")?;
    let mut seen = SmallVec::<[bool; 4]>::from_elem(false, original.len());
    for &d in dimension_map {
        p.check(d < original.len() && !seen[d], "dimension_map entries must be unique dims of original")?;
        seen[d] = true;
    }

    p.check(!updates.is_empty(), "updates must have rank at least 1")?;
    p.check(indices[0].is_compatible(&updates[0]), "indices and updates disagree on the batch dim")?;
    p.check(updates.len() - 1 <= original.len(), "update window has higher rank than original")?;
    p.check(original.len() < depth + updates.len(), "index depth too small for original rank")?;
    for i in 1..updates.len() {
        let (u, o) = (updates[updates.len() - i], original[original.len() - i]);
        if let (Dim::Static(u), Dim::Static(o)) = (u, o) {
            p.check(u <= o, "update window dim exceeds original dim")?;
        }
    }
    let start = window_start(original.len(), updates.len());
    p.check((0..start).all(|d| seen[d]), "leading original dims must be indexed by dimension_map")?;

    p.check(u_elem == o_elem, "updates and original element types differ")?;
    verify_payload(module, p, &[u_elem, o_elem], &[o_elem])
}

pub(super) fn iterator_kinds(module: &Module, p: &StructuredParts) -> Result<SmallVec<[IteratorKind; 4]>> {
    let (dimension_map, unique) = attrs(p);
    let update_rank = shaped(module, p.inputs[0])?.0.len();
    let start = window_start(shaped(module, p.outputs[0])?.0.len(), update_rank);
    let batch = if unique { IteratorKind::Parallel } else { IteratorKind::Reduction };
    // A window dim that is also indexed cannot be cut: its tile would start mid-window.
    let window = (1..update_rank).map(|j| {
        if dimension_map.contains(&(start + j - 1)) { IteratorKind::Reduction } else { IteratorKind::Parallel }
    });
    Ok(std::iter::once(batch).chain(window).collect())
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let (dimension_map, _) = attrs(p);
    let (updates, indices, original) = (p.inputs[0], p.inputs[1], p.outputs[0]);
    let original_rank = b.shape_of(original)?.len();
    let start = window_start(original_rank, ivs.len());

    let update = b.load(updates, ivs)?;
    let mut starts: SmallVec<[Option<ValueId>; 4]> = SmallVec::from_elem(None, original_rank);
    for (j, iv) in ivs[1..].iter().enumerate() {
        starts[start + j] = Some(*iv);
    }
    for (i, &d) in dimension_map.iter().enumerate() {
        let column = b.const_index(i)?;
        let raw = b.load(indices, &[ivs[0], column])?;
        let idx = b.cast(raw, DType::Index)?;
        starts[d] = Some(match starts[d] {
            Some(s) => b.binary(BinaryOp::Add, s, idx)?,
            None => idx,
        });
    }
    let starts: SmallVec<[ValueId; 4]> =
        starts.into_iter().collect::<Option<_>>().ok_or_else(|| p.error("original dim left unaddressed"))?;
    let current = b.load(original, &starts)?;
    let combined = apply_payload(b, p, &[update, current])?;
    b.store(combined[0], original, &starts)?;
    Ok(())
}

pub(super) fn result_position(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<(SIntVec, SIntVec)> {
    let (dimension_map, _) = attrs(p);
    let original = p.outputs[0];
    let original_rank = b.shape_of(original)?.len();
    let start = window_start(original_rank, offsets.len());
    let mut out_offsets = SIntVec::new();
    let mut out_sizes = SIntVec::new();
    for d in 0..original_rank {
        if d < start || dimension_map.contains(&d) {
            out_offsets.push(SInt::Const(0));
            out_sizes.push(b.dim(original, d)?);
        } else {
            out_offsets.push(offsets[d + 1 - start]);
            out_sizes.push(sizes[d + 1 - start]);
        }
    }
    Ok((out_offsets, out_sizes))
}

pub(super) fn tile(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let (dimension_map, _) = attrs(p);
    let (updates, indices, original) = (p.inputs[0], p.inputs[1], p.outputs[0]);
    let start = window_start(b.shape_of(original)?.len(), offsets.len());
    for j in 1..offsets.len() {
        if dimension_map.contains(&(start + j - 1)) {
            let full = b.dim(updates, j)?;
            let partial = matches!((sizes[j].as_const(), full.as_const()), (Some(s), Some(f)) if s != f);
            if !offsets[j].is(0) || partial {
                return UnsupportedSnafu { name: p.name(), what: "tiling an indexed window dim" }.fail();
            }
        }
    }

    let update_tile = b.slice(updates, offsets, sizes)?;
    let depth = b.dim(indices, 1)?;
    let indices_tile = b.slice(indices, &[offsets[0], SInt::Const(0)], &[sizes[0], depth])?;
    let (o_offsets, o_sizes) = result_position(b, p, offsets, sizes)?;
    let original_tile = b.slice(original, &o_offsets, &o_sizes)?;
    clone_tiled(b, p, &[update_tile, indices_tile], &[original_tile], &[])
}

impl Builder<'_> {
    /// `original[...] = combine(update, original[...])` for every update element.
    pub fn scatter<F>(
        &mut self,
        updates: ValueId,
        indices: ValueId,
        original: ValueId,
        dimension_map: &[usize],
        unique_indices: bool,
        combine: F,
    ) -> Result<OpId>
    where
        F: FnOnce(&mut Builder, ValueId, ValueId) -> Result<ValueId>,
    {
        let (update_elem, elem) = (self.elem_of(updates)?, self.elem_of(original)?);
        let payload: BlockId = self.build_block(&[update_elem, elem], |b, args| {
            Ok(vec![combine(b, args[0], args[1])?])
        })?;
        let kind = StructuredKind::Scatter { dimension_map: dimension_map.into(), unique_indices };
        self.create_structured(kind, &[updates, indices], &[original], &[], Some(payload))
    }
}
