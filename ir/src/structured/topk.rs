//! `topk`: merge a line of values (and optional indices) into the K best seen so far.
//!
//! The outputs hold the running top-K along `dimension`, ordered by the
//! comparator. Ties are broken toward the smaller index, so the result is
//! stable with respect to input order.

use smallvec::SmallVec;
use trellis_dtype::DType;

use super::{StructuredKind, StructuredParts, TiledImplementation, apply_payload, clone_tiled, shaped, verify_payload, with_index};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::{SInt, SIntVec};
use crate::ty::shapes_compatible;
use crate::types::BinaryOp;

fn dimension(p: &StructuredParts) -> usize {
    match p.kind() {
        StructuredKind::TopK { dimension } => *dimension,
        _ => 0,
    }
}

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(matches!(p.inputs.len(), 1 | 2), "topk takes values and optional indices")?;
    p.check(p.outputs.len() == 2, "topk produces values and indices")?;
    let dim = dimension(p);
    let (values, elem) = shaped(module, p.inputs[0])?;
    p.check(dim < values.len(), "topk dimension out of range")?;
    if let Some(indices) = p.inputs.get(1) {
        let (shape, idx_elem) = shaped(module, *indices)?;
        p.check(idx_elem == DType::Int32, "input indices must be i32")?;
        p.check(shapes_compatible(&shape, &values), "input values and indices shapes differ")?;
    }
    let (out_values, out_elem) = shaped(module, p.outputs[0])?;
    let (out_indices, out_idx_elem) = shaped(module, p.outputs[1])?;
    p.check(out_elem == elem, "output values element type differs from input")?;
    p.check(out_idx_elem == DType::Int32, "output indices must be i32")?;
    p.check(shapes_compatible(&out_values, &out_indices), "output values and indices shapes differ")?;
    p.check(out_values.len() == values.len(), "output rank differs from input rank")?;
    for (d, (o, i)) in out_values.iter().zip(&values).enumerate() {
        p.check(d == dim || o.is_compatible(i), "output shape differs from input outside the topk dim")?;
    }
    verify_payload(module, p, &[elem, elem], &[DType::Bool])
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let dim = dimension(p);
    let (values, out_values, out_indices) = (p.inputs[0], p.outputs[0], p.outputs[1]);
    let value = b.load(values, ivs)?;
    let index = match p.inputs.get(1) {
        Some(indices) => b.load(*indices, ivs)?,
        None => b.cast(ivs[dim], DType::Int32)?,
    };
    let k = b.dim(out_values, dim)?;
    b.for_loop(SInt::Const(0), k, SInt::Const(1), &[value, index], |b, kk, carry| {
        let (cv, ci) = (carry[0], carry[1]);
        let at: SmallVec<[ValueId; 4]> = with_index(ivs, dim, kk);
        let (kv, ki) = (b.load(out_values, &at)?, b.load(out_indices, &at)?);
        let forward = apply_payload(b, p, &[cv, kv])?[0];
        let reverse = apply_payload(b, p, &[kv, cv])?[0];
        let tie = b.binary(BinaryOp::Eq, forward, reverse)?;
        let earlier = b.binary(BinaryOp::Lt, ci, ki)?;
        let tie_earlier = b.binary(BinaryOp::And, tie, earlier)?;
        let take_index = b.binary(BinaryOp::Or, forward, tie_earlier)?;

        let stored_v = b.select(forward, cv, kv)?;
        let stored_i = b.select(take_index, ci, ki)?;
        b.store(stored_v, out_values, &at)?;
        b.store(stored_i, out_indices, &at)?;
        let next_v = b.select(forward, kv, cv)?;
        let next_i = b.select(take_index, ki, ci)?;
        Ok(vec![next_v, next_i])
    })?;
    Ok(())
}

pub(super) fn result_position(
    b: &mut Builder,
    p: &StructuredParts,
    result: usize,
    offsets: &[SInt],
    sizes: &[SInt],
) -> Result<(SIntVec, SIntVec)> {
    let dim = dimension(p);
    let mut out_sizes: SIntVec = sizes.into();
    out_sizes[dim] = b.dim(p.outputs[result], dim)?;
    Ok((offsets.into(), out_sizes))
}

pub(super) fn tile(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let inputs: Vec<ValueId> = p.inputs.iter().map(|v| b.slice(*v, offsets, sizes)).collect::<Result<_>>()?;
    let mut outputs = Vec::with_capacity(2);
    for result in 0..2 {
        let (o, s) = result_position(b, p, result, offsets, sizes)?;
        outputs.push(b.slice(p.outputs[result], &o, &s)?);
    }
    clone_tiled(b, p, &inputs, &outputs, &[])
}

impl Builder<'_> {
    /// Merge `values` (with optional `indices`) into the running top-K outputs.
    pub fn topk<F>(
        &mut self,
        values: ValueId,
        indices: Option<ValueId>,
        out_values: ValueId,
        out_indices: ValueId,
        dimension: usize,
        better: F,
    ) -> Result<OpId>
    where
        F: FnOnce(&mut Builder, ValueId, ValueId) -> Result<ValueId>,
    {
        let elem = self.elem_of(values)?;
        let payload = self.build_block(&[elem, elem], |b, args| Ok(vec![better(b, args[0], args[1])?]))?;
        let inputs: Vec<ValueId> = std::iter::once(values).chain(indices).collect();
        self.create_structured(StructuredKind::TopK { dimension }, &inputs, &[out_values, out_indices], &[], Some(payload))
    }
}
