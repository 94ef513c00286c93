//! `scan`: prefix combination along one dim, carrying the running value in an accumulator.

use smallvec::SmallVec;

use super::{StructuredKind, StructuredParts, TiledImplementation, apply_payload, clone_tiled, shaped, verify_payload, with_index};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::{SInt, SIntVec};
use crate::ty::shapes_compatible;
use crate::types::BinaryOp;

fn attrs(p: &StructuredParts) -> (usize, bool) {
    match p.kind() {
        StructuredKind::Scan { dimension, inclusive } => (*dimension, *inclusive),
        _ => (0, true),
    }
}

fn drop_dim<T: Copy>(values: &[T], dim: usize) -> SmallVec<[T; 4]> {
    values.iter().enumerate().filter(|(d, _)| *d != dim).map(|(_, v)| *v).collect()
}

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(p.inputs.len() == 1 && p.outputs.len() == 2, "expected one input and outputs (output, accumulator)")?;
    let (dim, _) = attrs(p);
    let (input, in_elem) = shaped(module, p.inputs[0])?;
    let (output, out_elem) = shaped(module, p.outputs[0])?;
    let (acc, acc_elem) = shaped(module, p.outputs[1])?;
    p.check(dim < input.len(), "scan dimension out of range")?;
    p.check(shapes_compatible(&input, &output), "input and output shapes differ")?;
    p.check(acc.len() + 1 == input.len(), "accumulator must have rank one less than the input")?;
    p.check(shapes_compatible(&acc, &drop_dim(&input, dim)), "accumulator shape must be the input without the scan dim")?;
    p.check(in_elem == out_elem && out_elem == acc_elem, "element types differ")?;
    verify_payload(module, p, &[out_elem, in_elem], &[out_elem])
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let (dim, inclusive) = attrs(p);
    let (input, output, acc) = (p.inputs[0], p.outputs[0], p.outputs[1]);
    let acc_idx = drop_dim(ivs, dim);
    let zero = b.const_index(0)?;
    let first = b.binary(BinaryOp::Eq, ivs[dim], zero)?;
    b.if_else(
        first,
        &[],
        |b| {
            let init = if inclusive { b.load(input, ivs)? } else { b.load(acc, &acc_idx)? };
            b.store(init, output, ivs)?;
            Ok(Vec::new())
        },
        |b| {
            let prev_iv = b.sub(SInt::Symbolic(ivs[dim]), SInt::Const(1))?;
            let prev_iv = b.materialize(prev_iv)?;
            let prev_idx = with_index(ivs, dim, prev_iv);
            let prev = b.load(output, &prev_idx)?;
            let x = b.load(input, if inclusive { ivs } else { &prev_idx[..] })?;
            let combined = apply_payload(b, p, &[prev, x])?[0];
            b.store(combined, output, ivs)?;
            b.store(combined, acc, &acc_idx)?;
            Ok(Vec::new())
        },
    )?;
    Ok(())
}

pub(super) fn result_position(
    _b: &mut Builder,
    p: &StructuredParts,
    result: usize,
    offsets: &[SInt],
    sizes: &[SInt],
) -> Result<(SIntVec, SIntVec)> {
    let (dim, _) = attrs(p);
    if result == 0 {
        return Ok((offsets.into(), sizes.into()));
    }
    Ok((drop_dim(offsets, dim), drop_dim(sizes, dim)))
}

pub(super) fn tile(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let (dim, _) = attrs(p);
    let input = b.slice(p.inputs[0], offsets, sizes)?;
    let output = b.slice(p.outputs[0], offsets, sizes)?;
    let acc = if offsets.len() > 1 {
        b.slice(p.outputs[1], &drop_dim(offsets, dim), &drop_dim(sizes, dim))?
    } else {
        p.outputs[1]
    };
    clone_tiled(b, p, &[input], &[output, acc], &[])
}

impl Builder<'_> {
    /// Prefix scan of `input` along `dimension`; `combine(prev, x)` folds one element.
    pub fn scan<F>(
        &mut self,
        input: ValueId,
        output: ValueId,
        accumulator: ValueId,
        dimension: usize,
        inclusive: bool,
        combine: F,
    ) -> Result<OpId>
    where
        F: FnOnce(&mut Builder, ValueId, ValueId) -> Result<ValueId>,
    {
        let (out_elem, in_elem) = (self.elem_of(output)?, self.elem_of(input)?);
        let payload = self.build_block(&[out_elem, in_elem], |b, args| Ok(vec![combine(b, args[0], args[1])?]))?;
        let kind = StructuredKind::Scan { dimension, inclusive };
        self.create_structured(kind, &[input], &[output, accumulator], &[], Some(payload))
    }
}
