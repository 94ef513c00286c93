//! `sort`: in-place sort of one or more same-shaped outputs along a dimension.
//!
//! The comparator sees `(a0, b0, a1, b1, ...)` for the element pairs of all
//! outputs and returns true when the pair is already ordered. Lowering emits
//! one bubble pass per point of the sort dim, so a full domain sweep sorts
//! every line.

use smallvec::SmallVec;
use trellis_dtype::DType;

use super::{StructuredKind, StructuredParts, apply_payload, shaped, verify_payload, with_index};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::SInt;
use crate::ty::shapes_compatible;

fn dimension(p: &StructuredParts) -> usize {
    match p.kind() {
        StructuredKind::Sort { dimension } => *dimension,
        _ => 0,
    }
}

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(p.inputs.is_empty(), "sort takes no inputs")?;
    p.check(!p.outputs.is_empty(), "sort needs at least one output")?;
    let (shape, _) = shaped(module, p.outputs[0])?;
    p.check(dimension(p) < shape.len(), "sort dimension out of range")?;
    let mut args = SmallVec::<[DType; 4]>::new();
    for out in &p.outputs {
        let (s, elem) = shaped(module, *out)?;
        p.check(shapes_compatible(&s, &shape), "sorted outputs must have the same shape")?;
        args.extend([elem, elem]);
    }
    verify_payload(module, p, &args, &[DType::Bool])
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let dim = dimension(p);
    let n = b.dim(p.outputs[0], dim)?;
    let last = if n.is(0) { n } else { b.sub(n, SInt::Const(1))? };
    let outputs = p.outputs.clone();
    b.for_loop(SInt::Const(0), last, SInt::Const(1), &[], |b, i, _| {
        let next = b.add(SInt::Symbolic(i), SInt::Const(1))?;
        let next = b.materialize(next)?;
        let (at_i, at_next) = (with_index(ivs, dim, i), with_index(ivs, dim, next));
        let mut pairs = Vec::with_capacity(outputs.len() * 2);
        for out in &outputs {
            pairs.push(b.load(*out, &at_i)?);
            pairs.push(b.load(*out, &at_next)?);
        }
        let ordered = apply_payload(b, p, &pairs)?[0];
        b.if_else(
            ordered,
            &[],
            |_| Ok(Vec::new()),
            |b| {
                for (k, out) in outputs.iter().enumerate() {
                    b.store(pairs[2 * k + 1], *out, &at_i)?;
                    b.store(pairs[2 * k], *out, &at_next)?;
                }
                Ok(Vec::new())
            },
        )?;
        Ok(Vec::new())
    })?;
    Ok(())
}

impl Builder<'_> {
    /// Sort `outputs` along `dimension`; `ordered` receives `(a0, b0, a1, b1, ...)`.
    pub fn sort<F>(&mut self, dimension: usize, outputs: &[ValueId], ordered: F) -> Result<OpId>
    where
        F: FnOnce(&mut Builder, &[ValueId]) -> Result<ValueId>,
    {
        let mut args = Vec::with_capacity(outputs.len() * 2);
        for out in outputs {
            let elem = self.elem_of(*out)?;
            args.extend([elem, elem]);
        }
        let payload = self.build_block(&args, |b, args| Ok(vec![ordered(b, args)?]))?;
        self.create_structured(StructuredKind::Sort { dimension }, &[], outputs, &[], Some(payload))
    }
}
