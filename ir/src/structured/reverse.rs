//! `reverse`: mirror the input along a set of dims.

use smallvec::SmallVec;

use super::{StructuredKind, StructuredParts, TiledImplementation, clone_tiled, shaped};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::{SInt, SIntVec};
use crate::ty::shapes_compatible;

fn dimensions(p: &StructuredParts) -> &[usize] {
    match p.kind() {
        StructuredKind::Reverse { dimensions } => dimensions,
        _ => &[],
    }
}

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(p.inputs.len() == 1 && p.outputs.len() == 1, "expected one input and one output")?;
    let (input, in_elem) = shaped(module, p.inputs[0])?;
    let (output, out_elem) = shaped(module, p.outputs[0])?;
    p.check(shapes_compatible(&input, &output) && in_elem == out_elem, "input and output types are incompatible")?;
    let dims = dimensions(p);
    p.check(dims.iter().all(|d| *d < input.len()), "reversed dimension out of range")?;
    let mut sorted: SmallVec<[usize; 4]> = dims.into();
    sorted.sort_unstable();
    sorted.dedup();
    p.check(sorted.len() == dims.len(), "reversed dimensions must be unique")
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let (input, output) = (p.inputs[0], p.outputs[0]);
    let mut mirrored: SmallVec<[ValueId; 4]> = ivs.into();
    for &d in dimensions(p) {
        let extent = b.dim(input, d)?;
        let last = b.sub(extent, SInt::Const(1))?;
        let flipped = b.sub(last, SInt::Symbolic(ivs[d]))?;
        mirrored[d] = b.materialize(flipped)?;
    }
    let value = b.load(input, ivs)?;
    b.store(value, output, &mirrored)?;
    Ok(())
}

/// Output offsets of the tile at `offsets/sizes` in the input.
pub(super) fn result_position(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<(SIntVec, SIntVec)> {
    let mut mirrored: SIntVec = offsets.into();
    for &d in dimensions(p) {
        let extent = b.dim(p.inputs[0], d)?;
        let end = b.sub(extent, offsets[d])?;
        mirrored[d] = b.sub(end, sizes[d])?;
    }
    Ok((mirrored, sizes.into()))
}

pub(super) fn tile(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let input = b.slice(p.inputs[0], offsets, sizes)?;
    let (out_offsets, out_sizes) = result_position(b, p, offsets, sizes)?;
    let output = b.slice(p.outputs[0], &out_offsets, &out_sizes)?;
    clone_tiled(b, p, &[input], &[output], &[])
}

impl Builder<'_> {
    pub fn reverse(&mut self, input: ValueId, output: ValueId, dimensions: &[usize]) -> Result<OpId> {
        let kind = StructuredKind::Reverse { dimensions: dimensions.into() };
        self.create_structured(kind, &[input], &[output], &[], None)
    }
}
