//! `pack` / `unpack`: convert between a plain layout and a blocked one.
//!
//! Packing splits each dim listed in `inner_dims_pos` into
//! `ceil(dim / tile)` outer blocks and a trailing tile dim. The outer dims
//! are then permuted by `outer_dims_perm` (packed outer position `i` holds
//! unpacked dim `perm[i]`), and the tile dims are appended in
//! `inner_dims_pos` order. Out-of-range elements of partial tiles take the
//! padding value.

use smallvec::SmallVec;

use super::{StructuredKind, StructuredParts, TiledImplementation, clone_tiled, loop_nest, shaped};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::{LoopRange, SInt, SIntVec};
use crate::ty::{Dim, Shape, Type};
use crate::types::BinaryOp;

/// Blocking attributes shared by `pack` and `unpack`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackAttrs {
    /// Unpacked dims that are tiled, in the order their tile dims appear.
    pub inner_dims_pos: SmallVec<[usize; 4]>,
    /// Tile sizes; `None` entries are dynamic operands.
    pub static_inner_tiles: SmallVec<[Option<usize>; 4]>,
    /// Empty, or a permutation of the outer dims.
    pub outer_dims_perm: SmallVec<[usize; 4]>,
}

impl PackAttrs {
    pub fn num_dynamic_tiles(&self) -> usize {
        self.static_inner_tiles.iter().filter(|t| t.is_none()).count()
    }

    /// Position of `dim` among the tiled dims.
    pub fn blocked_position(&self, dim: usize) -> Option<usize> {
        self.inner_dims_pos.iter().position(|d| *d == dim)
    }

    /// `perm[i]` for every outer position, identity when no permutation is given.
    pub fn perm(&self, rank: usize) -> SmallVec<[usize; 4]> {
        if self.outer_dims_perm.is_empty() { (0..rank).collect() } else { self.outer_dims_perm.clone() }
    }

    /// Packed outer position of every unpacked dim.
    pub fn inverse_perm(&self, rank: usize) -> SmallVec<[usize; 4]> {
        let perm = self.perm(rank);
        let mut inverse = SmallVec::from_elem(0, rank);
        for (i, d) in perm.iter().enumerate() {
            inverse[*d] = i;
        }
        inverse
    }

    /// Shape of the packed value for an unpacked shape.
    pub fn packed_shape(&self, unpacked: &[Dim]) -> Shape {
        let blocked: Shape = unpacked
            .iter()
            .enumerate()
            .map(|(d, dim)| match self.blocked_position(d) {
                None => *dim,
                Some(k) => match (dim, self.static_inner_tiles[k]) {
                    (Dim::Static(n), Some(t)) if t > 0 => Dim::Static(n.div_ceil(t)),
                    _ => Dim::Dynamic,
                },
            })
            .collect();
        let perm = self.perm(unpacked.len());
        let mut packed: Shape = perm.iter().map(|d| blocked[*d]).collect();
        packed.extend(self.static_inner_tiles.iter().map(|t| t.map_or(Dim::Dynamic, Dim::Static)));
        packed
    }

    fn mixed_tiles(&self, dynamic: &[ValueId]) -> SIntVec {
        let mut next = dynamic.iter();
        self.static_inner_tiles
            .iter()
            .map(|t| match t {
                Some(t) => SInt::Const(*t),
                None => next.next().map_or(SInt::Const(1), |v| SInt::Symbolic(*v)),
            })
            .collect()
    }
}

fn attrs(p: &StructuredParts) -> Result<&PackAttrs> {
    match p.kind() {
        StructuredKind::Pack(a) | StructuredKind::UnPack(a) => Ok(a),
        _ => Err(p.error("not a pack or unpack op")),
    }
}

/// Padding value of a pack, if any.
fn padding(p: &StructuredParts, a: &PackAttrs) -> Option<ValueId> {
    (matches!(p.kind(), StructuredKind::Pack(_)) && p.extras.len() > a.num_dynamic_tiles()).then(|| p.extras[0])
}

fn tiles(p: &StructuredParts, a: &PackAttrs) -> SIntVec {
    let skip = usize::from(padding(p, a).is_some());
    a.mixed_tiles(&p.extras[skip..])
}

impl StructuredParts {
    /// Tile sizes of a pack or unpack, dynamic ones as symbols.
    pub fn pack_tiles(&self) -> Result<SIntVec> {
        let a = attrs(self)?;
        Ok(tiles(self, a))
    }

    /// Padding value of a pack, if any.
    pub fn pack_padding(&self) -> Option<ValueId> {
        attrs(self).ok().and_then(|a| padding(self, a))
    }
}

fn verify_common(p: &StructuredParts, a: &PackAttrs, unpacked: &[Dim], packed: &[Dim]) -> Result<()> {
    let rank = unpacked.len();
    let n_tiles = a.inner_dims_pos.len();
    p.check(a.static_inner_tiles.len() == n_tiles, "one tile per blocked dim required")?;
    p.check(n_tiles <= rank, "more tiles than unpacked dims")?;
    p.check(a.static_inner_tiles.iter().all(|t| *t != Some(0)), "tile sizes must be non-zero")?;
    let mut seen = SmallVec::<[bool; 4]>::from_elem(false, rank);
    for &d in &a.inner_dims_pos {
        p.check(d < rank && !seen[d], "inner_dims_pos must hold unique in-range dims")?;
        seen[d] = true;
    }
    if !a.outer_dims_perm.is_empty() {
        let mut sorted = a.outer_dims_perm.clone();
        sorted.sort_unstable();
        p.check(sorted.iter().copied().eq(0..rank), "outer_dims_perm must be a permutation of the outer dims")?;
    }
    p.check(packed.len() == rank + n_tiles, "packed rank must be unpacked rank plus tile count")?;

    let expected = a.packed_shape(unpacked);
    for (i, (have, want)) in packed.iter().zip(&expected).enumerate() {
        if i >= rank {
            let tile = a.static_inner_tiles[i - rank];
            p.check(
                match tile {
                    Some(t) => *have == Dim::Static(t),
                    None => have.is_dynamic(),
                },
                "trailing packed dims must match the tile sizes",
            )?;
        } else if let (Dim::Static(h), Dim::Static(w)) = (have, want) {
            p.check(h >= w, "packed shape is too small for the unpacked shape")?;
        }
    }
    Ok(())
}

pub(super) fn verify_pack(module: &Module, p: &StructuredParts) -> Result<()> {
    let a = attrs(p)?;
    p.check(p.inputs.len() == 1 && p.outputs.len() == 1, "pack has one source and one destination")?;
    let (source, elem) = shaped(module, p.inputs[0])?;
    let (dest, dest_elem) = shaped(module, p.outputs[0])?;
    p.check(elem == dest_elem, "source and destination element types differ")?;
    let n_dyn = a.num_dynamic_tiles();
    p.check(p.extras.len() == n_dyn || p.extras.len() == n_dyn + 1, "unexpected number of extra operands")?;
    verify_common(p, a, &source, &dest)?;
    match padding(p, a) {
        Some(pad) => {
            p.check(module.value_type(pad).as_scalar() == Some(elem), "padding type must match the element type")?;
        }
        None => {
            for (k, &d) in a.inner_dims_pos.iter().enumerate() {
                if let (Dim::Static(n), Some(t)) = (source[d], a.static_inner_tiles[k]) {
                    p.check(n % t == 0, "tiles must divide the source dims when no padding is given")?;
                }
            }
        }
    }
    Ok(())
}

pub(super) fn verify_unpack(module: &Module, p: &StructuredParts) -> Result<()> {
    let a = attrs(p)?;
    p.check(p.inputs.len() == 1 && p.outputs.len() == 1, "unpack has one source and one destination")?;
    let (source, elem) = shaped(module, p.inputs[0])?;
    let (dest, dest_elem) = shaped(module, p.outputs[0])?;
    p.check(elem == dest_elem, "source and destination element types differ")?;
    p.check(p.extras.len() == a.num_dynamic_tiles(), "unexpected number of extra operands")?;
    verify_common(p, a, &dest, &source)
}

pub(super) fn iteration_domain(b: &mut Builder, p: &StructuredParts) -> Result<Vec<LoopRange>> {
    let rank = b.shape_of(p.inputs[0])?.len();
    (0..rank).map(|d| Ok(LoopRange::zero_based(b.dim(p.outputs[0], d)?))).collect()
}

// ============================================================================
// Pack
// ============================================================================

pub(super) fn pack_scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let a = attrs(p)?.clone();
    let (source, dest) = (p.inputs[0], p.outputs[0]);
    let elem = b.elem_of(source)?;
    let inverse = a.inverse_perm(ivs.len());
    let tiles = tiles(p, &a);
    let pad = padding(p, &a);

    loop_nest(b, &tiles, &mut |b, points| {
        let mut src: SmallVec<[ValueId; 4]> = SmallVec::new();
        for (d, outer) in inverse.iter().map(|i| ivs[*i]).enumerate() {
            src.push(match a.blocked_position(d) {
                Some(k) => {
                    let base = b.mul(SInt::Symbolic(outer), tiles[k])?;
                    let idx = b.add(base, SInt::Symbolic(points[k]))?;
                    b.materialize(idx)?
                }
                None => outer,
            });
        }
        let value = match pad {
            Some(pad) => {
                let mut in_bounds = b.const_bool(true)?;
                for &d in &a.inner_dims_pos {
                    let extent = b.dim(source, d)?;
                    let extent = b.materialize(extent)?;
                    let lt = b.binary(BinaryOp::Lt, src[d], extent)?;
                    in_bounds = b.binary(BinaryOp::And, in_bounds, lt)?;
                }
                let select = b.if_else(
                    in_bounds,
                    &[Type::Scalar(elem)],
                    |b| Ok(vec![b.load(source, &src)?]),
                    |_| Ok(vec![pad]),
                )?;
                b.module().result(select, 0)
            }
            None => b.load(source, &src)?,
        };
        let at: Vec<ValueId> = ivs.iter().chain(points).copied().collect();
        b.store(value, dest, &at)?;
        Ok(())
    })
}

pub(super) fn pack_result_position(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<(SIntVec, SIntVec)> {
    let rank = offsets.len();
    let n_tiles = attrs(p)?.inner_dims_pos.len();
    let mut out_offsets: SIntVec = offsets.into();
    let mut out_sizes: SIntVec = sizes.into();
    for k in 0..n_tiles {
        out_offsets.push(SInt::Const(0));
        out_sizes.push(b.dim(p.outputs[0], rank + k)?);
    }
    Ok((out_offsets, out_sizes))
}

pub(super) fn tile_pack(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    let a = attrs(p)?.clone();
    let source = p.inputs[0];
    let inverse = a.inverse_perm(offsets.len());
    let tiles = tiles(p, &a);

    let mut in_offsets = SIntVec::new();
    let mut in_sizes = SIntVec::new();
    for (d, &pos) in inverse.iter().enumerate() {
        let (off, size) = (offsets[pos], sizes[pos]);
        match a.blocked_position(d) {
            Some(k) => {
                let start = b.mul(off, tiles[k])?;
                let len = b.mul(size, tiles[k])?;
                let extent = b.dim(source, d)?;
                let available = b.sub(extent, start)?;
                in_offsets.push(start);
                in_sizes.push(b.min(len, available)?);
            }
            None => {
                in_offsets.push(off);
                in_sizes.push(size);
            }
        }
    }
    let source_tile = b.slice(source, &in_offsets, &in_sizes)?;
    let (out_offsets, out_sizes) = pack_result_position(b, p, offsets, sizes)?;
    let dest_tile = b.slice(p.outputs[0], &out_offsets, &out_sizes)?;
    clone_tiled(b, p, &[source_tile], &[dest_tile], &p.extras)
}

// ============================================================================
// UnPack
// ============================================================================

pub(super) fn unpack_scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let a = attrs(p)?.clone();
    let (source, dest) = (p.inputs[0], p.outputs[0]);
    let tiles = tiles(p, &a);
    let mut outer: SmallVec<[ValueId; 4]> = ivs.into();
    let mut inner: SmallVec<[ValueId; 4]> = SmallVec::new();
    for (k, &d) in a.inner_dims_pos.iter().enumerate() {
        let q = b.div(SInt::Symbolic(ivs[d]), tiles[k])?;
        let r = b.rem(SInt::Symbolic(ivs[d]), tiles[k])?;
        outer[d] = b.materialize(q)?;
        inner.push(b.materialize(r)?);
    }
    let packed: Vec<ValueId> = a.perm(ivs.len()).iter().map(|d| outer[*d]).chain(inner).collect();
    let value = b.load(source, &packed)?;
    b.store(value, dest, ivs)?;
    Ok(())
}

pub(super) fn tile_unpack(b: &mut Builder, p: &StructuredParts, offsets: &[SInt], sizes: &[SInt]) -> Result<TiledImplementation> {
    ensure_tensor(p)?;
    let a = attrs(p)?.clone();
    let source = p.inputs[0];
    let elem = b.elem_of(p.outputs[0])?;
    let rank = offsets.len();
    let tiles = tiles(p, &a);

    let mut in_offsets = SIntVec::new();
    let mut in_sizes = SIntVec::new();
    let mut new_offsets = SIntVec::new();
    let mut expanded = SIntVec::new();
    for d in 0..rank {
        let (off, size) = (offsets[d], sizes[d]);
        match a.blocked_position(d) {
            Some(k) => {
                let first_q = b.div(off, tiles[k])?;
                let first_r = b.rem(off, tiles[k])?;
                let end = b.add(off, size)?;
                let last = b.sub(end, SInt::Const(1))?;
                let last_q = b.div(last, tiles[k])?;
                let span = b.sub(last_q, first_q)?;
                let blocks = b.add(span, SInt::Const(1))?;
                in_offsets.push(first_q);
                in_sizes.push(blocks);
                new_offsets.push(first_r);
                expanded.push(b.mul(blocks, tiles[k])?);
            }
            None => {
                in_offsets.push(off);
                in_sizes.push(size);
                new_offsets.push(SInt::Const(0));
                expanded.push(size);
            }
        }
    }
    let perm = a.perm(rank);
    let mut packed_offsets: SIntVec = perm.iter().map(|d| in_offsets[*d]).collect();
    let mut packed_sizes: SIntVec = perm.iter().map(|d| in_sizes[*d]).collect();
    for k in 0..tiles.len() {
        packed_offsets.push(SInt::Const(0));
        packed_sizes.push(b.dim(source, rank + k)?);
    }
    let source_tile = b.slice(source, &packed_offsets, &packed_sizes)?;
    let scratch = b.empty(&expanded, elem)?;
    let mut tiled = clone_tiled(b, p, &[source_tile], &[scratch], &p.extras)?;
    let unpacked = tiled.values[0];
    let window = b.extract_slice(unpacked, &new_offsets, sizes)?;
    tiled.values = SmallVec::from_elem(window, 1);
    Ok(tiled)
}

fn ensure_tensor(p: &StructuredParts) -> Result<()> {
    if p.tensor_semantics() {
        Ok(())
    } else {
        UnsupportedSnafu { name: p.name(), what: "tiling with buffer semantics" }.fail()
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Builder<'_> {
    /// Pack `source` into the blocked `dest`.
    pub fn pack(
        &mut self,
        source: ValueId,
        dest: ValueId,
        inner_dims_pos: &[usize],
        inner_tiles: &[SInt],
        outer_dims_perm: &[usize],
        padding: Option<ValueId>,
    ) -> Result<OpId> {
        let (attrs, dynamic) = pack_attrs(inner_dims_pos, inner_tiles, outer_dims_perm);
        let extras: Vec<ValueId> = padding.into_iter().chain(dynamic).collect();
        self.create_structured(StructuredKind::Pack(attrs), &[source], &[dest], &extras, None)
    }

    /// Unpack the blocked `source` into `dest`.
    pub fn unpack(
        &mut self,
        source: ValueId,
        dest: ValueId,
        inner_dims_pos: &[usize],
        inner_tiles: &[SInt],
        outer_dims_perm: &[usize],
    ) -> Result<OpId> {
        let (attrs, dynamic) = pack_attrs(inner_dims_pos, inner_tiles, outer_dims_perm);
        self.create_structured(StructuredKind::UnPack(attrs), &[source], &[dest], &dynamic, None)
    }
}

fn pack_attrs(inner_dims_pos: &[usize], inner_tiles: &[SInt], outer_dims_perm: &[usize]) -> (PackAttrs, Vec<ValueId>) {
    let attrs = PackAttrs {
        inner_dims_pos: inner_dims_pos.into(),
        static_inner_tiles: inner_tiles.iter().map(SInt::as_const).collect(),
        outer_dims_perm: outer_dims_perm.into(),
    };
    let dynamic = inner_tiles.iter().filter_map(SInt::as_symbolic).collect();
    (attrs, dynamic)
}

/// Packed counterpart of an unpacked tensor or memref type.
pub fn packed_type(unpacked: &Type, attrs: &PackAttrs) -> Option<Type> {
    let shape = attrs.packed_shape(unpacked.shape()?);
    unpacked.with_shape(shape)
}
