//! Strategies for structured-op inputs.

use proptest::prelude::*;
use trellis_dtype::DType;

use crate::interp::NdArray;
use crate::types::ConstValue;

/// Blocking of a statically shaped tensor whose tiles divide every blocked dim.
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub shape: Vec<usize>,
    pub inner_dims_pos: Vec<usize>,
    pub inner_tiles: Vec<usize>,
    pub outer_dims_perm: Vec<usize>,
}

impl PackConfig {
    /// Shape after packing.
    pub fn packed_shape(&self) -> Vec<usize> {
        let perm: Vec<usize> =
            if self.outer_dims_perm.is_empty() { (0..self.shape.len()).collect() } else { self.outer_dims_perm.clone() };
        let blocked = |d: usize| match self.inner_dims_pos.iter().position(|p| *p == d) {
            Some(k) => self.shape[d].div_ceil(self.inner_tiles[k]),
            None => self.shape[d],
        };
        perm.iter().map(|d| blocked(*d)).chain(self.inner_tiles.iter().copied()).collect()
    }
}

pub fn arb_permutation(n: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..n).collect::<Vec<_>>()).prop_shuffle()
}

/// Dims of the given rank range, each in `1..=max_dim`.
pub fn arb_shape(rank: std::ops::RangeInclusive<usize>, max_dim: usize) -> impl Strategy<Value = Vec<usize>> {
    rank.prop_flat_map(move |r| prop::collection::vec(1..=max_dim, r))
}

/// Small i32 array of exactly `shape`.
pub fn arb_i32_array(shape: Vec<usize>) -> impl Strategy<Value = NdArray> {
    let n: usize = shape.iter().product();
    prop::collection::vec(-50i32..50, n).prop_map(move |values| {
        NdArray::from_host(&shape, &values).expect("one value per element")
    })
}

pub fn arb_shaped_i32(rank: std::ops::RangeInclusive<usize>, max_dim: usize) -> impl Strategy<Value = NdArray> {
    arb_shape(rank, max_dim).prop_flat_map(arb_i32_array)
}

/// Ranks 1..=3 with per-dim tiles of 1..=3 and 1..=3 blocks, a random subset of
/// blocked dims in random order, and an optional outer permutation.
pub fn arb_pack_config() -> impl Strategy<Value = PackConfig> {
    (1usize..=3)
        .prop_flat_map(|rank| {
            (
                prop::collection::vec((1usize..=3, 1usize..=3), rank),
                arb_permutation(rank),
                1..=rank,
                arb_permutation(rank),
                any::<bool>(),
            )
        })
        .prop_map(|(dims, order, n_blocked, perm, permute)| {
            let shape = dims.iter().map(|(tile, blocks)| tile * blocks).collect();
            let inner_dims_pos: Vec<usize> = order[..n_blocked].to_vec();
            let inner_tiles = inner_dims_pos.iter().map(|d| dims[*d].0).collect();
            PackConfig { shape, inner_dims_pos, inner_tiles, outer_dims_perm: if permute { perm } else { Vec::new() } }
        })
}

/// Scatter of `n` scalar updates into a rank-1 original with distinct indices.
pub fn arb_unique_scatter() -> impl Strategy<Value = (NdArray, Vec<i32>, NdArray)> {
    (2usize..8)
        .prop_flat_map(|len| (Just(len), 1..=len))
        .prop_flat_map(|(len, n)| {
            let indices = Just((0..len as i32).collect::<Vec<_>>()).prop_shuffle().prop_map(move |mut v| {
                v.truncate(n);
                v
            });
            (arb_i32_array(vec![n]), indices, arb_i32_array(vec![len]))
        })
}

pub fn i32_column(values: &[i32]) -> NdArray {
    NdArray::from_host(&[values.len(), 1], values).expect("one value per row")
}

pub fn i32_fill(shape: &[usize], value: i32) -> NdArray {
    let n: usize = shape.iter().product();
    NdArray::new(shape, DType::Int32, vec![ConstValue::Int(value.into()); n]).expect("one value per element")
}
