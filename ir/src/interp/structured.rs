//! Reference semantics of the structured ops.
//!
//! Outputs with tensor semantics are copied into scratch storage, updated in
//! place and rebound as the results. Inputs are read from snapshots, so an
//! op never observes its own writes through an input.

use std::f64::consts::PI;

use smallvec::SmallVec;
use snafu::OptionExt;
use trellis_dtype::DType;

use super::value::{Extents, MemRefView, RuntimeValue, row_major};
use super::{Interpreter, to_index};
use crate::error::*;
use crate::eval::eval_unary_op;
use crate::module::{BlockId, OpId};
use crate::structured::{StructuredKind, StructuredParts};
use crate::types::{BinaryOp, ConstValue, UnaryOp};

fn replaced(index: &[usize], dim: usize, value: usize) -> Extents {
    let mut out: Extents = index.into();
    out[dim] = value;
    out
}

fn dropped(index: &[usize], dim: usize) -> Extents {
    index.iter().enumerate().filter(|(d, _)| *d != dim).map(|(_, v)| *v).collect()
}

impl Interpreter<'_> {
    pub(super) fn exec_structured(&mut self, op: OpId) -> Result<()> {
        let p = StructuredParts::of(self.module, op)?;
        let outputs: Vec<MemRefView> = p
            .outputs
            .iter()
            .map(|o| match self.get(*o)? {
                RuntimeValue::MemRef(m) => Ok(m.clone()),
                RuntimeValue::Tensor(t) => Ok(MemRefView::from_array(t)),
                _ => RuntimeKindSnafu { value: *o, expected: "tensor or memref" }.fail(),
            })
            .collect::<Result<_>>()?;

        match p.kind().clone() {
            StructuredKind::Scatter { dimension_map, .. } => self.scatter(&p, &dimension_map, &outputs[0])?,
            StructuredKind::Sort { dimension } => self.sort(&p, dimension, &outputs)?,
            StructuredKind::Fft => self.fft(&p, &outputs[0], &outputs[1])?,
            StructuredKind::Scan { dimension, inclusive } => {
                self.scan(&p, dimension, inclusive, &outputs[0], &outputs[1])?
            }
            StructuredKind::Reverse { dimensions } => {
                let input = self.array(p.inputs[0])?;
                for index in row_major(input.shape()) {
                    let mut mirrored = index.clone();
                    for &d in &dimensions {
                        mirrored[d] = input.shape()[d] - 1 - index[d];
                    }
                    outputs[0].store(&mirrored, input.get(&index)?)?;
                }
            }
            StructuredKind::TopK { dimension } => self.topk(&p, dimension, &outputs[0], &outputs[1])?,
            StructuredKind::Pack(attrs) => {
                let source = self.array(p.inputs[0])?;
                let tiles = self.tile_sizes(&p)?;
                let pad = p.pack_padding().map(|v| self.scalar(v)).transpose()?;
                let rank = source.shape().len();
                let inverse = attrs.inverse_perm(rank);
                for outer in row_major(&outputs[0].shape()[..rank]) {
                    for point in row_major(&tiles) {
                        let mut src = Extents::new();
                        let mut in_bounds = true;
                        for (d, pos) in inverse.iter().enumerate() {
                            let idx = match attrs.blocked_position(d) {
                                Some(k) => {
                                    let idx = outer[*pos] * tiles[k] + point[k];
                                    in_bounds &= idx < source.shape()[d];
                                    idx
                                }
                                None => outer[*pos],
                            };
                            src.push(idx);
                        }
                        let value = match pad {
                            Some(pad) if !in_bounds => pad,
                            _ => source.get(&src)?,
                        };
                        let at: Extents = outer.iter().chain(&point).copied().collect();
                        outputs[0].store(&at, value)?;
                    }
                }
            }
            StructuredKind::UnPack(attrs) => {
                let source = self.array(p.inputs[0])?;
                let tiles = self.tile_sizes(&p)?;
                let rank = outputs[0].shape().len();
                let perm = attrs.perm(rank);
                for index in row_major(outputs[0].shape()) {
                    let mut outer = index.clone();
                    let mut inner = Extents::new();
                    for (k, &d) in attrs.inner_dims_pos.iter().enumerate() {
                        outer[d] = index[d] / tiles[k];
                        inner.push(index[d] % tiles[k]);
                    }
                    let packed: Extents = perm.iter().map(|d| outer[*d]).chain(inner).collect();
                    outputs[0].store(&index, source.get(&packed)?)?;
                }
            }
        }

        if p.tensor_semantics() {
            for (result, out) in p.results.iter().zip(&outputs) {
                let array = out.to_array()?;
                self.bind(*result, array);
            }
        }
        Ok(())
    }

    fn payload_block(&self, p: &StructuredParts) -> Result<BlockId> {
        p.payload.ok_or_else(|| p.error("missing payload region"))
    }

    fn tile_sizes(&self, p: &StructuredParts) -> Result<Extents> {
        p.pack_tiles()?.iter().map(|t| self.sint(*t)).collect()
    }

    fn scatter(&mut self, p: &StructuredParts, dimension_map: &[usize], original: &MemRefView) -> Result<()> {
        let updates = self.array(p.inputs[0])?;
        let indices = self.array(p.inputs[1])?;
        let payload = self.payload_block(p)?;
        let original_rank = original.shape().len();
        let start = original_rank + 1 - updates.shape().len();
        for u in row_major(updates.shape()) {
            let mut target: SmallVec<[Option<i64>; 4]> = SmallVec::from_elem(None, original_rank);
            for (j, iv) in u[1..].iter().enumerate() {
                target[start + j] = Some(*iv as i64);
            }
            for (i, &d) in dimension_map.iter().enumerate() {
                let raw = indices.get(&[u[0], i])?.cast(DType::Index);
                let idx = raw.as_int().context(EvaluationFailedSnafu { name: "scatter index" })?;
                target[d] = Some(target[d].map_or(idx, |s| s.wrapping_add(idx)));
            }
            let target: Extents = target
                .into_iter()
                .map(|t| to_index(t.ok_or_else(|| p.error("original dim left unaddressed"))?))
                .collect::<Result<_>>()?;
            let current = original.load(&target)?;
            let combined = self.payload(payload, &[updates.get(&u)?, current])?;
            original.store(&target, combined[0])?;
        }
        Ok(())
    }

    fn sort(&mut self, p: &StructuredParts, dim: usize, outputs: &[MemRefView]) -> Result<()> {
        let payload = self.payload_block(p)?;
        let shape: Extents = outputs[0].shape().into();
        let n = shape[dim];
        let lines = replaced(&shape, dim, 1);
        for line in row_major(&lines) {
            for _ in 0..n {
                for i in 0..n.saturating_sub(1) {
                    let (at_i, at_next) = (replaced(&line, dim, i), replaced(&line, dim, i + 1));
                    let mut pairs = Vec::with_capacity(outputs.len() * 2);
                    for out in outputs {
                        pairs.push(out.load(&at_i)?);
                        pairs.push(out.load(&at_next)?);
                    }
                    let ordered = self.payload(payload, &pairs)?[0];
                    if ordered.as_bool() != Some(true) {
                        for (k, out) in outputs.iter().enumerate() {
                            out.store(&at_i, pairs[2 * k + 1])?;
                            out.store(&at_next, pairs[2 * k])?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn fft(&mut self, p: &StructuredParts, real: &MemRefView, imag: &MemRefView) -> Result<()> {
        let stage = self.int(p.inputs[0])?;
        let stage = u32::try_from(stage).map_err(|_| Error::NegativeIndex { value: stage })?;
        let m = 1usize.checked_shl(stage).context(EvaluationFailedSnafu { name: "fft stage" })?;
        let half = m / 2;
        let elem = real.elem();
        let coeffs = if p.inputs.len() == 3 { Some((self.array(p.inputs[1])?, self.array(p.inputs[2])?)) } else { None };
        let unary = |op: UnaryOp, x: ConstValue| -> Result<ConstValue> {
            Ok(eval_unary_op(op, x).context(EvaluationFailedSnafu { name: "arith.unary" })?.cast(elem))
        };
        let angle = self.arith(
            BinaryOp::Fdiv,
            ConstValue::Float(-2.0 * PI).cast(elem),
            ConstValue::Int(m as i64).cast(elem),
            elem,
        )?;

        let shape: Extents = real.shape().into();
        let (outer_shape, n) = shape.split_at(shape.len() - 1);
        for outer in row_major(outer_shape) {
            for k in (0..n[0]).step_by(m) {
                for j in 0..half {
                    let (wr, wi) = match &coeffs {
                        Some((cr, ci)) => (cr.get(&[j])?, ci.get(&[j])?),
                        None => {
                            let theta = self.arith(BinaryOp::Mul, angle, ConstValue::Int(j as i64).cast(elem), elem)?;
                            (unary(UnaryOp::Cos, theta)?, unary(UnaryOp::Sin, theta)?)
                        }
                    };
                    let at = |i: usize| -> Extents { outer.iter().copied().chain(std::iter::once(i)).collect() };
                    let (at_l, at_r) = (at(k + j), at(k + j + half));
                    let (ar, ai) = (real.load(&at_l)?, imag.load(&at_l)?);
                    let (br, bi) = (real.load(&at_r)?, imag.load(&at_r)?);
                    let mul = |a, b| self.arith(BinaryOp::Mul, a, b, elem);
                    let tr = self.arith(BinaryOp::Sub, mul(wr, br)?, mul(wi, bi)?, elem)?;
                    let ti = self.arith(BinaryOp::Add, mul(wr, bi)?, mul(wi, br)?, elem)?;
                    real.store(&at_l, self.arith(BinaryOp::Add, ar, tr, elem)?)?;
                    imag.store(&at_l, self.arith(BinaryOp::Add, ai, ti, elem)?)?;
                    real.store(&at_r, self.arith(BinaryOp::Sub, ar, tr, elem)?)?;
                    imag.store(&at_r, self.arith(BinaryOp::Sub, ai, ti, elem)?)?;
                }
            }
        }
        Ok(())
    }

    fn scan(
        &mut self,
        p: &StructuredParts,
        dim: usize,
        inclusive: bool,
        output: &MemRefView,
        acc: &MemRefView,
    ) -> Result<()> {
        let input = self.array(p.inputs[0])?;
        let payload = self.payload_block(p)?;
        for index in row_major(input.shape()) {
            let acc_idx = dropped(&index, dim);
            if index[dim] == 0 {
                let init = if inclusive { input.get(&index)? } else { acc.load(&acc_idx)? };
                output.store(&index, init)?;
                continue;
            }
            let prev_idx = replaced(&index, dim, index[dim] - 1);
            let prev = output.load(&prev_idx)?;
            let x = input.get(if inclusive { &index } else { &prev_idx })?;
            let combined = self.payload(payload, &[prev, x])?[0];
            output.store(&index, combined)?;
            acc.store(&acc_idx, combined)?;
        }
        Ok(())
    }

    fn topk(&mut self, p: &StructuredParts, dim: usize, out_values: &MemRefView, out_indices: &MemRefView) -> Result<()> {
        let values = self.array(p.inputs[0])?;
        let indices = p.inputs.get(1).map(|v| self.array(*v)).transpose()?;
        let payload = self.payload_block(p)?;
        let k = out_values.shape()[dim];
        for index in row_major(values.shape()) {
            let mut cv = values.get(&index)?;
            let mut ci = match &indices {
                Some(indices) => indices.get(&index)?,
                None => ConstValue::Int(index[dim] as i64).cast(DType::Int32),
            };
            for kk in 0..k {
                let at = replaced(&index, dim, kk);
                let (kv, ki) = (out_values.load(&at)?, out_indices.load(&at)?);
                let forward = self.payload(payload, &[cv, kv])?[0].as_bool() == Some(true);
                let reverse = self.payload(payload, &[kv, cv])?[0].as_bool() == Some(true);
                let earlier = matches!((ci, ki), (ConstValue::Int(a), ConstValue::Int(b)) if a < b);
                let take_index = forward || (forward == reverse && earlier);
                out_values.store(&at, if forward { cv } else { kv })?;
                out_indices.store(&at, if take_index { ci } else { ki })?;
                let (next_v, next_i) = (if forward { kv } else { cv }, if take_index { ki } else { ci });
                cv = next_v;
                ci = next_i;
            }
        }
        Ok(())
    }
}
