//! `fft`: one radix-2 butterfly stage over the innermost dim of a complex signal.
//!
//! The signal is split into `real` and `imag` outputs updated in place. The
//! stage `s` pairs elements `m/2` apart inside blocks of `m = 1 << s`;
//! twiddle factors come from the optional coefficient inputs or are computed
//! as `exp(-2πi·j/m)`.

use std::f64::consts::PI;

use trellis_dtype::DType;

use super::{StructuredKind, StructuredParts, shaped};
use crate::builder::Builder;
use crate::error::*;
use crate::module::{Module, OpId, ValueId};
use crate::sint::{LoopRange, SInt};
use crate::ty::{Dim, shapes_compatible};
use crate::types::{BinaryOp, ConstValue, UnaryOp};

pub(super) fn verify(module: &Module, p: &StructuredParts) -> Result<()> {
    p.check(p.inputs.len() == 1 || p.inputs.len() == 3, "fft takes a stage and optional real/imag coefficients")?;
    p.check(p.outputs.len() == 2, "fft has real and imaginary outputs")?;
    let stage = module.value_type(p.inputs[0]).as_scalar();
    p.check(stage.is_some_and(|s| s.is_int()), "stage must be an integer scalar")?;

    let (shape, elem) = shaped(module, p.outputs[0])?;
    let (imag, imag_elem) = shaped(module, p.outputs[1])?;
    p.check(!shape.is_empty(), "fft operates on rank >= 1")?;
    p.check(shapes_compatible(&shape, &imag) && elem == imag_elem, "real and imaginary parts differ")?;
    p.check(elem.is_float(), "fft needs float elements")?;
    if let Some(Dim::Static(n)) = shape.last() {
        p.check(n.is_power_of_two(), "fft length must be a power of two")?;
    }
    if let Some(s) = module.constant_int(p.inputs[0]) {
        // Blocks of `1 << s` elements must fit in the signal.
        let max_stage = match shape.last() {
            Some(Dim::Static(n)) => i64::from(n.trailing_zeros()),
            _ => i64::from(usize::BITS - 1),
        };
        p.check((1..=max_stage).contains(&s), "fft stage must be in 1..=log2(length)")?;
    }
    for coeff in &p.inputs[1..] {
        let (c, c_elem) = shaped(module, *coeff)?;
        p.check(c.len() == 1 && c_elem == elem, "coefficients must be rank 1 with the signal element type")?;
    }
    Ok(())
}

/// `1 << stage`, folded when the stage is constant.
fn block_len(b: &mut Builder, p: &StructuredParts, stage: ValueId) -> Result<SInt> {
    if let Some(s) = b.module().constant_int(stage) {
        let m = u32::try_from(s).ok().and_then(|s| 1usize.checked_shl(s));
        return m.map(SInt::Const).ok_or_else(|| p.error(format!("fft stage {s} is out of range")));
    }
    let stage = b.cast(stage, DType::Index)?;
    let one = b.const_index(1)?;
    Ok(SInt::Symbolic(b.binary(BinaryOp::Shl, one, stage)?))
}

pub(super) fn iteration_domain(b: &mut Builder, p: &StructuredParts) -> Result<Vec<LoopRange>> {
    let mut dims = b.dims(p.outputs[0])?;
    let last = dims.pop().ok_or_else(|| p.error("fft operates on rank >= 1"))?;
    let stride = block_len(b, p, p.inputs[0])?;
    let mut domain: Vec<LoopRange> = dims.into_iter().map(LoopRange::zero_based).collect();
    domain.push(LoopRange { offset: SInt::Const(0), size: last, stride });
    Ok(domain)
}

pub(super) fn scalar_body(b: &mut Builder, p: &StructuredParts, ivs: &[ValueId]) -> Result<()> {
    let (real, imag) = (p.outputs[0], p.outputs[1]);
    let coeffs = (p.inputs.len() == 3).then(|| (p.inputs[1], p.inputs[2]));
    let elem = b.elem_of(real)?;
    let (outer, k) = ivs.split_at(ivs.len() - 1);
    let k = k[0];

    let m = block_len(b, p, p.inputs[0])?;
    let half = b.div(m, SInt::Const(2))?;
    let half_v = b.materialize(half)?;
    let angle = match coeffs {
        Some(_) => None,
        None => {
            let neg_two_pi = b.constant(ConstValue::Float(-2.0 * PI), elem)?;
            let m_v = b.materialize(m)?;
            let m_f = b.cast(m_v, elem)?;
            Some(b.binary(BinaryOp::Fdiv, neg_two_pi, m_f)?)
        }
    };

    b.for_loop(SInt::Const(0), half, SInt::Const(1), &[], |b, j, _| {
        let (wr, wi) = match (coeffs, angle) {
            (Some((cr, ci)), _) => (b.load(cr, &[j])?, b.load(ci, &[j])?),
            (None, Some(angle)) => {
                let j_f = b.cast(j, elem)?;
                let theta = b.binary(BinaryOp::Mul, angle, j_f)?;
                (b.unary(UnaryOp::Cos, theta)?, b.unary(UnaryOp::Sin, theta)?)
            }
            (None, None) => return Err(p.error("missing twiddle source")),
        };
        let lhs = b.binary(BinaryOp::Add, k, j)?;
        let rhs = b.binary(BinaryOp::Add, lhs, half_v)?;
        let at = |i: ValueId| outer.iter().copied().chain(std::iter::once(i)).collect::<Vec<_>>();
        let (at_l, at_r) = (at(lhs), at(rhs));

        let (ar, ai) = (b.load(real, &at_l)?, b.load(imag, &at_l)?);
        let (br, bi) = (b.load(real, &at_r)?, b.load(imag, &at_r)?);
        // t = w * b
        let wr_br = b.binary(BinaryOp::Mul, wr, br)?;
        let wi_bi = b.binary(BinaryOp::Mul, wi, bi)?;
        let tr = b.binary(BinaryOp::Sub, wr_br, wi_bi)?;
        let wr_bi = b.binary(BinaryOp::Mul, wr, bi)?;
        let wi_br = b.binary(BinaryOp::Mul, wi, br)?;
        let ti = b.binary(BinaryOp::Add, wr_bi, wi_br)?;

        let sum_r = b.binary(BinaryOp::Add, ar, tr)?;
        let sum_i = b.binary(BinaryOp::Add, ai, ti)?;
        let diff_r = b.binary(BinaryOp::Sub, ar, tr)?;
        let diff_i = b.binary(BinaryOp::Sub, ai, ti)?;
        b.store(sum_r, real, &at_l)?;
        b.store(sum_i, imag, &at_l)?;
        b.store(diff_r, real, &at_r)?;
        b.store(diff_i, imag, &at_r)?;
        Ok(Vec::new())
    })?;
    Ok(())
}

impl Builder<'_> {
    /// Butterfly stage `stage` over `(real, imag)`, with optional precomputed twiddles.
    pub fn fft(&mut self, stage: ValueId, coeffs: Option<(ValueId, ValueId)>, real: ValueId, imag: ValueId) -> Result<OpId> {
        let inputs: Vec<ValueId> = match coeffs {
            Some((cr, ci)) => vec![stage, cr, ci],
            None => vec![stage],
        };
        self.create_structured(StructuredKind::Fft, &inputs, &[real, imag], &[], None)
    }
}
