//! Op construction at an insertion point.
//!
//! The builder infers result types, folds index arithmetic on [`SInt`]
//! eagerly and materializes `arith` ops only when a runtime value is
//! involved.

use std::collections::HashMap;

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use trellis_dtype::DType;

use crate::error::*;
use crate::eval::eval_binary_op;
use crate::module::{BlockId, Module, OpId, ValueId};
use crate::op::{Op, SliceAttrs};
use crate::sint::{SInt, SIntVec};
use crate::ty::{Dim, Layout, MemRefType, Shape, TensorType, Type};
use crate::types::{BinaryOp, ConstValue, UnaryOp};

/// Where the next op is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    End(BlockId),
}

/// Value and block correspondence used when cloning IR.
#[derive(Debug, Clone, Default)]
pub struct IrMapping {
    values: HashMap<ValueId, ValueId>,
}

impl IrMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, from: ValueId, to: ValueId) {
        self.values.insert(from, to);
    }

    /// Mapped value, or the value itself if unmapped.
    pub fn lookup(&self, value: ValueId) -> ValueId {
        self.values.get(&value).copied().unwrap_or(value)
    }

    pub fn contains(&self, value: ValueId) -> bool {
        self.values.contains_key(&value)
    }
}

pub struct Builder<'m> {
    module: &'m mut Module,
    ip: InsertPoint,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, ip: InsertPoint) -> Self {
        Self { module, ip }
    }

    pub fn at_end(module: &'m mut Module, block: BlockId) -> Self {
        Self::new(module, InsertPoint::End(block))
    }

    pub fn before(module: &'m mut Module, op: OpId) -> Self {
        Self::new(module, InsertPoint::Before(op))
    }

    pub fn after(module: &'m mut Module, op: OpId) -> Result<Self> {
        let ip = ip_after(module, op)?;
        Ok(Self::new(module, ip))
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    pub fn ty(&self, value: ValueId) -> &Type {
        self.module.value_type(value)
    }

    // ========================================================================
    // Insertion point
    // ========================================================================

    pub fn ip(&self) -> InsertPoint {
        self.ip
    }

    pub fn set_start(&mut self, block: BlockId) {
        self.ip = match self.module.block(block).ops.first() {
            Some(first) => InsertPoint::Before(*first),
            None => InsertPoint::End(block),
        };
    }

    /// Before the terminator of `block`, or at its end if it has none.
    pub fn set_before_terminator(&mut self, block: BlockId) {
        self.ip = match self.module.terminator(block) {
            Some(term) => InsertPoint::Before(term),
            None => InsertPoint::End(block),
        };
    }

    /// Run `f` at another insertion point, restoring the current one afterwards.
    pub fn with_ip<T>(&mut self, ip: InsertPoint, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.ip;
        self.ip = ip;
        let out = f(self);
        self.ip = saved;
        out
    }

    // ========================================================================
    // Generic creation
    // ========================================================================

    /// Attach a detached op at the insertion point.
    pub fn insert(&mut self, op: OpId) -> Result<OpId> {
        match self.ip {
            InsertPoint::Before(before) => self.module.move_op_before(op, before)?,
            InsertPoint::End(block) => self.module.append_op(block, op),
        }
        Ok(op)
    }

    pub fn create_with_regions(
        &mut self,
        kind: Op,
        operands: impl IntoIterator<Item = ValueId>,
        result_types: impl IntoIterator<Item = Type>,
        regions: impl IntoIterator<Item = BlockId>,
    ) -> Result<OpId> {
        let op = self.module.create_op(kind, operands, result_types, regions);
        self.insert(op)
    }

    pub fn create(
        &mut self,
        kind: Op,
        operands: impl IntoIterator<Item = ValueId>,
        result_types: impl IntoIterator<Item = Type>,
    ) -> Result<OpId> {
        self.create_with_regions(kind, operands, result_types, [])
    }

    /// Create a single-result op and return the result.
    pub fn create1(&mut self, kind: Op, operands: impl IntoIterator<Item = ValueId>, ty: Type) -> Result<ValueId> {
        let op = self.create(kind, operands, [ty])?;
        Ok(self.module.result(op, 0))
    }

    // ========================================================================
    // Scalars
    // ========================================================================

    pub fn scalar_dtype(&self, value: ValueId) -> Result<DType> {
        let ty = self.ty(value);
        ty.as_scalar().context(UnexpectedTypeSnafu { value, expected: "scalar", actual: ty.clone() })
    }

    pub fn constant(&mut self, value: ConstValue, dtype: DType) -> Result<ValueId> {
        self.create1(Op::Constant(value.cast(dtype)), [], Type::Scalar(dtype))
    }

    pub fn const_index(&mut self, value: usize) -> Result<ValueId> {
        self.constant(ConstValue::Int(value as i64), DType::Index)
    }

    pub fn const_bool(&mut self, value: bool) -> Result<ValueId> {
        self.constant(ConstValue::Bool(value), DType::Bool)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let (l, r) = (self.scalar_dtype(lhs)?, self.scalar_dtype(rhs)?);
        ensure!(l == r, DTypeMismatchSnafu { op, lhs: l, rhs: r });
        let result = if op.is_comparison() { DType::Bool } else { l };
        self.create1(Op::Binary(op), [lhs, rhs], Type::Scalar(result))
    }

    pub fn unary(&mut self, op: UnaryOp, x: ValueId) -> Result<ValueId> {
        let dtype = self.scalar_dtype(x)?;
        ensure!(
            !matches!(op, UnaryOp::Sin | UnaryOp::Cos | UnaryOp::Sqrt) || dtype.is_float(),
            InvalidDTypeForUnaryOpSnafu { op, dtype }
        );
        self.create1(Op::Unary(op), [x], Type::Scalar(dtype))
    }

    /// Convert `x` to `dtype`; a no-op when the types already match.
    pub fn cast(&mut self, x: ValueId, dtype: DType) -> Result<ValueId> {
        if self.scalar_dtype(x)? == dtype {
            return Ok(x);
        }
        self.create1(Op::Cast(dtype), [x], Type::Scalar(dtype))
    }

    pub fn select(&mut self, cond: ValueId, t: ValueId, f: ValueId) -> Result<ValueId> {
        let ty = self.ty(t).clone();
        self.create1(Op::Select, [cond, t, f], ty)
    }

    // ========================================================================
    // Index arithmetic on SInt
    // ========================================================================

    /// Index value for `s`, emitting a constant if needed.
    pub fn materialize(&mut self, s: SInt) -> Result<ValueId> {
        match s {
            SInt::Const(c) => self.const_index(c),
            SInt::Symbolic(v) => Ok(v),
        }
    }

    /// `SInt` view of an index value, seeing through constants.
    pub fn fold(&self, value: ValueId) -> SInt {
        match self.module.constant_int(value) {
            Some(c) if c >= 0 => SInt::Const(c as usize),
            _ => SInt::Symbolic(value),
        }
    }

    fn sint_binary(&mut self, op: BinaryOp, a: SInt, b: SInt) -> Result<SInt> {
        let (a, b) = (self.fold_sint(a), self.fold_sint(b));
        if let (SInt::Const(x), SInt::Const(y)) = (a, b) {
            let folded = eval_binary_op(op, ConstValue::Int(x as i64), ConstValue::Int(y as i64))
                .and_then(|v| v.as_int())
                .context(EvaluationFailedSnafu { name: "index arithmetic" })?;
            ensure!(folded >= 0, NegativeIndexSnafu { value: folded });
            return Ok(SInt::Const(folded as usize));
        }
        let identity = match op {
            BinaryOp::Add if b.is(0) => Some(a),
            BinaryOp::Add if a.is(0) => Some(b),
            BinaryOp::Sub if b.is(0) => Some(a),
            BinaryOp::Sub if a == b => Some(SInt::Const(0)),
            BinaryOp::Mul if b.is(1) => Some(a),
            BinaryOp::Mul if a.is(1) => Some(b),
            BinaryOp::Mul if a.is(0) || b.is(0) => Some(SInt::Const(0)),
            BinaryOp::Idiv | BinaryOp::CeilDiv if b.is(1) => Some(a),
            BinaryOp::Mod if b.is(1) => Some(SInt::Const(0)),
            BinaryOp::Min | BinaryOp::Max if a == b => Some(a),
            _ => None,
        };
        if let Some(v) = identity {
            return Ok(v);
        }
        let (x, y) = (self.materialize(a)?, self.materialize(b)?);
        Ok(SInt::Symbolic(self.binary(op, x, y)?))
    }

    fn fold_sint(&self, s: SInt) -> SInt {
        match s {
            SInt::Symbolic(v) => self.fold(v),
            c => c,
        }
    }

    pub fn add(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Idiv, a, b)
    }

    pub fn rem(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Mod, a, b)
    }

    pub fn ceil_div(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::CeilDiv, a, b)
    }

    pub fn min(&mut self, a: SInt, b: SInt) -> Result<SInt> {
        self.sint_binary(BinaryOp::Min, a, b)
    }

    // ========================================================================
    // Shapes
    // ========================================================================

    fn shaped(&self, value: ValueId) -> Result<(Shape, DType)> {
        let ty = self.ty(value);
        match ty {
            Type::Tensor(t) => Ok((t.shape.clone(), t.elem)),
            Type::MemRef(m) => Ok((m.shape.clone(), m.elem)),
            _ => UnexpectedTypeSnafu { value, expected: "tensor or memref", actual: ty.clone() }.fail(),
        }
    }

    pub fn shape_of(&self, value: ValueId) -> Result<Shape> {
        Ok(self.shaped(value)?.0)
    }

    pub fn elem_of(&self, value: ValueId) -> Result<DType> {
        Ok(self.shaped(value)?.1)
    }

    /// Extent of dimension `index`, folded when static.
    pub fn dim(&mut self, source: ValueId, index: usize) -> Result<SInt> {
        let shape = self.shape_of(source)?;
        let dim = shape.get(index).context(DimOutOfRangeSnafu { dim: index, rank: shape.len() })?;
        match dim {
            Dim::Static(n) => Ok(SInt::Const(*n)),
            Dim::Dynamic => Ok(SInt::Symbolic(self.create1(Op::Dim { index }, [source], Type::index())?)),
        }
    }

    /// Extents of every dimension.
    pub fn dims(&mut self, source: ValueId) -> Result<SIntVec> {
        let rank = self.shape_of(source)?.len();
        (0..rank).map(|d| self.dim(source, d)).collect()
    }

    /// Tensor with unspecified contents.
    pub fn empty(&mut self, sizes: &[SInt], elem: DType) -> Result<ValueId> {
        let (shape, dynamic) = split_sizes(sizes);
        self.create1(Op::Empty, dynamic, Type::Tensor(TensorType::new(shape, elem)))
    }

    pub fn alloc(&mut self, ty: MemRefType, dynamic_sizes: &[ValueId], alignment: Option<usize>) -> Result<ValueId> {
        self.create1(Op::Alloc { alignment }, dynamic_sizes.iter().copied(), Type::MemRef(ty))
    }

    pub fn extract_slice(&mut self, source: ValueId, offsets: &[SInt], sizes: &[SInt]) -> Result<ValueId> {
        let (shape, elem) = self.shaped(source)?;
        check_slice_rank(shape.len(), offsets, sizes)?;
        let (attrs, dynamic) = SliceAttrs::from_mixed(offsets, sizes);
        let (result_shape, _) = split_sizes(sizes);
        let ty = Type::Tensor(TensorType::new(result_shape, elem));
        self.create1(Op::ExtractSlice(attrs), std::iter::once(source).chain(dynamic), ty)
    }

    pub fn insert_slice(&mut self, source: ValueId, dest: ValueId, offsets: &[SInt], sizes: &[SInt]) -> Result<ValueId> {
        let (shape, _) = self.shaped(dest)?;
        check_slice_rank(shape.len(), offsets, sizes)?;
        let (attrs, dynamic) = SliceAttrs::from_mixed(offsets, sizes);
        let ty = self.ty(dest).clone();
        self.create1(Op::InsertSlice(attrs), [source, dest].into_iter().chain(dynamic), ty)
    }

    pub fn subview(&mut self, source: ValueId, offsets: &[SInt], sizes: &[SInt]) -> Result<ValueId> {
        let ty = self.ty(source).clone();
        let memref = ty.as_memref().context(UnexpectedTypeSnafu { value: source, expected: "memref", actual: ty.clone() })?;
        check_slice_rank(memref.rank(), offsets, sizes)?;
        let (attrs, dynamic) = SliceAttrs::from_mixed(offsets, sizes);
        let result = subview_type(memref, offsets, sizes);
        self.create1(Op::SubView(attrs), std::iter::once(source).chain(dynamic), Type::MemRef(result))
    }

    /// `extract_slice` on tensors, `subview` on memrefs.
    pub fn slice(&mut self, source: ValueId, offsets: &[SInt], sizes: &[SInt]) -> Result<ValueId> {
        if self.ty(source).is_memref() {
            self.subview(source, offsets, sizes)
        } else {
            self.extract_slice(source, offsets, sizes)
        }
    }

    pub fn load(&mut self, memref: ValueId, indices: &[ValueId]) -> Result<ValueId> {
        let elem = self.elem_of(memref)?;
        self.create1(Op::Load, std::iter::once(memref).chain(indices.iter().copied()), Type::Scalar(elem))
    }

    pub fn store(&mut self, value: ValueId, memref: ValueId, indices: &[ValueId]) -> Result<OpId> {
        self.create(Op::Store, [value, memref].into_iter().chain(indices.iter().copied()), [])
    }

    pub fn extract(&mut self, tensor: ValueId, indices: &[ValueId]) -> Result<ValueId> {
        let elem = self.elem_of(tensor)?;
        self.create1(Op::Extract, std::iter::once(tensor).chain(indices.iter().copied()), Type::Scalar(elem))
    }

    /// `extract` or `load`, depending on the source.
    pub fn read(&mut self, source: ValueId, indices: &[ValueId]) -> Result<ValueId> {
        if self.ty(source).is_memref() { self.load(source, indices) } else { self.extract(source, indices) }
    }

    pub fn copy(&mut self, source: ValueId, target: ValueId) -> Result<OpId> {
        self.create(Op::Copy, [source, target], [])
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    pub fn yield_op(&mut self, values: &[ValueId]) -> Result<OpId> {
        self.create(Op::Yield, values.iter().copied(), [])
    }

    pub fn return_op(&mut self, values: &[ValueId]) -> Result<OpId> {
        self.create(Op::Return, values.iter().copied(), [])
    }

    /// `scf.for` whose body is produced by `body(builder, iv, iter_args)`; the body returns the yielded values.
    pub fn for_loop<F>(&mut self, lower: SInt, upper: SInt, step: SInt, inits: &[ValueId], body: F) -> Result<OpId>
    where
        F: FnOnce(&mut Self, ValueId, &[ValueId]) -> Result<Vec<ValueId>>,
    {
        let bounds = [self.materialize(lower)?, self.materialize(upper)?, self.materialize(step)?];
        let init_types: Vec<Type> = inits.iter().map(|v| self.ty(*v).clone()).collect();
        let arg_types: Vec<Type> = std::iter::once(Type::index()).chain(init_types.iter().cloned()).collect();
        let block = self.module.create_block(&arg_types);
        let op = self.create_with_regions(Op::For, bounds.into_iter().chain(inits.iter().copied()), init_types, [block])?;
        let args = self.module.block(block).args.clone();
        let yields = self.with_ip(InsertPoint::End(block), |b| body(b, args[0], &args[1..]))?;
        self.with_ip(InsertPoint::End(block), |b| b.yield_op(&yields))?;
        Ok(op)
    }

    pub fn if_else<T, E>(&mut self, cond: ValueId, result_types: &[Type], then: T, otherwise: E) -> Result<OpId>
    where
        T: FnOnce(&mut Self) -> Result<Vec<ValueId>>,
        E: FnOnce(&mut Self) -> Result<Vec<ValueId>>,
    {
        let then_block = self.module.create_block(&[]);
        let else_block = self.module.create_block(&[]);
        let op = self.create_with_regions(Op::If, [cond], result_types.iter().cloned(), [then_block, else_block])?;
        let then_values = self.with_ip(InsertPoint::End(then_block), then)?;
        self.with_ip(InsertPoint::End(then_block), |b| b.yield_op(&then_values))?;
        let else_values = self.with_ip(InsertPoint::End(else_block), otherwise)?;
        self.with_ip(InsertPoint::End(else_block), |b| b.yield_op(&else_values))?;
        Ok(op)
    }

    /// `func.func` at the insertion point; `body` returns the returned values.
    pub fn func<F>(&mut self, name: &str, arg_types: &[Type], result_types: &[Type], body: F) -> Result<OpId>
    where
        F: FnOnce(&mut Self, &[ValueId]) -> Result<Vec<ValueId>>,
    {
        let block = self.module.create_block(arg_types);
        let kind = Op::Func { name: name.to_string(), results: result_types.to_vec() };
        let op = self.create_with_regions(kind, [], [], [block])?;
        let args = self.module.block(block).args.clone();
        let returned = self.with_ip(InsertPoint::End(block), |b| body(b, &args))?;
        self.with_ip(InsertPoint::End(block), |b| b.return_op(&returned))?;
        Ok(op)
    }

    // ========================================================================
    // Cloning
    // ========================================================================

    /// Deep-clone `op` (regions included) at the insertion point, remapping operands through `mapping`.
    pub fn clone_op(&mut self, op: OpId, mapping: &mut IrMapping) -> Result<OpId> {
        let cloned = self.module.clone_op_detached(op, mapping);
        self.insert(cloned)
    }

    /// Clone the non-terminator ops of `block` at the insertion point with its arguments bound to `args`.
    ///
    /// Returns the values the terminator would have produced.
    pub fn inline_block(&mut self, block: BlockId, args: &[ValueId]) -> Result<SmallVec<[ValueId; 2]>> {
        let mut mapping = IrMapping::new();
        for (arg, value) in self.module.block(block).args.clone().iter().zip(args) {
            mapping.map(*arg, *value);
        }
        let ops = self.module.block(block).ops.clone();
        let mut yielded = SmallVec::new();
        for op in ops {
            if self.module.op(op).op.is_terminator() {
                yielded = self.module.operands(op).iter().map(|v| mapping.lookup(*v)).collect();
                break;
            }
            self.clone_op(op, &mut mapping)?;
        }
        Ok(yielded)
    }
}

fn ip_after(module: &Module, op: OpId) -> Result<InsertPoint> {
    let (block, pos) = module.position(op)?;
    Ok(match module.block(block).ops.get(pos + 1) {
        Some(next) => InsertPoint::Before(*next),
        None => InsertPoint::End(block),
    })
}

impl Module {
    /// Deep-clone `op` without attaching it.
    pub fn clone_op_detached(&mut self, op: OpId, mapping: &mut IrMapping) -> OpId {
        let data = self.op(op).clone();
        let regions: SmallVec<[BlockId; 2]> = data.regions.iter().map(|r| self.clone_region(*r, mapping)).collect();
        let operands: SmallVec<[ValueId; 4]> = data.operands.iter().map(|v| mapping.lookup(*v)).collect();
        let result_types: Vec<Type> = data.results.iter().map(|r| self.value_type(*r).clone()).collect();
        let cloned = self.create_op(data.op.clone(), operands, result_types, regions);
        for (old, new) in data.results.iter().zip(self.results(cloned).to_vec()) {
            mapping.map(*old, new);
        }
        cloned
    }

    /// Deep-clone a block into a new detached block.
    pub fn clone_region(&mut self, region: BlockId, mapping: &mut IrMapping) -> BlockId {
        let args = self.block(region).args.clone();
        let arg_types: Vec<Type> = args.iter().map(|a| self.value_type(*a).clone()).collect();
        let block = self.create_block(&arg_types);
        for (old, new) in args.iter().zip(self.block(block).args.clone()) {
            mapping.map(*old, new);
        }
        for inner in self.block(region).ops.clone() {
            let cloned = self.clone_op_detached(inner, mapping);
            self.append_op(block, cloned);
        }
        block
    }
}

/// Shape for mixed sizes, plus the dynamic size operands in order.
pub fn split_sizes(sizes: &[SInt]) -> (Shape, SmallVec<[ValueId; 4]>) {
    let mut dynamic = SmallVec::new();
    let shape = sizes
        .iter()
        .map(|s| match s {
            SInt::Const(c) => Dim::Static(*c),
            SInt::Symbolic(v) => {
                dynamic.push(*v);
                Dim::Dynamic
            }
        })
        .collect();
    (shape, dynamic)
}

fn check_slice_rank(rank: usize, offsets: &[SInt], sizes: &[SInt]) -> Result<()> {
    ensure!(
        offsets.len() == rank && sizes.len() == rank,
        SliceRankMismatchSnafu { rank, offsets: offsets.len(), sizes: sizes.len() }
    );
    Ok(())
}

/// Result type of a unit-stride subview.
pub fn subview_type(source: &MemRefType, offsets: &[SInt], sizes: &[SInt]) -> MemRefType {
    let (shape, _) = split_sizes(sizes);
    let all_zero = offsets.iter().all(|o| o.is(0));
    if source.layout.is_identity() && all_zero && shape == source.shape {
        return MemRefType { shape, ..source.clone() };
    }
    let (strides, base) = source.strides_and_offset();
    let offset = base.and_then(|base| {
        offsets.iter().zip(&strides).try_fold(base, |acc, (o, s)| match (o.as_const(), s) {
            (Some(o), Some(s)) => Some(acc + o as i64 * s),
            _ => None,
        })
    });
    MemRefType { shape, elem: source.elem, layout: Layout::Strided { offset, strides }, space: source.space }
}
