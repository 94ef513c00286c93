//! Reference interpreter.
//!
//! Executes `func.func`s directly over the arena. Scalar results are
//! normalized to their declared dtype after every op, so the interpreter and
//! the constant folders agree bit for bit. Structured ops run from their own
//! reference semantics (see [`structured`]), not from the scalar bodies the
//! lowering emits, which makes the interpreter usable as an oracle for
//! tiling, lowering and bufferization.

mod structured;
pub mod value;

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::trace;
use trellis_dtype::DType;

use crate::error::*;
use crate::eval::{align_up, eval_binary_op, eval_unary_op};
use crate::module::{BlockId, Module, OpId, ValueId};
use crate::op::{Op, SliceAttrs};
use crate::sint::SInt;
use crate::ty::{Dim, Type};
use crate::types::{BinaryOp, ConstValue};

pub use value::{ByteView, Extents, MemRefView, NdArray, RuntimeValue, decode_scalar, encode_scalar, row_major};

pub struct Interpreter<'m> {
    module: &'m Module,
    env: HashMap<ValueId, RuntimeValue>,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self { module, env: HashMap::new() }
    }

    /// Run function `name` on `args` and return what it returns.
    #[tracing::instrument(skip_all, fields(func = name))]
    pub fn call(&mut self, name: &str, args: Vec<RuntimeValue>) -> Result<Vec<RuntimeValue>> {
        let func = self.module.lookup_func(name).context(UnknownFunctionSnafu { name })?;
        let body = self.module.regions(func)[0];
        let expected = self.module.block(body).args.len();
        ensure!(expected == args.len(), ArgumentCountSnafu { name, expected, actual: args.len() });
        self.run_block(body, &args)
    }

    /// Bind the block arguments, run the ops and return the terminator's operands.
    pub(crate) fn run_block(&mut self, block: BlockId, args: &[RuntimeValue]) -> Result<Vec<RuntimeValue>> {
        let module = self.module;
        for (arg, value) in module.block(block).args.iter().zip(args) {
            self.env.insert(*arg, value.clone());
        }
        for &op in &module.block(block).ops {
            if module.op(op).op.is_terminator() {
                return module.operands(op).iter().map(|v| self.get(*v).cloned()).collect();
            }
            self.exec(op)?;
        }
        Ok(Vec::new())
    }

    // ========================================================================
    // Value access
    // ========================================================================

    fn get(&self, value: ValueId) -> Result<&RuntimeValue> {
        self.env.get(&value).context(UnboundValueSnafu { value })
    }

    fn bind(&mut self, value: ValueId, rv: impl Into<RuntimeValue>) {
        self.env.insert(value, rv.into());
    }

    fn scalar(&self, value: ValueId) -> Result<ConstValue> {
        self.get(value)?.as_scalar().context(RuntimeKindSnafu { value, expected: "scalar" })
    }

    fn bool(&self, value: ValueId) -> Result<bool> {
        self.scalar(value)?.as_bool().context(RuntimeKindSnafu { value, expected: "i1" })
    }

    fn int(&self, value: ValueId) -> Result<i64> {
        self.scalar(value)?.as_int().context(RuntimeKindSnafu { value, expected: "integer" })
    }

    /// Non-negative integer, as used for indices and sizes.
    fn index(&self, value: ValueId) -> Result<usize> {
        to_index(self.int(value)?)
    }

    fn indices(&self, values: &[ValueId]) -> Result<Extents> {
        values.iter().map(|v| self.index(*v)).collect()
    }

    fn sint(&self, s: SInt) -> Result<usize> {
        match s {
            SInt::Const(c) => Ok(c),
            SInt::Symbolic(v) => self.index(v),
        }
    }

    fn tensor(&self, value: ValueId) -> Result<Rc<NdArray>> {
        match self.get(value)? {
            RuntimeValue::Tensor(t) => Ok(Rc::clone(t)),
            _ => RuntimeKindSnafu { value, expected: "tensor" }.fail(),
        }
    }

    fn memref(&self, value: ValueId) -> Result<MemRefView> {
        self.get(value)?.as_memref().cloned().context(RuntimeKindSnafu { value, expected: "memref" })
    }

    fn bytes(&self, value: ValueId) -> Result<ByteView> {
        self.get(value)?.as_bytes().cloned().context(RuntimeKindSnafu { value, expected: "byte buffer" })
    }

    /// Contents of a tensor or memref operand.
    fn array(&self, value: ValueId) -> Result<NdArray> {
        self.get(value)?.to_array().context(RuntimeKindSnafu { value, expected: "tensor or memref" })?
    }

    fn runtime_shape(&self, value: ValueId) -> Result<Extents> {
        match self.get(value)? {
            RuntimeValue::Tensor(t) => Ok(t.shape().into()),
            RuntimeValue::MemRef(m) => Ok(m.shape().into()),
            _ => RuntimeKindSnafu { value, expected: "tensor or memref" }.fail(),
        }
    }

    /// Concrete shape of `ty` with its dynamic dims taken from `dynamic`, in order.
    fn concrete_shape(&self, ty: &Type, dynamic: &[ValueId]) -> Result<Extents> {
        let mut next = dynamic.iter();
        ty.shape()
            .unwrap_or_default()
            .iter()
            .map(|d| match d {
                Dim::Static(n) => Ok(*n),
                Dim::Dynamic => self.index(*next.next().context(EvaluationFailedSnafu { name: "dynamic size" })?),
            })
            .collect()
    }

    fn slice_bounds(&self, attrs: &SliceAttrs, dynamic: &[ValueId]) -> Result<(Extents, Extents)> {
        let (offsets, sizes) = attrs.mixed(dynamic);
        let offsets = offsets.iter().map(|s| self.sint(*s)).collect::<Result<_>>()?;
        let sizes = sizes.iter().map(|s| self.sint(*s)).collect::<Result<_>>()?;
        Ok((offsets, sizes))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn exec(&mut self, op: OpId) -> Result<()> {
        let module = self.module;
        let data = module.op(op);
        let operands = &data.operands[..];
        let results = &data.results[..];
        let result_dtype = || results.first().and_then(|r| module.value_type(*r).as_scalar());
        trace!(op = %op, name = data.name(), "exec");

        match &data.op {
            Op::Constant(c) => self.bind(results[0], *c),
            Op::Binary(bin) => {
                let (a, b) = (self.scalar(operands[0])?, self.scalar(operands[1])?);
                let v = eval_binary_op(*bin, a, b).context(EvaluationFailedSnafu { name: data.name() })?;
                let v = result_dtype().map_or(v, |dt| v.cast(dt));
                self.bind(results[0], v);
            }
            Op::Unary(un) => {
                let v = eval_unary_op(*un, self.scalar(operands[0])?).context(EvaluationFailedSnafu { name: data.name() })?;
                let v = result_dtype().map_or(v, |dt| v.cast(dt));
                self.bind(results[0], v);
            }
            Op::Cast(dt) => {
                let v = self.scalar(operands[0])?.cast(*dt);
                self.bind(results[0], v);
            }
            Op::Select => {
                let chosen = if self.bool(operands[0])? { operands[1] } else { operands[2] };
                let v = self.get(chosen)?.clone();
                self.bind(results[0], v);
            }
            Op::Dim { index } => {
                let shape = self.runtime_shape(operands[0])?;
                let n = *shape.get(*index).context(DimOutOfRangeSnafu { dim: *index, rank: shape.len() })?;
                self.bind(results[0], ConstValue::Int(n as i64));
            }

            Op::DenseConstant(values) => {
                let ty = module.value_type(results[0]);
                let shape = self.concrete_shape(ty, &[])?;
                let elem = ty.elem().context(EvaluationFailedSnafu { name: data.name() })?;
                self.bind(results[0], NdArray::new(&shape, elem, values.clone())?);
            }
            Op::Empty | Op::AllocTensor => {
                let ty = module.value_type(results[0]);
                let shape = self.concrete_shape(ty, operands)?;
                let elem = ty.elem().context(EvaluationFailedSnafu { name: data.name() })?;
                self.bind(results[0], NdArray::zeros(&shape, elem));
            }
            Op::ExtractSlice(attrs) => {
                let (offsets, sizes) = self.slice_bounds(attrs, &operands[1..])?;
                let source = self.array(operands[0])?;
                self.bind(results[0], source.slice(&offsets, &sizes)?);
            }
            Op::InsertSlice(attrs) => {
                let (offsets, _) = self.slice_bounds(attrs, &operands[2..])?;
                let source = self.array(operands[0])?;
                let dest = self.tensor(operands[1])?;
                self.bind(results[0], dest.insert_slice(&source, &offsets)?);
            }
            Op::Extract => {
                let index = self.indices(&operands[1..])?;
                let v = self.tensor(operands[0])?.get(&index)?;
                self.bind(results[0], v);
            }
            Op::Insert => {
                let index = self.indices(&operands[2..])?;
                let mut array = NdArray::clone(&*self.tensor(operands[1])?);
                array.set(&index, self.scalar(operands[0])?)?;
                self.bind(results[0], array);
            }
            Op::ToTensor => {
                let array = self.memref(operands[0])?.to_array()?;
                self.bind(results[0], array);
            }
            Op::ToBuffer => {
                let view = match self.get(operands[0])? {
                    RuntimeValue::MemRef(m) => m.clone(),
                    _ => MemRefView::from_array(&*self.tensor(operands[0])?),
                };
                self.bind(results[0], view);
            }

            Op::Alloc { .. } | Op::Alloca => {
                let ty = module.value_type(results[0]);
                let memref = ty.as_memref().context(RuntimeKindSnafu { value: results[0], expected: "memref" })?;
                let shape = self.concrete_shape(ty, operands)?;
                self.bind(results[0], MemRefView::alloc(&shape, memref.elem, memref.space));
            }
            Op::Dealloc => self.memref(operands[0])?.free()?,
            Op::SubView(attrs) => {
                let (offsets, sizes) = self.slice_bounds(attrs, &operands[1..])?;
                let view = self.memref(operands[0])?.subview(&offsets, &sizes)?;
                self.bind(results[0], view);
            }
            Op::MemRefCast => {
                let view = self.memref(operands[0])?;
                self.bind(results[0], view);
            }
            Op::BufferConstant(values) => {
                let ty = module.value_type(results[0]);
                let shape = self.concrete_shape(ty, &[])?;
                let elem = ty.elem().context(EvaluationFailedSnafu { name: data.name() })?;
                self.bind(results[0], MemRefView::from_array(&NdArray::new(&shape, elem, values.clone())?));
            }
            Op::Load => {
                let index = self.indices(&operands[1..])?;
                let v = self.memref(operands[0])?.load(&index)?;
                self.bind(results[0], v);
            }
            Op::Store => {
                let index = self.indices(&operands[2..])?;
                let v = self.scalar(operands[0])?;
                self.memref(operands[1])?.store(&index, v)?;
            }
            Op::Copy => {
                let (source, target) = (self.memref(operands[0])?, self.memref(operands[1])?);
                source.copy_to(&target)?;
            }
            Op::Barrier | Op::Func { .. } => {}

            Op::Return | Op::Yield => return UnsupportedSnafu { name: data.name(), what: "execution outside a block end" }.fail(),
            Op::For => {
                let (lower, upper, step) = (self.index(operands[0])?, self.index(operands[1])?, self.index(operands[2])?);
                ensure!(step > 0, EvaluationFailedSnafu { name: "scf.for with zero step" });
                let mut carried: Vec<RuntimeValue> = operands[3..].iter().map(|v| self.get(*v).cloned()).collect::<Result<_>>()?;
                let body = data.regions[0];
                let mut iv = lower;
                while iv < upper {
                    let args: Vec<RuntimeValue> =
                        std::iter::once(RuntimeValue::Scalar(ConstValue::Int(iv as i64))).chain(carried).collect();
                    carried = self.run_block(body, &args)?;
                    iv += step;
                }
                for (r, v) in results.iter().zip(carried) {
                    self.bind(*r, v);
                }
            }
            Op::If => {
                let region = if self.bool(operands[0])? { data.regions[0] } else { data.regions[1] };
                let values = self.run_block(region, &[])?;
                for (r, v) in results.iter().zip(values) {
                    self.bind(*r, v);
                }
            }
            Op::DispatchRegion => {
                let values = self.run_block(data.regions[0], &[])?;
                for (r, v) in results.iter().zip(values) {
                    self.bind(*r, v);
                }
            }
            Op::Structured(_) => self.exec_structured(op)?,

            Op::RangeMin | Op::RangeMax => {
                let values = operands.iter().map(|v| self.int(*v)).collect::<Result<Vec<_>>>()?;
                let folded = if matches!(data.op, Op::RangeMin) { values.iter().min() } else { values.iter().max() };
                let v = folded.copied().context(EvaluationFailedSnafu { name: data.name() })?;
                self.bind(results[0], ConstValue::Int(v));
            }
            Op::RangeExtents => {
                let half = operands.len() / 2;
                let offsets = operands[..half].iter().map(|v| self.int(*v)).collect::<Result<Vec<_>>>()?;
                let lengths = operands[half..].iter().map(|v| self.int(*v)).collect::<Result<Vec<_>>>()?;
                let min = offsets.iter().min().copied().context(EvaluationFailedSnafu { name: data.name() })?;
                let max = offsets.iter().zip(&lengths).map(|(o, l)| o + l - 1).max().unwrap_or(min);
                self.bind(results[0], ConstValue::Int(min));
                self.bind(results[1], ConstValue::Int(max));
            }
            Op::Align => {
                let (value, alignment) = (self.int(operands[0])?, self.int(operands[1])?);
                ensure!(alignment > 0, EvaluationFailedSnafu { name: data.name() });
                self.bind(results[0], ConstValue::Int(align_up(value, alignment)));
            }
            Op::SizeOf(dt) => self.bind(results[0], ConstValue::Int(dt.bytes() as i64)),

            Op::BufferAlloc => {
                let size = self.index(operands[0])?;
                self.bind(results[0], RuntimeValue::Bytes(ByteView::alloc(size)));
            }
            Op::BufferSubspan => {
                let (offset, length) = (self.index(operands[2])?, self.index(operands[3])?);
                let view = self.bytes(operands[0])?.subspan(offset, length)?;
                self.bind(results[0], RuntimeValue::Bytes(view));
            }
            Op::BufferSize => {
                let len = self.bytes(operands[0])?.len();
                self.bind(results[0], ConstValue::Int(len as i64));
            }
            Op::BufferLoad => {
                let dt = result_dtype().context(EvaluationFailedSnafu { name: data.name() })?;
                let raw = self.bytes(operands[0])?.read(self.index(operands[2])?, dt.bytes())?;
                let v = decode_scalar(&raw, dt).context(EvaluationFailedSnafu { name: data.name() })?;
                self.bind(results[0], v);
            }
            Op::BufferStore => {
                let dt = self.dtype_of(operands[0])?;
                let raw = encode_scalar(self.scalar(operands[0])?, dt);
                self.bytes(operands[1])?.write(self.index(operands[3])?, &raw)?;
            }
            Op::BufferFill => {
                let dt = self.dtype_of(operands[0])?;
                let pattern = encode_scalar(self.scalar(operands[0])?, dt);
                let (offset, length) = (self.index(operands[3])?, self.index(operands[4])?);
                let filled: Vec<u8> = pattern.iter().copied().cycle().take(length).collect();
                self.bytes(operands[1])?.write(offset, &filled)?;
            }
            Op::BufferCopy => {
                let length = self.index(operands[6])?;
                let raw = self.bytes(operands[0])?.read(self.index(operands[2])?, length)?;
                self.bytes(operands[3])?.write(self.index(operands[5])?, &raw)?;
            }
            Op::BufferSlice => {
                let raw = self.bytes(operands[0])?.read(self.index(operands[2])?, self.index(operands[3])?)?;
                self.bind(results[0], RuntimeValue::Bytes(ByteView::from_bytes(raw)));
            }
            Op::BufferCompare => {
                let length = self.index(operands[6])?;
                let lhs = self.bytes(operands[0])?.read(self.index(operands[2])?, length)?;
                let rhs = self.bytes(operands[3])?.read(self.index(operands[5])?, length)?;
                self.bind(results[0], ConstValue::Bool(lhs == rhs));
            }
        }
        Ok(())
    }

    fn dtype_of(&self, value: ValueId) -> Result<DType> {
        let ty = self.module.value_type(value);
        ty.as_scalar().context(UnexpectedTypeSnafu { value, expected: "scalar", actual: ty.clone() })
    }

    /// `a op b` normalized to `dtype`, as a `Binary` op would compute it.
    fn arith(&self, op: BinaryOp, a: ConstValue, b: ConstValue, dtype: DType) -> Result<ConstValue> {
        let v = eval_binary_op(op, a, b).context(EvaluationFailedSnafu { name: "arith.binary" })?;
        Ok(if op.is_comparison() { v } else { v.cast(dtype) })
    }

    /// Evaluate a payload region on scalar arguments.
    fn payload(&mut self, block: BlockId, args: &[ConstValue]) -> Result<SmallVec<[ConstValue; 2]>> {
        let args: Vec<RuntimeValue> = args.iter().copied().map(RuntimeValue::Scalar).collect();
        let values = self.run_block(block, &args)?;
        values
            .iter()
            .map(|v| v.as_scalar().context(EvaluationFailedSnafu { name: "payload yield" }))
            .collect()
    }
}

fn to_index(v: i64) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::NegativeIndex { value: v })
}
