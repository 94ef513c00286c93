//! Operation kinds and their attributes.
//!
//! Operands live uniformly on the op (see [`crate::module::OpData`]); each
//! variant documents its operand layout. Attributes that may be static or
//! dynamic use the mixed encoding: a static list with `None` holes, and one
//! trailing operand per hole, in order.

use smallvec::SmallVec;
use trellis_dtype::DType;

use crate::module::ValueId;
use crate::sint::{SInt, SIntVec};
use crate::structured::StructuredOp;
use crate::ty::Type;
use crate::types::{BinaryOp, ConstValue, UnaryOp};

/// Static offsets and sizes of a slice; `None` entries are dynamic operands.
///
/// Strides are always one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceAttrs {
    pub static_offsets: SmallVec<[Option<usize>; 4]>,
    pub static_sizes: SmallVec<[Option<usize>; 4]>,
}

impl SliceAttrs {
    /// Split mixed offsets and sizes into attributes and dynamic operands.
    pub fn from_mixed(offsets: &[SInt], sizes: &[SInt]) -> (Self, SmallVec<[ValueId; 4]>) {
        let mut dynamic = SmallVec::new();
        let mut split = |values: &[SInt]| -> SmallVec<[Option<usize>; 4]> {
            values
                .iter()
                .map(|v| match v {
                    SInt::Const(c) => Some(*c),
                    SInt::Symbolic(id) => {
                        dynamic.push(*id);
                        None
                    }
                })
                .collect()
        };
        let static_offsets = split(offsets);
        let static_sizes = split(sizes);
        (Self { static_offsets, static_sizes }, dynamic)
    }

    pub fn rank(&self) -> usize {
        self.static_offsets.len()
    }

    pub fn num_dynamic(&self) -> usize {
        self.static_offsets.iter().chain(&self.static_sizes).filter(|v| v.is_none()).count()
    }

    /// Rebuild mixed offsets and sizes from the dynamic operands.
    pub fn mixed(&self, dynamic: &[ValueId]) -> (SIntVec, SIntVec) {
        let mut next = dynamic.iter();
        let mut join = |values: &[Option<usize>]| -> SIntVec {
            values
                .iter()
                .map(|v| match v {
                    Some(c) => SInt::Const(*c),
                    None => next.next().map_or(SInt::Const(0), |id| SInt::Symbolic(*id)),
                })
                .collect()
        };
        let offsets = join(&self.static_offsets);
        let sizes = join(&self.static_sizes);
        (offsets, sizes)
    }
}

/// Operation kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ========================================================================
    // Scalar
    // ========================================================================
    /// Scalar constant. No operands.
    Constant(ConstValue),
    /// `[lhs, rhs]`
    Binary(BinaryOp),
    /// `[x]`
    Unary(UnaryOp),
    /// `[x]` converted to the given dtype.
    Cast(DType),
    /// `[cond, true_value, false_value]`; values may be scalars or shaped.
    Select,
    /// `[source]` → extent of dimension `index` as `index`.
    Dim { index: usize },

    // ========================================================================
    // Tensor
    // ========================================================================
    /// Constant tensor with row-major elements. No operands.
    DenseConstant(Vec<ConstValue>),
    /// `[dynamic sizes...]` → tensor with unspecified contents.
    Empty,
    /// `[dynamic sizes...]` → tensor that will be backed by a fresh allocation.
    AllocTensor,
    /// `[source, dynamic offsets/sizes...]`
    ExtractSlice(SliceAttrs),
    /// `[source, dest, dynamic offsets/sizes...]`
    InsertSlice(SliceAttrs),
    /// `[tensor, indices...]` → scalar.
    Extract,
    /// `[value, tensor, indices...]` → tensor.
    Insert,
    /// `[memref]` → tensor with the memref's contents.
    ToTensor,
    /// `[tensor]` → memref.
    ToBuffer,

    // ========================================================================
    // Memref
    // ========================================================================
    /// `[dynamic sizes...]`
    Alloc { alignment: Option<usize> },
    /// `[dynamic sizes...]`, stack lifetime.
    Alloca,
    /// `[memref]`
    Dealloc,
    /// `[source, dynamic offsets/sizes...]`
    SubView(SliceAttrs),
    /// `[source]` reinterpreted with the result layout.
    MemRefCast,
    /// Constant memref (identity layout). No operands.
    BufferConstant(Vec<ConstValue>),
    /// `[memref, indices...]` → scalar.
    Load,
    /// `[value, memref, indices...]`
    Store,
    /// `[source, target]`
    Copy,
    /// Workgroup synchronization.
    Barrier,

    // ========================================================================
    // Control flow
    // ========================================================================
    /// Function with a single body block; block args are the parameters.
    Func { name: String, results: Vec<Type> },
    /// `[values...]`, terminates `Func` and `DispatchRegion` bodies.
    Return,
    /// `[lower, upper, step, inits...]`; body args are `(iv, iter_args...)`.
    For,
    /// `[cond]`; regions are `then` and `else`.
    If,
    /// `[values...]`, terminates loop, branch and payload bodies.
    Yield,
    /// `[dynamic result dims...]` flattened over results in order.
    ///
    /// Single body region terminated by `Return`.
    DispatchRegion,

    /// Structured operation; see [`StructuredOp`] for the operand layout.
    Structured(StructuredOp),

    // ========================================================================
    // Utility
    // ========================================================================
    /// `[values...]` → minimum.
    RangeMin,
    /// `[values...]` → maximum.
    RangeMax,
    /// `[offsets..., lengths...]` → `(min offset, max inclusive end)`.
    RangeExtents,
    /// `[value, alignment]` → value rounded up to a multiple of alignment.
    Align,
    /// Byte size of one element. No operands.
    SizeOf(DType),

    // ========================================================================
    // Byte buffers
    // ========================================================================
    /// `[size]` → zero-filled byte buffer.
    BufferAlloc,
    /// `[source, source_size, offset, length]` → aliasing sub-range.
    BufferSubspan,
    /// `[buffer]` → size in bytes.
    BufferSize,
    /// `[source, source_size, offset]` → scalar of the result dtype.
    BufferLoad,
    /// `[value, target, target_size, offset]`
    BufferStore,
    /// `[value, target, target_size, offset, length]`
    BufferFill,
    /// `[source, source_size, source_offset, target, target_size, target_offset, length]`
    BufferCopy,
    /// `[source, source_size, offset, length]` → fresh copy of the range.
    BufferSlice,
    /// `[lhs, lhs_size, lhs_offset, rhs, rhs_size, rhs_offset, length]` → `i1`.
    BufferCompare,
}

impl Op {
    /// Dialect-qualified op name used by the printer and in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Constant(_) => "arith.constant",
            Op::Binary(_) => "arith.binary",
            Op::Unary(_) => "arith.unary",
            Op::Cast(_) => "arith.cast",
            Op::Select => "arith.select",
            Op::Dim { .. } => "shape.dim",
            Op::DenseConstant(_) => "tensor.constant",
            Op::Empty => "tensor.empty",
            Op::AllocTensor => "tensor.alloc",
            Op::ExtractSlice(_) => "tensor.extract_slice",
            Op::InsertSlice(_) => "tensor.insert_slice",
            Op::Extract => "tensor.extract",
            Op::Insert => "tensor.insert",
            Op::ToTensor => "bufferization.to_tensor",
            Op::ToBuffer => "bufferization.to_buffer",
            Op::Alloc { .. } => "memref.alloc",
            Op::Alloca => "memref.alloca",
            Op::Dealloc => "memref.dealloc",
            Op::SubView(_) => "memref.subview",
            Op::MemRefCast => "memref.cast",
            Op::BufferConstant(_) => "memref.constant",
            Op::Load => "memref.load",
            Op::Store => "memref.store",
            Op::Copy => "memref.copy",
            Op::Barrier => "gpu.barrier",
            Op::Func { .. } => "func.func",
            Op::Return => "func.return",
            Op::For => "scf.for",
            Op::If => "scf.if",
            Op::Yield => "scf.yield",
            Op::DispatchRegion => "flow.dispatch.region",
            Op::Structured(s) => s.kind.name(),
            Op::RangeMin => "util.range.min",
            Op::RangeMax => "util.range.max",
            Op::RangeExtents => "util.range.extents",
            Op::Align => "util.align",
            Op::SizeOf(_) => "util.sizeof",
            Op::BufferAlloc => "util.buffer.alloc",
            Op::BufferSubspan => "util.buffer.subspan",
            Op::BufferSize => "util.buffer.size",
            Op::BufferLoad => "util.buffer.load",
            Op::BufferStore => "util.buffer.store",
            Op::BufferFill => "util.buffer.fill",
            Op::BufferCopy => "util.buffer.copy",
            Op::BufferSlice => "util.buffer.slice",
            Op::BufferCompare => "util.buffer.compare",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Return | Op::Yield)
    }

    /// Ops with no side effects: removable when their results are unused.
    pub fn is_pure(&self) -> bool {
        match self {
            Op::Constant(_)
            | Op::Binary(_)
            | Op::Unary(_)
            | Op::Cast(_)
            | Op::Select
            | Op::Dim { .. }
            | Op::DenseConstant(_)
            | Op::Empty
            | Op::AllocTensor
            | Op::ExtractSlice(_)
            | Op::InsertSlice(_)
            | Op::Extract
            | Op::Insert
            | Op::SubView(_)
            | Op::MemRefCast
            | Op::BufferConstant(_)
            | Op::RangeMin
            | Op::RangeMax
            | Op::RangeExtents
            | Op::Align
            | Op::SizeOf(_)
            | Op::BufferSubspan
            | Op::BufferSize => true,
            Op::Structured(s) => s.tensor_semantics,
            _ => false,
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredOp> {
        match self {
            Op::Structured(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<ConstValue> {
        match self {
            Op::Constant(c) => Some(*c),
            _ => None,
        }
    }
}
