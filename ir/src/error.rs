use snafu::Snafu;
use trellis_dtype::DType;

use crate::module::{BlockId, OpId, ValueId};
use crate::ty::Type;
use crate::types::{BinaryOp, UnaryOp};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Op handle refers to an erased op.
    #[snafu(display("{op} has been erased"))]
    ErasedOp { op: OpId },

    /// Op is not attached to any block.
    #[snafu(display("{op} is detached"))]
    DetachedOp { op: OpId },

    /// Op failed verification.
    #[snafu(display("'{name}' ({op}) failed to verify: {reason}"))]
    VerificationFailed { op: OpId, name: &'static str, reason: String },

    /// Value had an unexpected type.
    #[snafu(display("{value} has type {actual}, expected {expected}"))]
    UnexpectedType { value: ValueId, expected: &'static str, actual: Type },

    /// Binary op on mismatched scalar types.
    #[snafu(display("dtype mismatch in {op}: {lhs} vs {rhs}"))]
    DTypeMismatch { op: BinaryOp, lhs: DType, rhs: DType },

    /// Invalid dtype for a unary op.
    #[snafu(display("invalid dtype for {op}: {dtype}"))]
    InvalidDTypeForUnaryOp { op: UnaryOp, dtype: DType },

    /// Slice offsets/sizes do not match the source rank.
    #[snafu(display("slice rank mismatch: source rank {rank}, {offsets} offsets, {sizes} sizes"))]
    SliceRankMismatch { rank: usize, offsets: usize, sizes: usize },

    /// Dimension index past the rank.
    #[snafu(display("dimension {dim} out of range for rank {rank}"))]
    DimOutOfRange { dim: usize, rank: usize },

    /// Op does not implement the structured-op capabilities.
    #[snafu(display("{op} ('{name}') is not a structured op"))]
    NotStructured { op: OpId, name: &'static str },

    /// Capability not available for this op in its current form.
    #[snafu(display("{what} is not supported for '{name}'"))]
    Unsupported { name: &'static str, what: &'static str },

    /// Dominance snapshot used after the module was mutated.
    #[snafu(display("dominance info is stale (computed at generation {computed}, module is at {current})"))]
    StaleDominance { computed: u64, current: u64 },

    /// Block has no terminator where one is required.
    #[snafu(display("{block} is missing its terminator"))]
    MissingTerminator { block: BlockId },

    // ========================================================================
    // Interpreter
    // ========================================================================
    /// No function with the requested name.
    #[snafu(display("unknown function '{name}'"))]
    UnknownFunction { name: String },

    /// Function called with the wrong number of arguments.
    #[snafu(display("function '{name}' expects {expected} arguments, got {actual}"))]
    ArgumentCount { name: String, expected: usize, actual: usize },

    /// Value read before it was defined.
    #[snafu(display("{value} used before definition"))]
    UnboundValue { value: ValueId },

    /// Runtime value of the wrong kind.
    #[snafu(display("{value}: expected a {expected} at runtime"))]
    RuntimeKind { value: ValueId, expected: &'static str },

    /// Access to freed memory.
    #[snafu(display("use of buffer after free"))]
    UseAfterFree,

    /// Buffer freed twice.
    #[snafu(display("double free"))]
    DoubleFree,

    /// Element index outside the buffer.
    #[snafu(display("index {index:?} out of bounds for shape {shape:?}"))]
    OutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    /// Byte range outside a byte buffer.
    #[snafu(display("byte range [{offset}, {offset}+{length}) out of bounds for {size}-byte buffer"))]
    ByteRangeOutOfBounds { offset: usize, length: usize, size: usize },

    /// Scalar evaluation undefined (e.g. division by zero).
    #[snafu(display("cannot evaluate '{name}' on the given operands"))]
    EvaluationFailed { name: &'static str },

    /// Runtime index or size is negative.
    #[snafu(display("negative index {value}"))]
    NegativeIndex { value: i64 },
}
