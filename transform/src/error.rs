use snafu::Snafu;
use trellis_ir::{OpId, ValueId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Error raised by the IR layer (construction, verification, interpretation).
    #[snafu(context(false), display("IR error: {source}"))]
    Ir { source: trellis_ir::Error },

    /// Extents of a value could not be recovered.
    #[snafu(display("cannot reify the extents of {value}: {reason}"))]
    Reification { value: ValueId, reason: &'static str },

    /// Op kind has no meaning for this transformation.
    #[snafu(display("{op} ('{name}') does not support {what}"))]
    Unsupported { op: OpId, name: &'static str, what: &'static str },

    // ========================================================================
    // Tiling
    // ========================================================================
    /// Offsets, sizes or tile sizes do not match the iteration domain.
    #[snafu(display("{op} has a {expected}-d iteration domain, got {actual} tile entries"))]
    TileRank { op: OpId, expected: usize, actual: usize },

    /// Tiling would split a reduction loop.
    #[snafu(display("cannot tile reduction dimension {dim} of {op}"))]
    ReductionTiling { op: OpId, dim: usize },

    /// Tile size does not respect a non-unit loop step.
    #[snafu(display("tile size {size} of dimension {dim} of {op} is not a multiple of its step {step}"))]
    TileStep { op: OpId, dim: usize, size: usize, step: usize },

    // ========================================================================
    // Dispatch regions
    // ========================================================================
    /// Op is not a dispatch region.
    #[snafu(display("{op} is not a dispatch region"))]
    NotDispatchRegion { op: OpId },

    /// A use outside the region would not see the moved definition.
    #[snafu(display("{user} uses {value} but is not dominated by dispatch region {region}"))]
    UndominatedUse { value: ValueId, user: OpId, region: OpId },

    /// Producer does not precede the region it is grouped into.
    #[snafu(display("{op} does not precede dispatch region {region}"))]
    NotPreceding { op: OpId, region: OpId },

    /// Wrong number of dynamic extents for an appended result.
    #[snafu(display("{value} has {expected} dynamic extents, got {actual}"))]
    DynamicDimCount { value: ValueId, expected: usize, actual: usize },

    // ========================================================================
    // Bufferization
    // ========================================================================
    /// Analysis rejected the module; nothing was rewritten.
    #[snafu(display("bufferization analysis failed at {op} ('{name}'): {reason}"))]
    Analysis { op: OpId, name: &'static str, reason: String },

    /// Value expected to be a tensor has another type.
    #[snafu(display("expected {value} to be a tensor, got {actual:?}"))]
    NotTensor { value: ValueId, actual: trellis_ir::Type },

    /// Tensor value reached the rewrite without a buffer.
    #[snafu(display("no buffer was assigned to {value}"))]
    MissingBuffer { value: ValueId },

    /// A user-supplied callback failed.
    #[snafu(display("{callback} callback failed: {reason}"))]
    Callback { callback: &'static str, reason: String },

    // ========================================================================
    // Folding
    // ========================================================================
    /// Canonicalization kept changing the module.
    #[snafu(display("canonicalization did not converge within {iterations} iterations"))]
    NoFixedPoint { iterations: usize },
}
