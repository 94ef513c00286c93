//! Common imports for building and inspecting modules.
//!
//! ```rust,ignore
//! use trellis_ir::prelude::*;
//! ```

// Graph and construction
pub use crate::builder::{Builder, InsertPoint, IrMapping};
pub use crate::module::{BlockId, Module, OpId, Use, ValueId};
pub use crate::op::{Op, SliceAttrs};

// Types and sizes
pub use crate::sint::{LoopRange, SInt, SIntVec};
pub use crate::ty::{Dim, Layout, MemRefType, Shape, TensorType, Type};
pub use crate::types::{BinaryOp, ConstValue, IteratorKind, MemorySpace, UnaryOp};

// Interpreter values
pub use crate::interp::NdArray;

// Structured ops
pub use crate::structured::{StructuredKind, StructuredOp, StructuredParts};

pub use trellis_dtype::DType;
