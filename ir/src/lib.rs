//! Intermediate representation for the Trellis tensor compiler.
//!
//! A [`Module`] is an arena of ops, values and single-block regions. Ops
//! are a closed [`Op`] enum; the structured operations (scatter, sort, fft,
//! scan, reverse, topk, pack, unpack) share one capability set in
//! [`structured`] that the tiling and bufferization passes drive.
//!
//! # Module Organization
//!
//! - [`module`] - arena, handles, use lists and mutation
//! - [`builder`] - insertion point, typed op construction, cloning
//! - [`ty`] / [`types`] - value types, constants and scalar op kinds
//! - [`sint`] - static-or-symbolic sizes
//! - [`structured`] - structured ops and their capabilities
//! - [`dominance`] / [`verify`] - analyses over a module
//! - [`printer`] / [`interp`] - textual form and reference interpreter

pub mod builder;
pub mod dominance;
pub mod error;
pub mod eval;
pub mod interp;
pub mod module;
pub mod op;
pub mod prelude;
pub mod printer;
pub mod sint;
pub mod structured;
pub mod ty;
pub mod types;
pub mod verify;


pub use builder::{Builder, InsertPoint, IrMapping};
pub use dominance::DominanceInfo;
pub use error::{Error, Result};
pub use interp::{Interpreter, MemRefView, NdArray, RuntimeValue};
pub use module::{BlockId, Module, OpId, Use, ValueDef, ValueId};
pub use op::{Op, SliceAttrs};
pub use printer::{print_module, print_op};
pub use sint::{LoopRange, SInt, SIntVec};
pub use structured::{StructuredKind, StructuredOp, StructuredParts, TiledImplementation};
pub use ty::{Dim, Layout, MemRefType, Shape, TensorType, Type};
pub use types::{BinaryOp, ConstValue, IteratorKind, MemorySpace, UnaryOp};
pub use verify::{verify_module, verify_op};

pub use trellis_dtype::DType;
