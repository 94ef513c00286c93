//! Mid-level transformations over the Trellis IR.
//!
//! Structured ops are tiled into loops of smaller instances, grouped into
//! dispatch regions, and finally converted from value-semantic tensors to
//! buffers. The folders clean up the index arithmetic these passes leave
//! behind.
//!
//! # Module Organization
//!
//! - [`tiling`] - tile one op over a window, or a whole op into loop nests
//! - [`dispatch`] - build and grow dispatch regions
//! - [`bufferize`] - in-place analysis and tensor-to-buffer rewrite
//! - [`fold`] - algebraic folders and the canonicalization driver
//! - [`shape`] - loop ranges, result extents and slice comparisons
//! - [`config`] - pass options with environment overrides

pub mod bufferize;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fold;
pub mod shape;
pub mod tiling;


pub use bufferize::{BufferCallbacks, BufferizeReport, HeapCallbacks, bufferize};
pub use config::{BufferizeConfig, FoldConfig, TilingConfig, UnknownLayout};
pub use error::{Error, Result};
pub use fold::{FoldStats, canonicalize};
pub use tiling::{TileResult, TiledLoops, tile, tile_to_loops};
