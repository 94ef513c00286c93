//! Pass configuration.
//!
//! Typed configuration for tiling, bufferization and canonicalization with
//! bon builders. Every config also reads environment variable fallbacks.

use bon::bon;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Parse a comma separated list of tile sizes such as `"8,0,4"`.
///
/// Returns `None` when any entry is not a non-negative integer.
pub fn parse_tile_sizes(text: &str) -> Option<Vec<usize>> {
    let text = text.trim();
    if text.is_empty() {
        return Some(Vec::new());
    }
    text.split(',').map(|s| s.trim().parse().ok()).collect()
}

// ============================================================================
// TILING
// ============================================================================

/// Configuration for tiling a structured op into a loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingConfig {
    /// Tile size per iteration-domain dimension; `0` leaves a dimension untiled.
    /// Missing trailing entries count as `0`.
    pub tile_sizes: Vec<usize>,
    /// Emit a constant tile size instead of `min(tile, upper - iv)` when the
    /// extent is static and divisible by the tile.
    pub fold_full_tiles: bool,
    /// Silently leave reduction dimensions untiled instead of rejecting the request.
    pub skip_reductions: bool,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self { tile_sizes: Vec::new(), fold_full_tiles: true, skip_reductions: false }
    }
}

#[bon]
impl TilingConfig {
    #[builder]
    pub fn builder(
        #[builder(default)] tile_sizes: Vec<usize>,
        #[builder(default = true)] fold_full_tiles: bool,
        #[builder(default = false)] skip_reductions: bool,
    ) -> Self {
        Self { tile_sizes, fold_full_tiles, skip_reductions }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TRELLIS_TILE_SIZES` - Comma separated tile sizes (default: none)
    /// * `TRELLIS_NO_FOLD_FULL_TILES` - Always clamp partial tiles with `min` if set
    /// * `TRELLIS_SKIP_REDUCTIONS` - Leave reduction dims untiled if set
    pub fn from_env() -> Self {
        let tile_sizes =
            std::env::var("TRELLIS_TILE_SIZES").ok().and_then(|s| parse_tile_sizes(&s)).unwrap_or_default();
        let fold_full_tiles = std::env::var("TRELLIS_NO_FOLD_FULL_TILES").is_err();
        let skip_reductions = std::env::var("TRELLIS_SKIP_REDUCTIONS").is_ok();
        Self { tile_sizes, fold_full_tiles, skip_reductions }
    }

    /// Tile size of dimension `dim`, `0` when untiled.
    pub fn tile_size(&self, dim: usize) -> usize {
        self.tile_sizes.get(dim).copied().unwrap_or(0)
    }
}

// ============================================================================
// BUFFERIZATION
// ============================================================================

/// Layout given to buffers whose layout the rewrite cannot infer: function
/// arguments and results, and `to_buffer` results.
///
/// Buffers of constants always get the identity layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum UnknownLayout {
    /// Offset and strides all dynamic, so any view converts to it with a cast.
    #[default]
    FullyDynamic,
    /// Contiguous row-major.
    Identity,
}

/// Configuration for tensor-to-buffer conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferizeConfig {
    /// Run the analysis and report its decisions without rewriting.
    pub test_analysis_only: bool,
    /// Log every read-after-write conflict found by the analysis.
    pub print_conflicts: bool,
    /// Function arguments may be written in place.
    pub writable_func_args: bool,
    /// Alignment requested for every allocation.
    pub alignment: Option<usize>,
    /// Free non-escaping allocations before the terminator of their block.
    pub create_deallocs: bool,
    pub unknown_layout: UnknownLayout,
}

impl Default for BufferizeConfig {
    fn default() -> Self {
        Self {
            test_analysis_only: false,
            print_conflicts: false,
            writable_func_args: false,
            alignment: None,
            create_deallocs: true,
            unknown_layout: UnknownLayout::default(),
        }
    }
}

#[bon]
impl BufferizeConfig {
    #[builder]
    pub fn builder(
        #[builder(default = false)] test_analysis_only: bool,
        #[builder(default = false)] print_conflicts: bool,
        #[builder(default = false)] writable_func_args: bool,
        alignment: Option<usize>,
        #[builder(default = true)] create_deallocs: bool,
        #[builder(default)] unknown_layout: UnknownLayout,
    ) -> Self {
        Self { test_analysis_only, print_conflicts, writable_func_args, alignment, create_deallocs, unknown_layout }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TRELLIS_BUFFERIZE_ANALYSIS_ONLY` - Analyze without rewriting if set
    /// * `TRELLIS_BUFFERIZE_PRINT_CONFLICTS` - Log analysis conflicts if set
    /// * `TRELLIS_WRITABLE_FUNC_ARGS` - Allow in-place writes to function arguments if set
    /// * `TRELLIS_BUFFER_ALIGNMENT` - Allocation alignment in bytes (default: none)
    /// * `TRELLIS_NO_DEALLOC` - Skip deallocation placement if set
    /// * `TRELLIS_BUFFER_LAYOUT` - `fully_dynamic` or `identity` (default: fully_dynamic)
    pub fn from_env() -> Self {
        Self {
            test_analysis_only: std::env::var("TRELLIS_BUFFERIZE_ANALYSIS_ONLY").is_ok(),
            print_conflicts: std::env::var("TRELLIS_BUFFERIZE_PRINT_CONFLICTS").is_ok(),
            writable_func_args: std::env::var("TRELLIS_WRITABLE_FUNC_ARGS").is_ok(),
            alignment: std::env::var("TRELLIS_BUFFER_ALIGNMENT").ok().and_then(|s| s.parse().ok()),
            create_deallocs: std::env::var("TRELLIS_NO_DEALLOC").is_err(),
            unknown_layout: env_or("TRELLIS_BUFFER_LAYOUT", UnknownLayout::default()),
        }
    }
}

// ============================================================================
// CANONICALIZATION
// ============================================================================

/// Configuration for the folding driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldConfig {
    /// Upper bound on sweeps over the module before giving up.
    pub max_iterations: usize,
    /// Fail instead of returning when the bound is hit.
    pub strict: bool,
}

impl Default for FoldConfig {
    fn default() -> Self {
        Self { max_iterations: 16, strict: false }
    }
}

#[bon]
impl FoldConfig {
    #[builder]
    pub fn builder(#[builder(default = 16)] max_iterations: usize, #[builder(default = false)] strict: bool) -> Self {
        Self { max_iterations, strict }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TRELLIS_FOLD_MAX_ITERATIONS` - Sweep bound (default: 16)
    /// * `TRELLIS_FOLD_STRICT` - Fail on non-convergence if set
    pub fn from_env() -> Self {
        Self {
            max_iterations: env_or("TRELLIS_FOLD_MAX_ITERATIONS", 16),
            strict: std::env::var("TRELLIS_FOLD_STRICT").is_ok(),
        }
    }
}
