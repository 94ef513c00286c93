//! Symbolic Integer (SInt) - sizes and offsets that are either constant or SSA values.
//!
//! Tiling and shape reification manipulate mixed static/dynamic quantities.
//! Keeping the static part unboxed lets builders fold arithmetic eagerly and
//! only materialize index ops when a runtime value is involved.

use std::fmt;

use smallvec::SmallVec;

use crate::module::ValueId;

/// Symbolic Integer - either a concrete value or an index-typed SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SInt {
    /// Concrete compile-time constant.
    Const(usize),

    /// Runtime value of `index` type.
    Symbolic(ValueId),
}

pub type SIntVec = SmallVec<[SInt; 4]>;

impl SInt {
    /// Get concrete value if this is a constant, None otherwise.
    pub fn as_const(&self) -> Option<usize> {
        match self {
            SInt::Const(v) => Some(*v),
            SInt::Symbolic(_) => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<ValueId> {
        match self {
            SInt::Symbolic(v) => Some(*v),
            SInt::Const(_) => None,
        }
    }

    /// Whether this is the constant `n`.
    pub fn is(&self, n: usize) -> bool {
        self.as_const() == Some(n)
    }
}

impl From<usize> for SInt {
    fn from(v: usize) -> Self {
        SInt::Const(v)
    }
}

impl From<ValueId> for SInt {
    fn from(v: ValueId) -> Self {
        SInt::Symbolic(v)
    }
}

impl fmt::Display for SInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SInt::Const(v) => write!(f, "{v}"),
            SInt::Symbolic(v) => write!(f, "{v}"),
        }
    }
}

/// One dimension of an iteration domain: `offset .. offset + size` stepping by `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopRange {
    pub offset: SInt,
    pub size: SInt,
    pub stride: SInt,
}

impl LoopRange {
    /// `0 .. size` with unit stride.
    pub fn zero_based(size: SInt) -> Self {
        Self { offset: SInt::Const(0), size, stride: SInt::Const(1) }
    }
}
