//! Type definitions for IR operations.
//!
//! This module contains the fundamental enums used throughout the IR: constant
//! values, scalar operation kinds, loop iterator kinds and memory spaces.

use trellis_dtype::DType;

/// Constant value that can be stored in a `Constant` op or produced by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Helper macro to cast to target width and back to storage type (for proper truncation/extension).
macro_rules! cast_via {
    ($v:expr, $target:ty, $storage:ty) => {
        ($v as $target) as $storage
    };
}

#[inline]
fn cast_bool(v: bool, to: DType) -> ConstValue {
    use DType::*;
    match to {
        Bool => ConstValue::Bool(v),
        Int8 | Int16 | Int32 | Int64 | Index => ConstValue::Int(v as i64),
        Float32 | Float64 => ConstValue::Float(v as u8 as f64),
    }
}

#[inline]
fn cast_int(v: i64, to: DType) -> ConstValue {
    use DType::*;
    match to {
        Bool => ConstValue::Bool(v & 1 != 0),
        Int8 => ConstValue::Int(cast_via!(v, i8, i64)),
        Int16 => ConstValue::Int(cast_via!(v, i16, i64)),
        Int32 => ConstValue::Int(cast_via!(v, i32, i64)),
        Int64 | Index => ConstValue::Int(v),
        Float32 => ConstValue::Float(cast_via!(v, f32, f64)),
        Float64 => ConstValue::Float(v as f64),
    }
}

#[inline]
fn cast_float(v: f64, to: DType) -> ConstValue {
    use DType::*;
    match to {
        Bool => ConstValue::Bool(v != 0.0),
        Int8 => ConstValue::Int(cast_via!(v, i8, i64)),
        Int16 => ConstValue::Int(cast_via!(v, i16, i64)),
        Int32 => ConstValue::Int(cast_via!(v, i32, i64)),
        Int64 | Index => ConstValue::Int(v as i64),
        Float32 => ConstValue::Float(cast_via!(v, f32, f64)),
        Float64 => ConstValue::Float(v),
    }
}

impl ConstValue {
    pub const fn zero(dtype: DType) -> Self {
        use DType::*;
        match dtype {
            Bool => Self::Bool(false),
            Int8 | Int16 | Int32 | Int64 | Index => Self::Int(0),
            Float32 | Float64 => Self::Float(0.0),
        }
    }

    pub const fn one(dtype: DType) -> Self {
        use DType::*;
        match dtype {
            Bool => Self::Bool(true),
            Int8 | Int16 | Int32 | Int64 | Index => Self::Int(1),
            Float32 | Float64 => Self::Float(1.0),
        }
    }

    /// Cast this constant value to the target dtype.
    ///
    /// All casts are allowed, including lossy ones. Narrowing integer casts
    /// truncate and sign-extend back (i64 -> i8 -> i64), float-to-int casts
    /// truncate toward zero, and `Float32` targets round through `f32`.
    pub fn cast(&self, dtype: DType) -> Self {
        match *self {
            ConstValue::Bool(v) => cast_bool(v, dtype),
            ConstValue::Int(v) => cast_int(v, dtype),
            ConstValue::Float(v) => cast_float(v, dtype),
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_float(&self) -> Option<f64> {
        match self {
            ConstValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            ConstValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Float(v) => write!(f, "{v:?}"),
            ConstValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ConstValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ConstValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ConstValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ConstValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<bool> for ConstValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Unary operation types.
///
/// All unary operations preserve the input dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOp {
    /// Negation: -x
    Neg,
    /// Logical/bitwise not (bool and int only)
    Not,
    /// Square root: √x
    Sqrt,
    /// Sine: sin(x) (float only)
    Sin,
    /// Cosine: cos(x) (float only)
    Cos,
}

/// Binary operation types.
///
/// Arithmetic operations preserve the LHS dtype.
/// Comparison operations (Lt, Le, Eq, Ne) always return `DType::Bool`.
/// Bitwise operations (And, Or, Xor, Shl, Shr) require int/bool types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOp {
    // Arithmetic operations
    /// Addition: a + b
    Add,
    /// Subtraction: a - b
    Sub,
    /// Multiplication: a * b
    Mul,
    /// Integer division: a / b (truncated toward zero)
    ///
    /// Uses C-style truncation, NOT floor division.
    Idiv,
    /// Modulo: a % b (C-style remainder, sign of the dividend)
    Mod,
    /// Ceiling division for integers: ⌈a / b⌉
    CeilDiv,
    /// Float division: a / b
    Fdiv,
    /// Minimum: min(a, b)
    Min,
    /// Maximum: max(a, b)
    Max,

    // Comparison operations
    /// Less than: a < b
    Lt,
    /// Less or equal: a <= b
    Le,
    /// Equality: a == b
    Eq,
    /// Inequality: a != b
    Ne,

    // Bitwise operations (int/bool only)
    /// Bitwise AND: a & b
    And,
    /// Bitwise OR: a | b
    Or,
    /// Bitwise XOR: a ^ b
    Xor,
    /// Left shift: a << b
    Shl,
    /// Arithmetic right shift: a >> b
    Shr,
}

impl BinaryOp {
    /// Returns true if this is a comparison operation.
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Eq | Self::Ne)
    }

    /// Returns true if this operation is idempotent (f(x, x) = x).
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::Or | Self::And | Self::Min | Self::Max)
    }
}

/// Kind of a loop in an iteration domain.
///
/// Reduction loops must run serially in order; parallel loops may be
/// distributed or tiled freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum IteratorKind {
    Parallel,
    Reduction,
}

/// Memory space a buffer is allocated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MemorySpace {
    /// Global/device memory.
    #[default]
    Global,
    /// Workgroup-shared memory; accesses across invocations need barriers.
    Workgroup,
    /// Per-invocation private memory.
    Private,
}
