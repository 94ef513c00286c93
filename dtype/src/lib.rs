//! Element types for tensors, buffers and scalar payload values.
//!
//! Every shaped value in the IR carries one [`DType`] describing its elements.
//! `Index` is the target-width integer used for loop bounds, offsets and sizes.

pub mod host;

pub use host::HasDType;


/// Scalar element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr)]
pub enum DType {
    /// One-bit predicate (`i1`).
    Bool = 0,

    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,

    Float32 = 5,
    Float64 = 6,

    /// Index type for array indexing and loop iteration.
    Index = 7,
}

impl DType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 => 8,
            Self::Float32 => 4,
            Self::Float64 => 8,
            Self::Index => 8, // Treat as 64-bit index
        }
    }

    /// Bit width as seen by integer semantics (`i1` for `Bool`).
    pub const fn bit_width(&self) -> usize {
        match self {
            Self::Bool => 1,
            _ => self.bytes() * 8,
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// Integer-like, including `Index` but not `Bool`.
    pub const fn is_int(&self) -> bool {
        self.is_signed() || matches!(self, Self::Index)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub const fn is_index(&self) -> bool {
        matches!(self, Self::Index)
    }

    /// Integer or float scalar usable in a payload region.
    pub const fn is_int_or_float(&self) -> bool {
        self.is_bool() || self.is_signed() || self.is_float()
    }

    /// Textual spelling used by the IR printer.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bool => "i1",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Index => "index",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
