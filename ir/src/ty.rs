//! Value types: scalars, ranked tensors, ranked memrefs and byte buffers.

use std::fmt;

use smallvec::SmallVec;
use trellis_dtype::DType;

use crate::types::MemorySpace;

/// One dimension of a shaped type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub const fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    pub const fn as_static(&self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(*n),
            Dim::Dynamic => None,
        }
    }

    /// Two dims are compatible if either is dynamic or both are equal.
    pub fn is_compatible(&self, other: &Dim) -> bool {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) => a == b,
            _ => true,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Static(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{n}"),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

pub type Shape = SmallVec<[Dim; 4]>;

/// Build a shape from static extents.
pub fn static_shape(dims: &[usize]) -> Shape {
    dims.iter().copied().map(Dim::Static).collect()
}

/// Whether two shapes have equal rank and pairwise compatible dims.
pub fn shapes_compatible(a: &[Dim], b: &[Dim]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_compatible(y))
}

/// Immutable value-semantic n-dimensional array type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Shape,
    pub elem: DType,
}

impl TensorType {
    pub fn new(shape: impl Into<Shape>, elem: DType) -> Self {
        Self { shape: shape.into(), elem }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_dynamic(&self) -> usize {
        self.shape.iter().filter(|d| d.is_dynamic()).count()
    }
}

/// Memory layout of a memref.
///
/// `None` entries in a strided layout are unknown at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Contiguous row-major, offset zero.
    Identity,
    Strided { offset: Option<i64>, strides: SmallVec<[Option<i64>; 4]> },
}

impl Layout {
    /// Layout with every stride and the offset unknown.
    pub fn fully_dynamic(rank: usize) -> Self {
        Layout::Strided { offset: None, strides: SmallVec::from_elem(None, rank) }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Layout::Identity)
    }
}

/// Mutable view onto a region of memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRefType {
    pub shape: Shape,
    pub elem: DType,
    pub layout: Layout,
    pub space: MemorySpace,
}

impl MemRefType {
    /// Identity-layout memref in global memory.
    pub fn identity(shape: impl Into<Shape>, elem: DType) -> Self {
        Self { shape: shape.into(), elem, layout: Layout::Identity, space: MemorySpace::Global }
    }

    pub fn with_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_dynamic(&self) -> usize {
        self.shape.iter().filter(|d| d.is_dynamic()).count()
    }

    /// Strides and offset as far as they are known statically.
    ///
    /// Identity layouts have row-major strides; a stride is unknown once a
    /// dynamic dim appears to its right.
    pub fn strides_and_offset(&self) -> (SmallVec<[Option<i64>; 4]>, Option<i64>) {
        match &self.layout {
            Layout::Identity => {
                let mut strides: SmallVec<[Option<i64>; 4]> = SmallVec::from_elem(None, self.rank());
                let mut running = Some(1i64);
                for (i, dim) in self.shape.iter().enumerate().rev() {
                    strides[i] = running;
                    running = match (running, dim) {
                        (Some(r), Dim::Static(n)) => Some(r * *n as i64),
                        _ => None,
                    };
                }
                (strides, Some(0))
            }
            Layout::Strided { offset, strides } => (strides.clone(), *offset),
        }
    }
}

/// Type of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(DType),
    Tensor(TensorType),
    MemRef(MemRefType),
    /// Untyped byte buffer with a separately tracked size.
    ByteBuffer,
}

impl Type {
    pub const fn index() -> Self {
        Type::Scalar(DType::Index)
    }

    pub const fn i1() -> Self {
        Type::Scalar(DType::Bool)
    }

    pub fn tensor(shape: &[Dim], elem: DType) -> Self {
        Type::Tensor(TensorType::new(Shape::from_slice(shape), elem))
    }

    pub fn static_tensor(dims: &[usize], elem: DType) -> Self {
        Type::Tensor(TensorType::new(static_shape(dims), elem))
    }

    pub fn memref(shape: &[Dim], elem: DType) -> Self {
        Type::MemRef(MemRefType::identity(Shape::from_slice(shape), elem))
    }

    pub fn as_scalar(&self) -> Option<DType> {
        match self {
            Type::Scalar(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_memref(&self) -> bool {
        matches!(self, Type::MemRef(_))
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Type::Scalar(DType::Index))
    }

    /// Shape of a tensor or memref.
    pub fn shape(&self) -> Option<&[Dim]> {
        match self {
            Type::Tensor(t) => Some(&t.shape),
            Type::MemRef(m) => Some(&m.shape),
            _ => None,
        }
    }

    /// Element type of a tensor or memref, or the dtype of a scalar.
    pub fn elem(&self) -> Option<DType> {
        match self {
            Type::Scalar(dt) => Some(*dt),
            Type::Tensor(t) => Some(t.elem),
            Type::MemRef(m) => Some(m.elem),
            Type::ByteBuffer => None,
        }
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape().map(<[Dim]>::len)
    }

    /// Same kind of shaped type with a new shape, keeping element type and memory space.
    ///
    /// Memref results get an unknown strided layout unless the shape is
    /// unchanged and the layout is the identity.
    pub fn with_shape(&self, shape: Shape) -> Option<Type> {
        match self {
            Type::Tensor(t) => Some(Type::Tensor(TensorType::new(shape, t.elem))),
            Type::MemRef(m) => {
                let layout = if m.layout.is_identity() && m.shape == shape {
                    Layout::Identity
                } else {
                    Layout::fully_dynamic(shape.len())
                };
                Some(Type::MemRef(MemRefType { layout, shape, ..m.clone() }))
            }
            _ => None,
        }
    }
}

impl From<DType> for Type {
    fn from(dt: DType) -> Self {
        Type::Scalar(dt)
    }
}

fn write_shape(f: &mut fmt::Formatter<'_>, shape: &[Dim], elem: DType) -> fmt::Result {
    for d in shape {
        write!(f, "{d}x")?;
    }
    write!(f, "{elem}")
}

fn write_opt(f: &mut fmt::Formatter<'_>, v: Option<i64>) -> fmt::Result {
    match v {
        Some(v) => write!(f, "{v}"),
        None => f.write_str("?"),
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(dt) => write!(f, "{dt}"),
            Type::Tensor(t) => {
                f.write_str("tensor<")?;
                write_shape(f, &t.shape, t.elem)?;
                f.write_str(">")
            }
            Type::MemRef(m) => {
                f.write_str("memref<")?;
                write_shape(f, &m.shape, m.elem)?;
                if let Layout::Strided { offset, strides } = &m.layout {
                    f.write_str(", strided<[")?;
                    for (i, s) in strides.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write_opt(f, *s)?;
                    }
                    f.write_str("], offset: ")?;
                    write_opt(f, *offset)?;
                    f.write_str(">")?;
                }
                if m.space != MemorySpace::Global {
                    write!(f, ", {}", m.space)?;
                }
                f.write_str(">")
            }
            Type::ByteBuffer => f.write_str("!buffer"),
        }
    }
}
