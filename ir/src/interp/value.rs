//! Runtime values of the reference interpreter.
//!
//! Tensors are immutable row-major arrays shared by `Rc`. Memrefs are
//! strided views over shared element storage; freeing the storage poisons
//! every view onto it. Byte buffers work the same way over raw bytes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;
use snafu::ensure;
use trellis_dtype::{DType, HasDType};

use crate::error::*;
use crate::types::{ConstValue, MemorySpace};

pub type Extents = SmallVec<[usize; 4]>;

fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn check_index(index: &[usize], shape: &[usize]) -> Result<()> {
    ensure!(
        index.len() == shape.len() && index.iter().zip(shape).all(|(i, n)| i < n),
        OutOfBoundsSnafu { index: index.to_vec(), shape: shape.to_vec() }
    );
    Ok(())
}

/// Every index of `shape` in row-major order.
pub fn row_major(shape: &[usize]) -> impl Iterator<Item = Extents> + '_ {
    let total = num_elements(shape);
    (0..total).map(move |mut flat| {
        let mut index: Extents = SmallVec::from_elem(0, shape.len());
        for (d, n) in shape.iter().enumerate().rev() {
            index[d] = flat % n;
            flat /= n;
        }
        index
    })
}

// ============================================================================
// Tensors
// ============================================================================

/// Immutable dense array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Extents,
    elem: DType,
    data: Vec<ConstValue>,
}

impl NdArray {
    pub fn new(shape: &[usize], elem: DType, data: Vec<ConstValue>) -> Result<Self> {
        ensure!(
            data.len() == num_elements(shape),
            OutOfBoundsSnafu { index: vec![data.len()], shape: shape.to_vec() }
        );
        let data = data.into_iter().map(|v| v.cast(elem)).collect();
        Ok(Self { shape: shape.into(), elem, data })
    }

    pub fn zeros(shape: &[usize], elem: DType) -> Self {
        Self { shape: shape.into(), elem, data: vec![ConstValue::zero(elem); num_elements(shape)] }
    }

    /// Array of host values, element type taken from `T`.
    pub fn from_host<T>(shape: &[usize], values: &[T]) -> Result<Self>
    where
        T: HasDType + Copy + Into<ConstValue>,
    {
        Self::new(shape, T::DTYPE, values.iter().map(|v| (*v).into()).collect())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn elem(&self) -> DType {
        self.elem
    }

    pub fn data(&self) -> &[ConstValue] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn linear(&self, index: &[usize]) -> Result<usize> {
        check_index(index, &self.shape)?;
        Ok(index.iter().zip(&self.shape).fold(0, |acc, (i, n)| acc * n + i))
    }

    pub fn get(&self, index: &[usize]) -> Result<ConstValue> {
        Ok(self.data[self.linear(index)?])
    }

    pub fn set(&mut self, index: &[usize], value: ConstValue) -> Result<()> {
        let at = self.linear(index)?;
        self.data[at] = value.cast(self.elem);
        Ok(())
    }

    /// Elements as integers; non-integer elements read as `None`.
    pub fn to_ints(&self) -> Vec<Option<i64>> {
        self.data.iter().map(ConstValue::as_int).collect()
    }

    /// Copy of the window `offsets .. offsets + sizes`.
    pub fn slice(&self, offsets: &[usize], sizes: &[usize]) -> Result<Self> {
        let mut out = Self::zeros(sizes, self.elem);
        for index in row_major(sizes) {
            let src: Extents = index.iter().zip(offsets).map(|(i, o)| i + o).collect();
            out.set(&index, self.get(&src)?)?;
        }
        Ok(out)
    }

    /// Copy of `self` with `source` written at `offsets`.
    pub fn insert_slice(&self, source: &NdArray, offsets: &[usize]) -> Result<Self> {
        let mut out = self.clone();
        for index in row_major(source.shape()) {
            let dst: Extents = index.iter().zip(offsets).map(|(i, o)| i + o).collect();
            out.set(&dst, source.get(&index)?)?;
        }
        Ok(out)
    }
}

// ============================================================================
// Memrefs
// ============================================================================

/// Element storage shared by memref views.
#[derive(Debug)]
pub struct Storage {
    data: RefCell<Vec<ConstValue>>,
    freed: Cell<bool>,
    space: MemorySpace,
}

impl Storage {
    fn check_live(&self) -> Result<()> {
        ensure!(!self.freed.get(), UseAfterFreeSnafu);
        Ok(())
    }
}

/// Strided view over [`Storage`].
#[derive(Debug, Clone)]
pub struct MemRefView {
    storage: Rc<Storage>,
    offset: usize,
    shape: Extents,
    strides: Extents,
    elem: DType,
}

fn row_major_strides(shape: &[usize]) -> Extents {
    let mut strides: Extents = SmallVec::from_elem(1, shape.len());
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

impl MemRefView {
    /// Fresh zero-filled identity-layout buffer.
    pub fn alloc(shape: &[usize], elem: DType, space: MemorySpace) -> Self {
        let data = vec![ConstValue::zero(elem); num_elements(shape)];
        Self::over(data, shape, elem, space)
    }

    /// Fresh buffer holding a copy of `array`.
    pub fn from_array(array: &NdArray) -> Self {
        Self::over(array.data().to_vec(), array.shape(), array.elem(), MemorySpace::Global)
    }

    fn over(data: Vec<ConstValue>, shape: &[usize], elem: DType, space: MemorySpace) -> Self {
        let storage = Rc::new(Storage { data: RefCell::new(data), freed: Cell::new(false), space });
        Self { storage, offset: 0, shape: shape.into(), strides: row_major_strides(shape), elem }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn elem(&self) -> DType {
        self.elem
    }

    pub fn space(&self) -> MemorySpace {
        self.storage.space
    }

    /// Whether both views share storage.
    pub fn aliases(&self, other: &MemRefView) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    fn linear(&self, index: &[usize]) -> Result<usize> {
        check_index(index, &self.shape)?;
        Ok(self.offset + index.iter().zip(&self.strides).map(|(i, s)| i * s).sum::<usize>())
    }

    pub fn load(&self, index: &[usize]) -> Result<ConstValue> {
        self.storage.check_live()?;
        let at = self.linear(index)?;
        let data = self.storage.data.borrow();
        data.get(at).copied().ok_or_else(|| Error::OutOfBounds { index: index.to_vec(), shape: self.shape.to_vec() })
    }

    pub fn store(&self, index: &[usize], value: ConstValue) -> Result<()> {
        self.storage.check_live()?;
        let at = self.linear(index)?;
        let mut data = self.storage.data.borrow_mut();
        let slot =
            data.get_mut(at).ok_or_else(|| Error::OutOfBounds { index: index.to_vec(), shape: self.shape.to_vec() })?;
        *slot = value.cast(self.elem);
        Ok(())
    }

    /// Unit-stride window of this view.
    pub fn subview(&self, offsets: &[usize], sizes: &[usize]) -> Result<Self> {
        for (d, (o, s)) in offsets.iter().zip(sizes).enumerate() {
            ensure!(
                o + s <= self.shape[d],
                OutOfBoundsSnafu { index: offsets.to_vec(), shape: self.shape.to_vec() }
            );
        }
        let offset = self.offset + offsets.iter().zip(&self.strides).map(|(o, s)| o * s).sum::<usize>();
        Ok(Self { offset, shape: sizes.into(), ..self.clone() })
    }

    /// Snapshot of the viewed elements.
    pub fn to_array(&self) -> Result<NdArray> {
        let data = row_major(&self.shape).map(|i| self.load(&i)).collect::<Result<Vec<_>>>()?;
        NdArray::new(&self.shape, self.elem, data)
    }

    /// Overwrite the viewed elements with `source`.
    pub fn write_array(&self, source: &NdArray) -> Result<()> {
        for index in row_major(source.shape()) {
            self.store(&index, source.get(&index)?)?;
        }
        Ok(())
    }

    pub fn copy_to(&self, target: &MemRefView) -> Result<()> {
        target.write_array(&self.to_array()?)
    }

    pub fn free(&self) -> Result<()> {
        ensure!(!self.storage.freed.replace(true), DoubleFreeSnafu);
        Ok(())
    }
}

// ============================================================================
// Byte buffers
// ============================================================================

/// Range of a shared byte allocation.
#[derive(Debug, Clone)]
pub struct ByteView {
    bytes: Rc<RefCell<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl ByteView {
    pub fn alloc(len: usize) -> Self {
        Self { bytes: Rc::new(RefCell::new(vec![0; len])), offset: 0, len }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self { bytes: Rc::new(RefCell::new(bytes)), offset: 0, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, length: usize) -> Result<()> {
        ensure!(
            offset.checked_add(length).is_some_and(|end| end <= self.len),
            ByteRangeOutOfBoundsSnafu { offset, length, size: self.len }
        );
        Ok(())
    }

    /// Aliasing sub-range.
    pub fn subspan(&self, offset: usize, length: usize) -> Result<Self> {
        self.check(offset, length)?;
        Ok(Self { bytes: Rc::clone(&self.bytes), offset: self.offset + offset, len: length })
    }

    pub fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        self.check(offset, length)?;
        let start = self.offset + offset;
        Ok(self.bytes.borrow()[start..start + length].to_vec())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let start = self.offset + offset;
        self.bytes.borrow_mut()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.borrow()[self.offset..self.offset + self.len].to_vec()
    }
}

/// Little-endian encoding of a scalar of `dtype`.
pub fn encode_scalar(value: ConstValue, dtype: DType) -> Vec<u8> {
    let value = value.cast(dtype);
    match (dtype, value) {
        (DType::Bool, ConstValue::Bool(b)) => vec![u8::from(b)],
        (DType::Int8, ConstValue::Int(v)) => (v as i8).to_le_bytes().to_vec(),
        (DType::Int16, ConstValue::Int(v)) => (v as i16).to_le_bytes().to_vec(),
        (DType::Int32, ConstValue::Int(v)) => (v as i32).to_le_bytes().to_vec(),
        (DType::Int64 | DType::Index, ConstValue::Int(v)) => v.to_le_bytes().to_vec(),
        (DType::Float32, ConstValue::Float(v)) => (v as f32).to_le_bytes().to_vec(),
        (DType::Float64, ConstValue::Float(v)) => v.to_le_bytes().to_vec(),
        _ => vec![0; dtype.bytes()],
    }
}

/// Decode a little-endian scalar; `bytes` must hold exactly `dtype.bytes()` bytes.
pub fn decode_scalar(bytes: &[u8], dtype: DType) -> Option<ConstValue> {
    Some(match dtype {
        DType::Bool => ConstValue::Bool(*bytes.first()? != 0),
        DType::Int8 => ConstValue::Int(i8::from_le_bytes(bytes.try_into().ok()?) as i64),
        DType::Int16 => ConstValue::Int(i16::from_le_bytes(bytes.try_into().ok()?) as i64),
        DType::Int32 => ConstValue::Int(i32::from_le_bytes(bytes.try_into().ok()?) as i64),
        DType::Int64 | DType::Index => ConstValue::Int(i64::from_le_bytes(bytes.try_into().ok()?)),
        DType::Float32 => ConstValue::Float(f32::from_le_bytes(bytes.try_into().ok()?) as f64),
        DType::Float64 => ConstValue::Float(f64::from_le_bytes(bytes.try_into().ok()?)),
    })
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone)]
pub enum RuntimeValue {
    Scalar(ConstValue),
    Tensor(Rc<NdArray>),
    MemRef(MemRefView),
    Bytes(ByteView),
}

impl RuntimeValue {
    pub fn tensor(array: NdArray) -> Self {
        RuntimeValue::Tensor(Rc::new(array))
    }

    pub fn as_scalar(&self) -> Option<ConstValue> {
        match self {
            RuntimeValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&NdArray> {
        match self {
            RuntimeValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemRefView> {
        match self {
            RuntimeValue::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&ByteView> {
        match self {
            RuntimeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Contents of a tensor or memref as an array.
    pub fn to_array(&self) -> Option<Result<NdArray>> {
        match self {
            RuntimeValue::Tensor(t) => Some(Ok(NdArray::clone(t))),
            RuntimeValue::MemRef(m) => Some(m.to_array()),
            _ => None,
        }
    }
}

impl From<ConstValue> for RuntimeValue {
    fn from(v: ConstValue) -> Self {
        RuntimeValue::Scalar(v)
    }
}

impl From<NdArray> for RuntimeValue {
    fn from(array: NdArray) -> Self {
        RuntimeValue::tensor(array)
    }
}

impl From<MemRefView> for RuntimeValue {
    fn from(view: MemRefView) -> Self {
        RuntimeValue::MemRef(view)
    }
}
