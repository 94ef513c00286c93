//! Allocation, deallocation and copy hooks used while rewriting.
//!
//! The rewrite never creates memory ops itself; it asks a
//! [`BufferCallbacks`] implementation, so a target decides where buffers
//! live and how they move between memory spaces.

use trellis_ir::{Builder, MemRefType, MemorySpace, Op, ValueId};

use crate::error::*;

/// Target hooks for buffer management.
pub trait BufferCallbacks {
    /// Memory space of the buffers the rewrite asks for.
    fn memory_space(&self) -> MemorySpace {
        MemorySpace::Global
    }

    /// Allocate a buffer of type `ty` at the builder's insertion point.
    fn allocate(&self, b: &mut Builder, ty: MemRefType, dynamic_sizes: &[ValueId], alignment: Option<usize>)
    -> Result<ValueId>;

    /// Release `buffer` at the builder's insertion point.
    fn deallocate(&self, b: &mut Builder, buffer: ValueId) -> Result<()>;

    /// Copy `source` into `target` (same shape) at the builder's insertion point.
    fn copy(&self, b: &mut Builder, source: ValueId, target: ValueId) -> Result<()>;
}

/// Global-memory allocation with `memref.alloc`, `memref.dealloc` and `memref.copy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapCallbacks;

impl BufferCallbacks for HeapCallbacks {
    fn allocate(
        &self,
        b: &mut Builder,
        ty: MemRefType,
        dynamic_sizes: &[ValueId],
        alignment: Option<usize>,
    ) -> Result<ValueId> {
        Ok(b.alloc(ty, dynamic_sizes, alignment)?)
    }

    fn deallocate(&self, b: &mut Builder, buffer: ValueId) -> Result<()> {
        b.create(Op::Dealloc, [buffer], [])?;
        Ok(())
    }

    fn copy(&self, b: &mut Builder, source: ValueId, target: ValueId) -> Result<()> {
        b.copy(source, target)?;
        Ok(())
    }
}

/// Kernel-local allocation for GPU targets.
///
/// Workgroup buffers are shared by every thread of a workgroup: copies that
/// touch them are fenced with `gpu.barrier` on both sides. Private buffers
/// live on the stack (`memref.alloca`). Neither needs freeing; both die with
/// the kernel invocation.
#[derive(Debug, Clone, Copy)]
pub struct GpuCallbacks {
    pub space: MemorySpace,
}

impl GpuCallbacks {
    pub fn workgroup() -> Self {
        Self { space: MemorySpace::Workgroup }
    }

    pub fn private() -> Self {
        Self { space: MemorySpace::Private }
    }
}

impl BufferCallbacks for GpuCallbacks {
    fn memory_space(&self) -> MemorySpace {
        self.space
    }

    fn allocate(
        &self,
        b: &mut Builder,
        ty: MemRefType,
        dynamic_sizes: &[ValueId],
        alignment: Option<usize>,
    ) -> Result<ValueId> {
        if ty.space == MemorySpace::Private {
            return Ok(b.create1(Op::Alloca, dynamic_sizes.iter().copied(), trellis_ir::Type::MemRef(ty))?);
        }
        Ok(b.alloc(ty, dynamic_sizes, alignment)?)
    }

    fn deallocate(&self, _: &mut Builder, _: ValueId) -> Result<()> {
        Ok(())
    }

    fn copy(&self, b: &mut Builder, source: ValueId, target: ValueId) -> Result<()> {
        let shared = [source, target]
            .iter()
            .any(|v| b.ty(*v).as_memref().is_some_and(|m| m.space == MemorySpace::Workgroup));
        if shared {
            b.create(Op::Barrier, [], [])?;
        }
        b.copy(source, target)?;
        if shared {
            b.create(Op::Barrier, [], [])?;
        }
        Ok(())
    }
}

/// Callbacks assembled from three closures.
pub struct FnCallbacks<A, D, C> {
    allocate: A,
    deallocate: D,
    copy: C,
    space: MemorySpace,
}

impl<A, D, C> FnCallbacks<A, D, C>
where
    A: Fn(&mut Builder, MemRefType, &[ValueId], Option<usize>) -> Result<ValueId>,
    D: Fn(&mut Builder, ValueId) -> Result<()>,
    C: Fn(&mut Builder, ValueId, ValueId) -> Result<()>,
{
    pub fn new(allocate: A, deallocate: D, copy: C) -> Self {
        Self { allocate, deallocate, copy, space: MemorySpace::Global }
    }

    pub fn with_space(mut self, space: MemorySpace) -> Self {
        self.space = space;
        self
    }
}

impl<A, D, C> BufferCallbacks for FnCallbacks<A, D, C>
where
    A: Fn(&mut Builder, MemRefType, &[ValueId], Option<usize>) -> Result<ValueId>,
    D: Fn(&mut Builder, ValueId) -> Result<()>,
    C: Fn(&mut Builder, ValueId, ValueId) -> Result<()>,
{
    fn memory_space(&self) -> MemorySpace {
        self.space
    }

    fn allocate(
        &self,
        b: &mut Builder,
        ty: MemRefType,
        dynamic_sizes: &[ValueId],
        alignment: Option<usize>,
    ) -> Result<ValueId> {
        (self.allocate)(b, ty, dynamic_sizes, alignment)
    }

    fn deallocate(&self, b: &mut Builder, buffer: ValueId) -> Result<()> {
        (self.deallocate)(b, buffer)
    }

    fn copy(&self, b: &mut Builder, source: ValueId, target: ValueId) -> Result<()> {
        (self.copy)(b, source, target)
    }
}
