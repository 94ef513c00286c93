//! Tensor-to-buffer rewrite driven by an [`AnalysisState`].

use std::collections::HashMap;

use snafu::{OptionExt, ensure};
use tracing::trace;
use trellis_ir::{
    Builder, Layout, MemRefType, Module, Op, OpId, StructuredParts, TensorType, Type, Use, ValueId,
};

use super::analysis::{AnalysisState, initializes_result, iter_arg};
use super::callbacks::BufferCallbacks;
use crate::config::{BufferizeConfig, UnknownLayout};
use crate::error::*;
use crate::shape::slices_match;

/// Buffers created by the rewrite.
#[derive(Debug, Clone, Default)]
pub(crate) struct Rewritten {
    pub allocations: Vec<ValueId>,
    pub copies: usize,
}

struct Rewriter<'a> {
    state: &'a AnalysisState,
    config: &'a BufferizeConfig,
    callbacks: &'a dyn BufferCallbacks,
    buffers: HashMap<ValueId, ValueId>,
    func_results: HashMap<OpId, Vec<Type>>,
    dead: Vec<OpId>,
    out: Rewritten,
}

fn identity_type(t: &TensorType) -> MemRefType {
    MemRefType::identity(t.shape.clone(), t.elem)
}

fn tensor_type(module: &Module, value: ValueId) -> Result<TensorType> {
    let ty = module.value_type(value);
    ty.as_tensor().cloned().context(NotTensorSnafu { value, actual: ty.clone() })
}

fn is_constant(module: &Module, value: ValueId) -> bool {
    module.defining_op(value).is_some_and(|op| matches!(module.op(op).op, Op::DenseConstant(_)))
}

impl Rewriter<'_> {
    /// Layout for a buffer nothing in the rewrite pins down.
    fn unknown_layout(&self, rank: usize, constant: bool) -> Layout {
        match self.config.unknown_layout {
            UnknownLayout::FullyDynamic if !constant => Layout::fully_dynamic(rank),
            _ => Layout::Identity,
        }
    }

    fn boundary_type(&self, t: &TensorType) -> MemRefType {
        identity_type(t).with_layout(self.unknown_layout(t.shape.len(), false))
    }

    fn buffer(&self, value: ValueId) -> Result<ValueId> {
        self.buffers.get(&value).copied().context(MissingBufferSnafu { value })
    }

    fn copy(&mut self, b: &mut Builder, source: ValueId, target: ValueId) -> Result<()> {
        self.callbacks.copy(b, source, target)?;
        self.out.copies += 1;
        Ok(())
    }

    /// Fresh identity buffer shaped like `ty`, taking dynamic extents from `like`.
    fn allocate_like(&mut self, b: &mut Builder, ty: &TensorType, like: ValueId) -> Result<ValueId> {
        let mut dynamic = Vec::new();
        for (d, dim) in ty.shape.iter().enumerate() {
            if dim.is_dynamic() {
                let extent = b.dim(like, d)?;
                dynamic.push(b.materialize(extent)?);
            }
        }
        let memref = identity_type(ty).with_space(self.callbacks.memory_space());
        let buffer = self.callbacks.allocate(b, memref, &dynamic, self.config.alignment)?;
        self.out.allocations.push(buffer);
        Ok(buffer)
    }

    /// Buffer the write through `u` lands in: the operand's own buffer when in
    /// place, otherwise a fresh one (initialized from the operand if the op
    /// reads it).
    fn resolve_write(&mut self, module: &mut Module, u: Use, result: ValueId) -> Result<ValueId> {
        let operand = module.operands(u.op)[u.index];
        let buffer = self.buffer(operand)?;
        if self.state.is_in_place(u) {
            return Ok(buffer);
        }
        let ty = tensor_type(module, result)?;
        let initialize = initializes_result(module, u);
        let mut b = Builder::before(module, u.op);
        let fresh = self.allocate_like(&mut b, &ty, buffer)?;
        if initialize {
            self.copy(&mut b, buffer, fresh)?;
        }
        trace!(op = %u.op, operand = u.index, "out-of-place write");
        Ok(fresh)
    }

    fn rewrite(&mut self, module: &mut Module, op: OpId) -> Result<()> {
        let data = module.try_op(op)?.clone();
        match &data.op {
            Op::Func { name, results } => {
                let Some(&block) = data.regions.first() else {
                    return Ok(());
                };
                for arg in module.block(block).args.clone() {
                    if let Some(t) = module.value_type(arg).as_tensor().cloned() {
                        module.set_value_type(arg, Type::MemRef(self.boundary_type(&t)));
                        self.buffers.insert(arg, arg);
                    }
                }
                let lowered = results
                    .iter()
                    .map(|ty| match ty.as_tensor() {
                        Some(t) => Type::MemRef(self.boundary_type(t)),
                        None => ty.clone(),
                    })
                    .collect();
                self.func_results.insert(op, results.clone());
                module.set_op_kind(op, Op::Func { name: name.clone(), results: lowered });
            }
            Op::DenseConstant(values) => {
                let t = tensor_type(module, data.results[0])?;
                let buffer = Builder::before(module, op).create1(
                    Op::BufferConstant(values.clone()),
                    [],
                    Type::MemRef(identity_type(&t)),
                )?;
                self.buffers.insert(data.results[0], buffer);
                self.dead.push(op);
            }
            Op::Empty | Op::AllocTensor => {
                let t = tensor_type(module, data.results[0])?;
                let memref = identity_type(&t).with_space(self.callbacks.memory_space());
                let mut b = Builder::before(module, op);
                let buffer = self.callbacks.allocate(&mut b, memref, &data.operands, self.config.alignment)?;
                self.out.allocations.push(buffer);
                self.buffers.insert(data.results[0], buffer);
                self.dead.push(op);
            }
            Op::ExtractSlice(attrs) => {
                let source = self.buffer(data.operands[0])?;
                let (offsets, sizes) = attrs.mixed(&data.operands[1..]);
                let view = Builder::before(module, op).subview(source, &offsets, &sizes)?;
                self.buffers.insert(data.results[0], view);
                self.dead.push(op);
            }
            Op::InsertSlice(attrs) => {
                let dest = self.resolve_write(module, Use { op, index: 1 }, data.results[0])?;
                let source = self.buffer(data.operands[0])?;
                let (offsets, sizes) = attrs.mixed(&data.operands[2..]);
                let already_there = module.defining_op(source).is_some_and(|view| {
                    matches!(module.op(view).op, Op::SubView(_))
                        && module.operands(view)[0] == dest
                        && slices_match(module, view, op)
                });
                if !already_there {
                    let mut b = Builder::before(module, op);
                    let window = b.subview(dest, &offsets, &sizes)?;
                    self.copy(&mut b, source, window)?;
                }
                self.buffers.insert(data.results[0], dest);
                self.dead.push(op);
            }
            Op::Extract => {
                let source = self.buffer(data.operands[0])?;
                let loaded = Builder::before(module, op).load(source, &data.operands[1..])?;
                module.replace_all_uses_with(data.results[0], loaded);
                self.dead.push(op);
            }
            Op::Insert => {
                let dest = self.resolve_write(module, Use { op, index: 1 }, data.results[0])?;
                Builder::before(module, op).store(data.operands[0], dest, &data.operands[2..])?;
                self.buffers.insert(data.results[0], dest);
                self.dead.push(op);
            }
            Op::Dim { .. } => {
                if let Some(buffer) = self.buffers.get(&data.operands[0]) {
                    module.set_operand(op, 0, *buffer);
                }
            }
            Op::Select if self.state.is_tensor(data.results[0]) => self.rewrite_select(module, op, &data.operands)?,
            Op::ToTensor => {
                self.buffers.insert(data.results[0], data.operands[0]);
                self.dead.push(op);
            }
            Op::ToBuffer => {
                let buffer = self.buffer(data.operands[0])?;
                let declared = module.value_type(data.results[0]).as_memref().cloned().context(UnsupportedSnafu {
                    op,
                    name: "bufferization.to_buffer",
                    what: "a result that is not a memref",
                })?;
                let space = module.value_type(buffer).as_memref().map_or(declared.space, |m| m.space);
                let layout = self.unknown_layout(declared.rank(), is_constant(module, data.operands[0]));
                let expected = Type::MemRef(declared.with_layout(layout).with_space(space));
                let replacement = if module.value_type(buffer) == &expected {
                    buffer
                } else {
                    Builder::before(module, op).create1(Op::MemRefCast, [buffer], expected)?
                };
                module.replace_all_uses_with(data.results[0], replacement);
                self.dead.push(op);
            }
            Op::Structured(_) => self.rewrite_structured(module, op)?,
            Op::For => {
                for (i, init) in data.operands.iter().enumerate().skip(3) {
                    if !self.state.is_tensor(*init) {
                        continue;
                    }
                    let u = Use { op, index: i };
                    let result = data.results[i - 3];
                    let buffer = self.resolve_write(module, u, result)?;
                    module.set_operand(op, i, buffer);
                    let ty = module.value_type(buffer).clone();
                    if let Some(arg) = iter_arg(module, u) {
                        module.set_value_type(arg, ty.clone());
                        self.buffers.insert(arg, arg);
                    }
                    module.set_value_type(result, ty);
                    self.buffers.insert(result, result);
                }
            }
            Op::Yield => self.rewrite_yield(module, op, &data.operands)?,
            Op::Return => self.rewrite_return(module, op, &data.operands)?,
            _ => {}
        }
        Ok(())
    }

    fn rewrite_select(&mut self, module: &mut Module, op: OpId, operands: &[ValueId]) -> Result<()> {
        let (t, f) = (self.buffer(operands[1])?, self.buffer(operands[2])?);
        let result = module.result(op, 0);
        let (tt, ft) = (module.value_type(t).clone(), module.value_type(f).clone());
        let mut b = Builder::before(module, op);
        let selected = if tt == ft {
            b.select(operands[0], t, f)?
        } else {
            let (tm, fm) = (tt.as_memref(), ft.as_memref());
            let space = tm.map(|m| m.space);
            ensure!(
                space.is_some() && space == fm.map(|m| m.space),
                UnsupportedSnafu { op, name: "arith.select", what: "selecting buffers from different memory spaces" }
            );
            let shape = tensor_type(b.module(), result)?;
            let common = identity_type(&shape)
                .with_layout(Layout::fully_dynamic(shape.shape.len()))
                .with_space(space.unwrap_or_default());
            let t = b.create1(Op::MemRefCast, [t], Type::MemRef(common.clone()))?;
            let f = b.create1(Op::MemRefCast, [f], Type::MemRef(common))?;
            b.select(operands[0], t, f)?
        };
        self.buffers.insert(result, selected);
        self.dead.push(op);
        Ok(())
    }

    fn rewrite_structured(&mut self, module: &mut Module, op: OpId) -> Result<()> {
        let p = StructuredParts::of(module, op)?;
        let mut inputs = Vec::with_capacity(p.inputs.len());
        for input in &p.inputs {
            inputs.push(if self.state.is_tensor(*input) { self.buffer(*input)? } else { *input });
        }

        if !p.tensor_semantics() {
            for (i, (old, new)) in p.inputs.iter().zip(&inputs).enumerate() {
                if old != new {
                    module.set_operand(op, i, *new);
                }
            }
            return Ok(());
        }

        let mut outputs = Vec::with_capacity(p.outputs.len());
        for (i, result) in p.results.iter().enumerate() {
            outputs.push(self.resolve_write(module, Use { op, index: p.inputs.len() + i }, *result)?);
        }
        let kind = p.kind().clone();
        let tiled = Builder::before(module, op).create_structured(kind, &inputs, &outputs, &p.extras, None)?;
        if let Some(payload) = p.payload {
            module.set_region(tiled, 0, payload);
        }
        for (result, output) in p.results.iter().zip(&outputs) {
            self.buffers.insert(*result, *output);
        }
        trace!(op = %op, name = p.name(), "bufferized structured op");
        self.dead.push(op);
        Ok(())
    }

    fn rewrite_yield(&mut self, module: &mut Module, op: OpId, operands: &[ValueId]) -> Result<()> {
        let Some(parent) = module.parent_op(op) else {
            return Ok(());
        };
        if !matches!(module.op(parent).op, Op::For) {
            return Ok(());
        }
        for (j, value) in operands.iter().enumerate() {
            if !self.state.is_tensor(*value) {
                continue;
            }
            let buffer = self.buffer(*value)?;
            let arg = iter_arg(module, Use { op: parent, index: j + 3 }).context(MissingBufferSnafu { value: *value })?;
            if buffer != arg {
                let mut b = Builder::before(module, op);
                self.copy(&mut b, buffer, arg)?;
            }
            module.set_operand(op, j, arg);
        }
        Ok(())
    }

    fn rewrite_return(&mut self, module: &mut Module, op: OpId, operands: &[ValueId]) -> Result<()> {
        let Some(parent) = module.parent_op(op) else {
            return Ok(());
        };
        match &module.op(parent).op {
            Op::DispatchRegion => {
                for (j, value) in operands.iter().enumerate() {
                    if !self.state.is_tensor(*value) {
                        continue;
                    }
                    let buffer = self.buffer(*value)?;
                    module.set_operand(op, j, buffer);
                    let result = module.result(parent, j);
                    let ty = module.value_type(buffer).clone();
                    module.set_value_type(result, ty);
                    self.buffers.insert(result, result);
                }
            }
            Op::Func { .. } => {
                let declared = self.func_results.get(&parent).cloned().unwrap_or_default();
                for (j, value) in operands.iter().enumerate() {
                    let Some(t) = declared.get(j).and_then(Type::as_tensor) else {
                        continue;
                    };
                    let buffer = self.buffer(*value)?;
                    let expected = self.boundary_type(t);
                    let actual = module.value_type(buffer).as_memref().cloned();
                    let returned = match actual {
                        Some(m) if m == expected => buffer,
                        // Any global view casts to a fully dynamic layout.
                        Some(m) if m.space == expected.space && !expected.layout.is_identity() => {
                            Builder::before(module, op).create1(Op::MemRefCast, [buffer], Type::MemRef(expected))?
                        }
                        _ => {
                            let mut dynamic = Vec::new();
                            let mut b = Builder::before(module, op);
                            for (d, dim) in t.shape.iter().enumerate() {
                                if dim.is_dynamic() {
                                    let extent = b.dim(buffer, d)?;
                                    dynamic.push(b.materialize(extent)?);
                                }
                            }
                            let fresh = self.callbacks.allocate(&mut b, identity_type(t), &dynamic, self.config.alignment)?;
                            self.out.allocations.push(fresh);
                            self.copy(&mut b, buffer, fresh)?;
                            if expected.layout.is_identity() {
                                fresh
                            } else {
                                b.create1(Op::MemRefCast, [fresh], Type::MemRef(expected))?
                            }
                        }
                    };
                    module.set_operand(op, j, returned);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Replace every tensor op with buffer ops, following the in-place decisions in `state`.
#[tracing::instrument(skip_all)]
pub(crate) fn rewrite(
    module: &mut Module,
    state: &AnalysisState,
    config: &BufferizeConfig,
    callbacks: &dyn BufferCallbacks,
) -> Result<Rewritten> {
    let mut rewriter = Rewriter {
        state,
        config,
        callbacks,
        buffers: HashMap::new(),
        func_results: HashMap::new(),
        dead: Vec::new(),
        out: Rewritten::default(),
    };
    for op in module.walk() {
        if module.is_live(op) {
            rewriter.rewrite(module, op)?;
        }
    }
    for op in rewriter.dead.iter().rev() {
        if module.is_live(*op) {
            module.erase_op(*op);
        }
    }
    Ok(rewriter.out)
}
