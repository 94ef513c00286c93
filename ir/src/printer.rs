//! Deterministic textual form of a module.
//!
//! The output is MLIR-flavoured but not meant to be parsed back; it exists
//! for logs, test failure messages and idempotence checks. Values print by
//! handle, so two modules built the same way print identically.

use std::fmt::{self, Write};

use itertools::Itertools;

use crate::module::{BlockId, Module, OpId, ValueId};
use crate::op::{Op, SliceAttrs};
use crate::structured::StructuredKind;

/// Render the whole module.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for &op in &module.block(module.body()).ops {
        // Writing into a String cannot fail.
        let _ = Printer { module, out: &mut out }.op(op, 0);
    }
    out
}

/// Render one op with its regions.
pub fn print_op(module: &Module, op: OpId) -> String {
    let mut out = String::new();
    let _ = Printer { module, out: &mut out }.op(op, 0);
    out
}

struct Printer<'a> {
    module: &'a Module,
    out: &'a mut String,
}

fn fmt_list<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items.into_iter().join(", ")
}

fn fmt_static(values: &[Option<usize>]) -> String {
    format!("[{}]", values.iter().map(|v| v.map_or("?".to_string(), |v| v.to_string())).join(", "))
}

fn fmt_slice(attrs: &SliceAttrs) -> String {
    format!("offsets = {}, sizes = {}", fmt_static(&attrs.static_offsets), fmt_static(&attrs.static_sizes))
}

/// Inline attributes of an op, empty if it has none.
fn attributes(op: &Op) -> String {
    match op {
        Op::Constant(c) => c.to_string(),
        Op::Binary(b) => b.to_string(),
        Op::Unary(u) => u.to_string(),
        Op::Cast(dt) => format!("to {dt}"),
        Op::Dim { index } => format!("{{index = {index}}}"),
        Op::DenseConstant(values) | Op::BufferConstant(values) => format!("dense<[{}]>", fmt_list(values)),
        Op::ExtractSlice(a) | Op::InsertSlice(a) | Op::SubView(a) => format!("{{{}}}", fmt_slice(a)),
        Op::Alloc { alignment: Some(a) } => format!("{{alignment = {a}}}"),
        Op::SizeOf(dt) => dt.to_string(),
        Op::Structured(s) => {
            let mut attrs = Vec::new();
            match &s.kind {
                StructuredKind::Scatter { dimension_map, unique_indices } => {
                    attrs.push(format!("dimension_map = [{}]", fmt_list(dimension_map)));
                    attrs.push(format!("unique_indices = {unique_indices}"));
                }
                StructuredKind::Sort { dimension } | StructuredKind::TopK { dimension } => {
                    attrs.push(format!("dimension = {dimension}"));
                }
                StructuredKind::Scan { dimension, inclusive } => {
                    attrs.push(format!("dimension = {dimension}"));
                    attrs.push(format!("inclusive = {inclusive}"));
                }
                StructuredKind::Reverse { dimensions } => attrs.push(format!("dimensions = [{}]", fmt_list(dimensions))),
                StructuredKind::Pack(p) | StructuredKind::UnPack(p) => {
                    attrs.push(format!("inner_dims_pos = [{}]", fmt_list(&p.inner_dims_pos)));
                    attrs.push(format!("inner_tiles = {}", fmt_static(&p.static_inner_tiles)));
                    if !p.outer_dims_perm.is_empty() {
                        attrs.push(format!("outer_dims_perm = [{}]", fmt_list(&p.outer_dims_perm)));
                    }
                }
                StructuredKind::Fft => {}
            }
            attrs.push(format!("ins = {}, outs = {}", s.num_inputs, s.num_outputs));
            format!("{{{}}}", attrs.join(", "))
        }
        _ => String::new(),
    }
}

impl Printer<'_> {
    fn indent(&mut self, depth: usize) -> fmt::Result {
        write!(self.out, "{:width$}", "", width = depth * 2)
    }

    fn typed(&self, values: &[ValueId]) -> String {
        fmt_list(values.iter().map(|v| self.module.value_type(*v)))
    }

    fn op(&mut self, op: OpId, depth: usize) -> fmt::Result {
        let module = self.module;
        let data = module.op(op);
        self.indent(depth)?;
        if let Op::Func { name, results } = &data.op {
            let body = data.regions[0];
            let args = &module.block(body).args;
            let params = fmt_list(args.iter().map(|a| format!("{a}: {}", module.value_type(*a))));
            writeln!(self.out, "func.func @{name}({params}) -> ({}) {{", fmt_list(results))?;
            self.block_ops(body, depth + 1)?;
            self.indent(depth)?;
            return writeln!(self.out, "}}");
        }

        if !data.results.is_empty() {
            write!(self.out, "{} = ", fmt_list(&data.results))?;
        }
        write!(self.out, "{}", data.name())?;
        let attrs = attributes(&data.op);
        if !attrs.is_empty() {
            write!(self.out, " {attrs}")?;
        }
        if !data.operands.is_empty() {
            write!(self.out, " {}", fmt_list(&data.operands))?;
        }
        if !data.operands.is_empty() || !data.results.is_empty() {
            write!(self.out, " : ({}) -> ({})", self.typed(&data.operands), self.typed(&data.results))?;
        }
        if data.regions.is_empty() {
            return writeln!(self.out);
        }
        for region in &data.regions {
            writeln!(self.out, " {{")?;
            self.region(*region, depth + 1)?;
            self.indent(depth)?;
            write!(self.out, "}}")?;
        }
        writeln!(self.out)
    }

    fn region(&mut self, block: BlockId, depth: usize) -> fmt::Result {
        let module = self.module;
        let args = &module.block(block).args;
        if !args.is_empty() {
            self.indent(depth.saturating_sub(1))?;
            let params = fmt_list(args.iter().map(|a| format!("{a}: {}", module.value_type(*a))));
            writeln!(self.out, "{block}({params}):")?;
        }
        self.block_ops(block, depth)
    }

    fn block_ops(&mut self, block: BlockId, depth: usize) -> fmt::Result {
        let module = self.module;
        for &op in &module.block(block).ops {
            self.op(op, depth)?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_module(self))
    }
}
