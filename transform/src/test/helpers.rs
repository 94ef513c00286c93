//! Helpers shared by the transformation tests.
//!
//! Modules come from the IR fixtures; these helpers run them before and
//! after a transformation so tests can compare observable results.

use trellis_ir::test::fixtures::{ENTRY, run};
use trellis_ir::{Interpreter, MemRefView, Module, NdArray, Op, OpId, RuntimeValue, ValueId, verify_module};

/// Run [`ENTRY`] on tensor arguments.
pub fn run_tensors(module: &Module, args: &[NdArray]) -> Vec<NdArray> {
    run(module, args.to_vec()).unwrap_or_else(|e| panic!("{e}\n{module}"))
}

/// Run a bufferized [`ENTRY`], passing each argument in a fresh buffer.
pub fn run_buffers(module: &Module, args: &[NdArray]) -> Vec<NdArray> {
    let views = args.iter().map(MemRefView::from_array).collect();
    run_views(module, views)
}

/// Run a bufferized [`ENTRY`] on caller-owned buffers.
pub fn run_views(module: &Module, views: Vec<MemRefView>) -> Vec<NdArray> {
    let args = views.into_iter().map(RuntimeValue::MemRef).collect();
    let results = Interpreter::new(module).call(ENTRY, args).unwrap_or_else(|e| panic!("{e}\n{module}"));
    results.iter().filter_map(RuntimeValue::to_array).map(|r| r.unwrap()).collect()
}

pub fn assert_verifies(module: &Module) {
    verify_module(module).unwrap_or_else(|e| panic!("{e}\n{module}"));
}

pub fn entry(module: &Module) -> OpId {
    module.lookup_func(ENTRY).expect("fixture defines the entry function")
}

/// The `func.return` of [`ENTRY`].
pub fn entry_return(module: &Module) -> OpId {
    let body = module.regions(entry(module))[0];
    module.terminator(body).expect("entry body is terminated")
}

pub fn entry_args(module: &Module) -> Vec<ValueId> {
    module.block(module.regions(entry(module))[0]).args.to_vec()
}

/// Live ops matching `pred`.
pub fn ops_where(module: &Module, pred: impl Fn(&Op) -> bool) -> Vec<OpId> {
    module.walk().into_iter().filter(|op| pred(&module.op(*op).op)).collect()
}

pub fn count_ops(module: &Module, pred: impl Fn(&Op) -> bool) -> usize {
    ops_where(module, pred).len()
}
