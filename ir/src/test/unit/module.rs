use crate::prelude::*;
use crate::test::fixtures::{i32_tensor, single_func};

fn index_func() -> (Module, OpId) {
    let mut module = Module::new();
    let body = module.body();
    let func = Builder::at_end(&mut module, body)
        .func("f", &[Type::index(), Type::index()], &[Type::index()], |b, args| {
            Ok(vec![b.binary(BinaryOp::Add, args[0], args[1])?])
        })
        .unwrap();
    (module, func)
}

// ============================================================================
// Use lists and rewiring
// ============================================================================

#[test]
fn test_uses_follow_operands() {
    let (module, func) = index_func();
    let block = module.regions(func)[0];
    let args = module.block(block).args.clone();
    let add = module.block(block).ops[0];

    assert_eq!(module.uses(args[0]), vec![Use { op: add, index: 0 }]);
    assert_eq!(module.users(args[1]), vec![add]);
    assert!(module.has_one_use(module.result(add, 0)));
}

#[test]
fn test_replace_all_uses_rewires_every_slot() {
    let (mut module, func) = index_func();
    let block = module.regions(func)[0];
    let args = module.block(block).args.clone();
    let add = module.block(block).ops[0];

    module.replace_all_uses_with(args[1], args[0]);
    assert_eq!(module.operands(add), &[args[0], args[0]]);
    assert!(!module.has_uses(args[1]));
}

#[test]
fn test_replace_uses_if_is_selective() {
    let (mut module, func) = index_func();
    let block = module.regions(func)[0];
    let args = module.block(block).args.clone();
    let add = module.block(block).ops[0];
    module.set_operand(add, 1, args[0]);

    let changed = module.replace_uses_if(args[0], args[1], |_, u| u.index == 1);
    assert_eq!(changed, 1);
    assert_eq!(module.operands(add), &[args[0], args[1]]);
}

// ============================================================================
// Erasure, rollback and generations
// ============================================================================

#[test]
fn test_erase_removes_nested_ops() {
    let (mut module, func) = index_func();
    let add = module.block(module.regions(func)[0]).ops[0];
    module.erase_op(func);

    assert!(!module.is_live(func));
    assert!(!module.is_live(add));
    assert!(module.try_op(add).is_err());
    assert!(module.walk().is_empty());
}

#[test]
fn test_rollback_erases_only_newer_ops() {
    let (mut module, func) = index_func();
    let block = module.regions(func)[0];
    let terminator = module.terminator(block).unwrap();
    let mark = module.watermark();

    let extra = {
        let mut b = Builder::before(&mut module, terminator);
        let c = b.const_index(7).unwrap();
        b.module().defining_op(c).unwrap()
    };
    assert!(module.is_live(extra));

    module.rollback(mark);
    assert!(!module.is_live(extra));
    assert!(module.is_live(func));
    assert_eq!(module.block(block).ops.len(), 2);
}

#[test]
fn test_every_mutation_bumps_generation() {
    let (mut module, func) = index_func();
    let before = module.generation();
    let add = module.block(module.regions(func)[0]).ops[0];
    let arg = module.operands(add)[0];
    module.set_operand(add, 1, arg);
    assert!(module.generation() > before);
}

#[test]
fn test_move_op_before_reorders_block() {
    let module = single_func(&[i32_tensor(&[4])], &[], |b, _| {
        b.const_index(1)?;
        b.const_index(2)?;
        Ok(vec![])
    });
    let mut module = module.unwrap();
    let func = module.lookup_func("main").unwrap();
    let block = module.regions(func)[0];
    let ops = module.block(block).ops.clone();

    module.move_op_before(ops[1], ops[0]).unwrap();
    assert_eq!(module.block(block).ops[..2], [ops[1], ops[0]]);
    assert_eq!(module.position(ops[0]).unwrap(), (block, 1));
}

#[test]
fn test_ancestors_walk_outwards() {
    let module = single_func(&[], &[], |b, _| {
        b.for_loop(SInt::Const(0), SInt::Const(4), SInt::Const(1), &[], |b, iv, _| {
            b.binary(BinaryOp::Add, iv, iv)?;
            Ok(vec![])
        })?;
        Ok(vec![])
    })
    .unwrap();
    let func = module.lookup_func("main").unwrap();
    let add = module
        .walk()
        .into_iter()
        .find(|op| matches!(module.op(*op).op, Op::Binary(BinaryOp::Add)))
        .unwrap();
    let ancestors = module.ancestors(add);

    assert_eq!(ancestors.last(), Some(&func));
    assert!(module.is_proper_ancestor(func, add));
    assert!(!module.is_proper_ancestor(add, func));
}
