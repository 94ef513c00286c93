use trellis_ir::prelude::*;
use trellis_ir::test::fixtures::*;

use crate::shape::*;
use crate::test::helpers::*;

/// `reverse(a, empty(dim(a, 0), 4))` over a tensor with a dynamic leading extent.
fn dynamic_reverse() -> (Module, OpId) {
    let ty = partially_dynamic(&[3, 4], &[0], DType::Int32);
    let module = single_func(&[ty.clone()], &[ty], |b, args| {
        let rows = b.dim(args[0], 0)?;
        let dest = b.empty(&[rows, SInt::Const(4)], DType::Int32)?;
        let op = b.reverse(args[0], dest, &[1])?;
        Ok(vec![b.module().result(op, 0)])
    })
    .unwrap();
    let op = structured_op(&module).unwrap();
    (module, op)
}

#[test]
fn test_loop_ranges_collapse_reductions() {
    let mut module = sort_module(&[4, 6], 1).unwrap();
    let op = structured_op(&module).unwrap();
    let ranges = loop_ranges(&mut Builder::before(&mut module, op), op).unwrap();
    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0].size, SInt::Const(4));
    assert_eq!(ranges[1].size, SInt::Const(1));
    assert!(ranges.iter().all(|r| r.offset.is(0)));
}

#[test]
fn test_loop_ranges_of_slices() {
    let mut module = single_func(&[i32_tensor(&[8, 8])], &[i32_tensor(&[2, 3])], |b, args| {
        let slice = b.extract_slice(args[0], &[SInt::Const(1), SInt::Const(4)], &[SInt::Const(2), SInt::Const(3)])?;
        Ok(vec![slice])
    })
    .unwrap();
    let slice = ops_where(&module, |op| matches!(op, Op::ExtractSlice(_)))[0];
    let ranges = loop_ranges(&mut Builder::before(&mut module, slice), slice).unwrap();
    let sizes: Vec<SInt> = ranges.iter().map(|r| r.size).collect();
    assert_eq!(sizes, vec![SInt::Const(2), SInt::Const(3)]);
    assert!(ranges.iter().all(|r| r.offset.is(0)));
}

#[test]
fn test_loop_ranges_reject_other_ops() {
    let mut module = reverse_module(&[4], &[0]).unwrap();
    let ret = entry_return(&module);
    let err = loop_ranges(&mut Builder::before(&mut module, ret), ret).unwrap_err();
    assert!(matches!(err, crate::Error::Unsupported { .. }), "{err}");
}

#[test]
fn test_reify_through_tied_output() {
    let (mut module, op) = dynamic_reverse();
    let result = module.result(op, 0);
    let before = module.watermark();
    let dims = reify_dynamic_result_dims(&mut module, result).unwrap();
    assert_eq!(dims.len(), 1);
    // The extent already exists as the size operand of the destination.
    assert_eq!(module.defining(dims[0]), Some(&Op::Dim { index: 0 }));
    assert_eq!(module.watermark(), before);
}

#[test]
fn test_reify_block_argument_emits_dim() {
    let (mut module, _) = dynamic_reverse();
    let arg = module.block(module.regions(entry(&module))[0]).args[0];
    let dims = reify_dynamic_result_dims(&mut module, arg).unwrap();
    assert_eq!(dims.len(), 1);
    assert_eq!(module.defining(dims[0]), Some(&Op::Dim { index: 0 }));
    assert_verifies(&module);
}

#[test]
fn test_reify_static_value() {
    let mut module = reverse_module(&[2, 5], &[0]).unwrap();
    let op = structured_op(&module).unwrap();
    let result = module.result(op, 0);
    assert!(reify_dynamic_result_dims(&mut module, result).unwrap().is_empty());
    assert_eq!(reify_result_dims(&mut module, result).unwrap().as_slice(), &[SInt::Const(2), SInt::Const(5)]);
}

#[test]
fn test_reify_scalar_fails() {
    let mut module = single_func(&[Type::index()], &[Type::index()], |_, args| Ok(vec![args[0]])).unwrap();
    let arg = module.block(module.regions(entry(&module))[0]).args[0];
    let err = reify_result_dims(&mut module, arg).unwrap_err();
    assert!(matches!(err, crate::Error::Reification { .. }), "{err}");
}

#[test]
fn test_values_match_structurally() {
    let mut module = Module::new();
    let block = module.body();
    let mut b = Builder::at_end(&mut module, block);
    let (c1, c2, c3) = (b.const_index(4).unwrap(), b.const_index(4).unwrap(), b.const_index(5).unwrap());
    let x = b.binary(BinaryOp::Add, c1, c3).unwrap();
    let y = b.binary(BinaryOp::Add, c2, c3).unwrap();
    let z = b.binary(BinaryOp::Mul, c2, c3).unwrap();
    assert!(values_match(&module, c1, c2));
    assert!(!values_match(&module, c1, c3));
    assert!(values_match(&module, x, y));
    assert!(!values_match(&module, x, z));
}

#[test]
fn test_slices_match_mixed_offsets() {
    let mut module = single_func(&[i32_tensor(&[8])], &[i32_tensor(&[2]), i32_tensor(&[2])], |b, args| {
        let one = b.const_index(1)?;
        let a = b.extract_slice(args[0], &[SInt::Const(1)], &[SInt::Const(2)])?;
        let c = b.extract_slice(args[0], &[SInt::Symbolic(one)], &[SInt::Const(2)])?;
        Ok(vec![a, c])
    })
    .unwrap();
    let slices = ops_where(&module, |op| matches!(op, Op::ExtractSlice(_)));
    assert!(slices_match(&module, slices[0], slices[1]));

    let three = Builder::before(&mut module, slices[1]).const_index(3).unwrap();
    module.set_operand(slices[1], 1, three);
    assert!(!slices_match(&module, slices[0], slices[1]));
}
