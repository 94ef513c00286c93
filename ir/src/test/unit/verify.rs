use test_case::test_case;

use crate::error::{Error, Result};
use crate::prelude::*;
use crate::test::fixtures::*;
use crate::verify::{verify_module, verify_op};

/// Reason of a verification failure, panicking on success or another error.
fn failure(result: Result<()>) -> (&'static str, String) {
    match result {
        Err(Error::VerificationFailed { name, reason, .. }) => (name, reason),
        other => panic!("expected a verification failure, got {other:?}"),
    }
}

// ============================================================================
// Well-formed fixtures
// ============================================================================

#[test]
fn test_fixtures_verify() {
    let modules = [
        pack_module(&[4, 4], &[0, 1], &[2, 2], &[], None),
        pack_module(&[5, 3], &[0], &[2], &[1, 0], Some(-1)),
        unpack_module(&[2, 2, 2, 2], &[4, 4], &[0, 1], &[2, 2], &[]),
        scatter_module(&[2], 1, &[5], &[0], true, false),
        scatter_module(&[3, 4], 1, &[6, 4], &[0], false, true),
        sort_module(&[3, 5], 1),
        sort_pairs_module(&[6], 0),
        scan_module(&[2, 6], 1, true),
        reverse_module(&[3, 4], &[0, 1]),
        topk_module(&[2, 8], 3, 1),
        fft_module(&[2, 8], 2),
    ];
    for module in modules {
        let module = module.unwrap();
        verify_module(&module).unwrap_or_else(|e| panic!("{e}\n{module}"));
    }
}

// ============================================================================
// Structured op attribute checks
// ============================================================================

#[test]
fn test_pack_tile_must_divide_without_padding() {
    let module = pack_module(&[5, 4], &[0], &[2], &[], None).unwrap();
    let (name, reason) = failure(verify_module(&module));
    assert_eq!(name, "linalg_ext.pack");
    assert!(reason.contains("divide"), "{reason}");

    // The same blocking is fine once partial tiles can be padded.
    let padded = pack_module(&[5, 4], &[0], &[2], &[], Some(0)).unwrap();
    verify_module(&padded).unwrap();
}

#[test]
fn test_pack_rejects_zero_tile() {
    let module = pack_module(&[4, 4], &[1], &[0], &[], Some(0)).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("non-zero"), "{reason}");
}

#[test]
fn test_pack_rejects_non_permutation() {
    let module = pack_module(&[4, 4], &[0], &[2], &[0, 0], None);
    // Building succeeds; only verification looks at the permutation.
    let (_, reason) = failure(verify_module(&module.unwrap()));
    assert!(reason.contains("permutation"), "{reason}");
}

#[test]
fn test_fft_length_must_be_power_of_two() {
    let module = fft_module(&[6], 1).unwrap();
    let (name, reason) = failure(verify_module(&module));
    assert_eq!(name, "linalg_ext.fft");
    assert!(reason.contains("power of two"), "{reason}");
}

#[test_case(&[8], 0 ; "stage zero")]
#[test_case(&[8], 4 ; "block longer than signal")]
#[test_case(&[8], 64 ; "shift overflow")]
fn test_fft_stage_out_of_range(shape: &[usize], stage: usize) {
    let module = fft_module(shape, stage).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("stage"), "{reason}");
}

#[test]
fn test_fft_domain_rejects_overflowing_stage() {
    let mut module = fft_module(&[8], 64).unwrap();
    let op = structured_op(&module).unwrap();
    let err = crate::structured::iteration_domain(&mut Builder::before(&mut module, op), op).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed { .. }), "{err}");
}

#[test]
fn test_scatter_dimension_map_matches_depth() {
    let module = scatter_module(&[2, 3], 1, &[5, 3], &[0, 1], true, false).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("index depth"), "{reason}");
}

#[test]
fn test_sort_dimension_in_range() {
    let module = sort_module(&[4], 1).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("out of range"), "{reason}");
}

#[test]
fn test_reverse_dimensions_unique() {
    let module = reverse_module(&[4, 4], &[0, 0]).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("unique"), "{reason}");
}

// ============================================================================
// Generic structure
// ============================================================================

#[test]
fn test_region_without_terminator() {
    let mut module = Module::new();
    let block = module.create_block(&[]);
    let func = module.create_op(Op::Func { name: "f".into(), results: vec![] }, [], [], [block]);
    let body = module.body();
    module.append_op(body, func);

    assert_eq!(verify_op(&module, func), Err(Error::MissingTerminator { block }));
}

#[test]
fn test_binary_operands_share_dtype() {
    let module = single_func(&[], &[], |b, _| {
        let x = b.constant(ConstValue::Int(1), DType::Int32)?;
        let y = b.const_index(1)?;
        b.create1(Op::Binary(BinaryOp::Add), [x, y], Type::Scalar(DType::Int32))?;
        Ok(vec![])
    })
    .unwrap();
    let (name, _) = failure(verify_module(&module));
    assert_eq!(name, "arith.binary");
}

#[test]
fn test_use_before_definition() {
    let mut module = single_func(&[], &[Type::index()], |b, _| {
        let x = b.const_index(1)?;
        let y = b.const_index(2)?;
        Ok(vec![b.binary(BinaryOp::Add, x, y)?])
    })
    .unwrap();
    verify_module(&module).unwrap();

    let func = module.lookup_func(ENTRY).unwrap();
    let ops = module.block(module.regions(func)[0]).ops.clone();
    module.move_op_before(ops[2], ops[0]).unwrap();
    let (_, reason) = failure(verify_module(&module));
    assert!(reason.contains("dominate"), "{reason}");
}

#[test]
fn test_return_arity_matches_signature() {
    let module = single_func(&[Type::index()], &[Type::index(), Type::index()], |_, args| Ok(vec![args[0]])).unwrap();
    let (name, _) = failure(verify_module(&module));
    assert_eq!(name, "func.func");
}
