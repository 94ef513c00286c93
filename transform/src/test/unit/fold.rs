use test_case::test_case;
use trellis_ir::prelude::*;
use trellis_ir::test::fixtures::*;
use trellis_ir::{Interpreter, RuntimeValue};

use crate::config::FoldConfig;
use crate::error::Error;
use crate::fold::*;
use crate::test::helpers::*;

fn int32() -> Type {
    Type::Scalar(DType::Int32)
}

fn eval(module: &Module, args: &[ConstValue]) -> Vec<Option<ConstValue>> {
    let args = args.iter().copied().map(RuntimeValue::Scalar).collect();
    let results = Interpreter::new(module).call(ENTRY, args).unwrap_or_else(|e| panic!("{e}\n{module}"));
    results.iter().map(RuntimeValue::as_scalar).collect()
}

fn returned(module: &Module) -> Vec<ValueId> {
    module.operands(entry_return(module)).to_vec()
}

/// Canonicalize and check the scalar results are unchanged for `args`.
fn assert_canonicalizes(module: Module, args: &[ConstValue]) -> (Module, FoldStats) {
    let expected = eval(&module, args);
    let mut folded = module;
    let stats = canonicalize(&mut folded, &FoldConfig::default()).unwrap_or_else(|e| panic!("{e}\n{folded}"));
    assert!(stats.converged, "{folded}");
    assert_verifies(&folded);
    assert_eq!(eval(&folded, args), expected, "{folded}");
    (folded, stats)
}

// ============================================================================
// Arithmetic
// ============================================================================

#[test_case(BinaryOp::Add, 3, 4, 7)]
#[test_case(BinaryOp::Sub, 3, 5, -2)]
#[test_case(BinaryOp::Mul, -6, 7, -42)]
#[test_case(BinaryOp::Idiv, -7, 2, -3)]
#[test_case(BinaryOp::Min, -6, 7, -6)]
#[test_case(BinaryOp::Max, -6, 7, 7)]
#[test_case(BinaryOp::Add, i32::MAX as i64, 1, i32::MIN as i64 ; "add wraps to i32")]
fn test_constant_binary(op: BinaryOp, a: i64, b: i64, expected: i64) {
    let module = single_func(&[], &[int32()], |bl, _| {
        let (x, y) = (bl.constant(ConstValue::Int(a), DType::Int32)?, bl.constant(ConstValue::Int(b), DType::Int32)?);
        Ok(vec![bl.binary(op, x, y)?])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    assert_eq!(folded.constant_int(returned(&folded)[0]), Some(expected));
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::Constant(_))), 1, "operands are erased once unused");
}

#[test]
fn test_integer_identities() {
    let ops = [
        (BinaryOp::Add, Some(0), None),
        (BinaryOp::Add, None, Some(0)),
        (BinaryOp::Sub, Some(0), None),
        (BinaryOp::Mul, Some(1), None),
        (BinaryOp::Mul, None, Some(1)),
        (BinaryOp::Idiv, Some(1), None),
        (BinaryOp::CeilDiv, Some(1), None),
    ];
    let module = single_func(&[Type::index()], &vec![Type::index(); ops.len() + 2], |b, args| {
        let x = args[0];
        let mut results = Vec::new();
        for (op, rhs, lhs) in ops {
            let lhs = lhs.map(|c| b.const_index(c)).transpose()?.unwrap_or(x);
            let rhs = rhs.map(|c| b.const_index(c)).transpose()?.unwrap_or(x);
            results.push(b.binary(op, lhs, rhs)?);
        }
        results.push(b.binary(BinaryOp::Min, x, x)?);
        results.push(b.binary(BinaryOp::Max, x, x)?);
        Ok(results)
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(9)]);
    let x = entry_args(&folded)[0];
    assert!(returned(&folded).iter().all(|v| *v == x), "{folded}");
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::Binary(_))), 0);
}

#[test]
fn test_same_operand_folds() {
    let module = single_func(&[Type::index()], &[Type::index(), Type::i1(), Type::i1(), Type::index()], |b, args| {
        let x = args[0];
        let zero = b.const_index(0)?;
        Ok(vec![
            b.binary(BinaryOp::Sub, x, x)?,
            b.binary(BinaryOp::Le, x, x)?,
            b.binary(BinaryOp::Lt, x, x)?,
            b.binary(BinaryOp::Mul, x, zero)?,
        ])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(5)]);
    let results = returned(&folded);
    assert_eq!(folded.constant_int(results[0]), Some(0));
    assert_eq!(folded.constant_value(results[1]), Some(ConstValue::Bool(true)));
    assert_eq!(folded.constant_value(results[2]), Some(ConstValue::Bool(false)));
    assert_eq!(folded.constant_int(results[3]), Some(0));
}

#[test]
fn test_float_identity_kept() {
    let f32_ty = Type::Scalar(DType::Float32);
    let mut module = single_func(&[f32_ty.clone()], &[f32_ty], |b, args| {
        let zero = b.constant(ConstValue::Float(0.0), DType::Float32)?;
        Ok(vec![b.binary(BinaryOp::Add, args[0], zero)?])
    })
    .unwrap();
    let stats = canonicalize(&mut module, &FoldConfig::default()).unwrap();
    assert_eq!(stats.rewrites, 0);
    assert_eq!(count_ops(&module, |op| matches!(op, Op::Binary(BinaryOp::Add))), 1);
}

#[test]
fn test_cast_and_unary() {
    let module = single_func(&[int32()], &[int32(), Type::index(), int32()], |b, args| {
        let same = b.create1(Op::Cast(DType::Int32), [args[0]], int32())?;
        let seven = b.constant(ConstValue::Int(7), DType::Int32)?;
        let widened = b.cast(seven, DType::Index)?;
        let negated = b.unary(UnaryOp::Neg, seven)?;
        Ok(vec![same, widened, negated])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(-4)]);
    let results = returned(&folded);
    assert_eq!(results[0], entry_args(&folded)[0]);
    assert_eq!(folded.constant_int(results[1]), Some(7));
    assert_eq!(folded.value_type(results[1]), &Type::index());
    assert_eq!(folded.constant_int(results[2]), Some(-7));
}

#[test]
fn test_select_folds() {
    let module = single_func(&[Type::i1(), int32(), int32()], &[int32(), int32(), int32()], |b, args| {
        let [c, x, y] = [args[0], args[1], args[2]];
        let yes = b.const_bool(true)?;
        Ok(vec![b.select(yes, x, y)?, b.select(c, y, y)?, b.select(c, x, y)?])
    })
    .unwrap();
    let args = [ConstValue::Bool(false), ConstValue::Int(1), ConstValue::Int(2)];
    let (folded, _) = assert_canonicalizes(module, &args);
    let (params, results) = (entry_args(&folded), returned(&folded));
    assert_eq!(results[0], params[1]);
    assert_eq!(results[1], params[2]);
    assert!(matches!(folded.defining(results[2]), Some(Op::Select)));
}

#[test]
fn test_dim_folds() {
    let ty = partially_dynamic(&[3, 4], &[0], DType::Int32);
    let module = single_func(&[ty, Type::index()], &[Type::index(), Type::index()], |b, args| {
        let (t, n) = (args[0], args[1]);
        let fixed = b.create1(Op::Dim { index: 1 }, [t], Type::index())?;
        let e = b.empty(&[SInt::Symbolic(n), SInt::Const(4)], DType::Int32)?;
        let rows = b.create1(Op::Dim { index: 0 }, [e], Type::index())?;
        Ok(vec![fixed, rows])
    })
    .unwrap();
    let mut folded = module;
    canonicalize(&mut folded, &FoldConfig::default()).unwrap();
    let (params, results) = (entry_args(&folded), returned(&folded));
    assert_eq!(folded.constant_int(results[0]), Some(4));
    assert_eq!(results[1], params[1]);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::Empty)), 0);
}

#[test]
fn test_dynamic_dim_of_argument_kept() {
    let ty = partially_dynamic(&[3, 4], &[0], DType::Int32);
    let mut module = single_func(&[ty], &[Type::index()], |b, args| {
        Ok(vec![b.create1(Op::Dim { index: 0 }, [args[0]], Type::index())?])
    })
    .unwrap();
    let dim = ops_where(&module, |op| matches!(op, Op::Dim { .. }))[0];
    let before = module.to_string();
    assert_eq!(fold_op(&mut module, dim).unwrap(), FoldResult::NoMatch);
    assert_eq!(module.to_string(), before);
}

// ============================================================================
// Ranges
// ============================================================================

#[test]
fn test_range_min_max() {
    let index = Type::index();
    let module = single_func(&[index.clone(), index.clone()], &vec![index.clone(); 4], |b, args| {
        let [x, y] = [args[0], args[1]];
        let (c2, c4, c9) = (b.const_index(2)?, b.const_index(4)?, b.const_index(9)?);
        Ok(vec![
            b.create1(Op::RangeMin, [x, c4, y, c2, x], index.clone())?,
            b.create1(Op::RangeMax, [x, x], index.clone())?,
            b.create1(Op::RangeMax, [c4, c9, c2], index.clone())?,
            b.create1(Op::RangeMin, [x, c4], index.clone())?,
        ])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(3), ConstValue::Int(1)]);
    let (params, results) = (entry_args(&folded), returned(&folded));

    let min = folded.defining_op(results[0]).unwrap();
    assert!(matches!(folded.op(min).op, Op::RangeMin));
    let operands = folded.operands(min);
    assert_eq!(&operands[..2], &params[..]);
    assert_eq!(folded.constant_int(operands[2]), Some(2));

    assert_eq!(results[1], params[0]);
    assert_eq!(folded.constant_int(results[2]), Some(9));
    assert!(matches!(folded.defining(results[3]), Some(Op::Binary(BinaryOp::Min))));
}

#[test]
fn test_range_extents_constant() {
    let index = Type::index();
    let module = single_func(&[], &[index.clone(), index.clone()], |b, _| {
        let [o1, o2, l1, l2] = [b.const_index(2)?, b.const_index(8)?, b.const_index(4)?, b.const_index(3)?];
        let op = b.create(Op::RangeExtents, [o1, o2, l1, l2], [index.clone(), index.clone()])?;
        Ok(b.module().results(op).to_vec())
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    let results = returned(&folded);
    assert_eq!(folded.constant_int(results[0]), Some(2));
    assert_eq!(folded.constant_int(results[1]), Some(10));
}

#[test]
fn test_range_extents_overflowing_end_kept() {
    let long = Type::Scalar(DType::Int64);
    let module = single_func(&[], &[long.clone(), long.clone()], |b, _| {
        let offset = b.constant(ConstValue::Int(i64::MAX), DType::Int64)?;
        let length = b.constant(ConstValue::Int(2), DType::Int64)?;
        let op = b.create(Op::RangeExtents, [offset, length], [long.clone(), long.clone()])?;
        Ok(b.module().results(op).to_vec())
    })
    .unwrap();
    let mut folded = module;
    let op = ops_where(&folded, |op| matches!(op, Op::RangeExtents))[0];
    assert!(matches!(fold_op(&mut folded, op).unwrap(), FoldResult::NoMatch));
    let stats = canonicalize(&mut folded, &FoldConfig::default()).unwrap();
    assert!(stats.converged);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::RangeExtents)), 1, "{folded}");
}

#[test]
fn test_range_extents_expanded() {
    let index = Type::index();
    let module = single_func(&[index.clone(), index.clone(), index.clone()], &vec![index.clone(); 4], |b, args| {
        let [x, y, n] = [args[0], args[1], args[2]];
        let twice = b.create(Op::RangeExtents, [x, x, n, n], [index.clone(), index.clone()])?;
        let pair = b.create(Op::RangeExtents, [x, y, n, n], [index.clone(), index.clone()])?;
        Ok(b.module().results(twice).iter().chain(b.module().results(pair)).copied().collect())
    })
    .unwrap();
    let args = [ConstValue::Int(5), ConstValue::Int(2), ConstValue::Int(4)];
    let (folded, _) = assert_canonicalizes(module, &args);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::RangeExtents)), 0, "{folded}");
    assert_eq!(returned(&folded)[0], entry_args(&folded)[0]);
    assert_eq!(
        eval(&folded, &args),
        [5, 8, 2, 8].map(|v| Some(ConstValue::Int(v))).to_vec()
    );
}

// ============================================================================
// Alignment
// ============================================================================

#[test_case(13, 8, 16)]
#[test_case(16, 8, 16)]
#[test_case(0, 4, 0)]
#[test_case(-3, 4, 0 ; "negative rounds up")]
fn test_align_constants(value: i64, alignment: i64, expected: i64) {
    let module = single_func(&[], &[Type::index()], |b, _| {
        let v = b.constant(ConstValue::Int(value), DType::Index)?;
        let a = b.constant(ConstValue::Int(alignment), DType::Index)?;
        Ok(vec![b.create1(Op::Align, [v, a], Type::index())?])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    assert_eq!(folded.constant_int(returned(&folded)[0]), Some(expected));
}

#[test]
fn test_align_of_aligned_values() {
    let index = Type::index();
    let module = single_func(&[index.clone(), index.clone()], &[index.clone(), index.clone(), index.clone()], |b, args| {
        let [x, a] = [args[0], args[1]];
        let (c8, c16) = (b.const_index(8)?, b.const_index(16)?);
        let scaled = b.binary(BinaryOp::Mul, x, c8)?;
        let by_const = b.create1(Op::Align, [scaled, c8], index.clone())?;
        let coarse = b.create1(Op::Align, [x, c16], index.clone())?;
        let nested = b.create1(Op::Align, [coarse, c8], index.clone())?;
        let stepped = b.create1(Op::Align, [x, a], index.clone())?;
        let sum = b.binary(BinaryOp::Add, stepped, a)?;
        let symbolic = b.create1(Op::Align, [sum, a], index.clone())?;
        Ok(vec![by_const, nested, symbolic])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(5), ConstValue::Int(4)]);
    let results = returned(&folded);
    assert!(matches!(folded.defining(results[0]), Some(Op::Binary(BinaryOp::Mul))));
    assert!(matches!(folded.defining(results[1]), Some(Op::Align)));
    assert!(matches!(folded.defining(results[2]), Some(Op::Binary(BinaryOp::Add))));
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::Align)), 2, "{folded}");
}

#[test]
fn test_alignment_not_proven_through_shared_values() {
    let index = Type::index();
    let module = single_func(&[index.clone()], &[index.clone(), index.clone()], |b, args| {
        let c8 = b.const_index(8)?;
        let scaled = b.binary(BinaryOp::Mul, args[0], c8)?;
        let sum = b.binary(BinaryOp::Add, scaled, c8)?;
        let aligned = b.create1(Op::Align, [sum, c8], index.clone())?;
        Ok(vec![aligned, scaled])
    })
    .unwrap();
    let scaled = returned(&module)[1];
    let c8 = module.operands(module.defining_op(scaled).unwrap())[1];
    assert!(is_aligned_to(&module, scaled, c8));

    // `scaled` is also returned, so the sum is not followed into it.
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Int(3)]);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::Align)), 1);
}

#[test]
fn test_sizeof() {
    let module = single_func(&[], &[Type::index(), Type::index()], |b, _| {
        Ok(vec![
            b.create1(Op::SizeOf(DType::Float32), [], Type::index())?,
            b.create1(Op::SizeOf(DType::Int64), [], Type::index())?,
        ])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    let results = returned(&folded);
    assert_eq!(folded.constant_int(results[0]), Some(4));
    assert_eq!(folded.constant_int(results[1]), Some(8));
}

// ============================================================================
// Byte buffers
// ============================================================================

/// 16-byte buffer filled with a repeating i32 pattern; returns `(buffer, size)`.
fn filled_buffer(b: &mut Builder) -> trellis_ir::Result<(ValueId, ValueId)> {
    let size = b.const_index(16)?;
    let buf = b.create1(Op::BufferAlloc, [size], Type::ByteBuffer)?;
    let pattern = b.constant(ConstValue::Int(0x0403_0201), DType::Int32)?;
    let zero = b.const_index(0)?;
    b.create(Op::BufferFill, [pattern, buf, size, zero, size], [])?;
    Ok((buf, size))
}

#[test]
fn test_identity_subspan() {
    let module = single_func(&[], &[int32()], |b, _| {
        let (buf, size) = filled_buffer(b)?;
        let zero = b.const_index(0)?;
        let view = b.create1(Op::BufferSubspan, [buf, size, zero, size], Type::ByteBuffer)?;
        let four = b.const_index(4)?;
        Ok(vec![b.create1(Op::BufferLoad, [view, size, four], int32())?])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::BufferSubspan)), 0);
    let load = ops_where(&folded, |op| matches!(op, Op::BufferLoad))[0];
    let buf = ops_where(&folded, |op| matches!(op, Op::BufferAlloc))[0];
    assert_eq!(folded.operands(load)[0], folded.result(buf, 0));
}

#[test]
fn test_subspan_chain_collapses_into_access() {
    let module = single_func(&[], &[int32()], |b, _| {
        let (buf, size) = filled_buffer(b)?;
        let [c2, c4, c8, c12] = [b.const_index(2)?, b.const_index(4)?, b.const_index(8)?, b.const_index(12)?];
        let outer = b.create1(Op::BufferSubspan, [buf, size, c4, c12], Type::ByteBuffer)?;
        let inner = b.create1(Op::BufferSubspan, [outer, c12, c2, c8], Type::ByteBuffer)?;
        Ok(vec![b.create1(Op::BufferLoad, [inner, c8, c4], int32())?])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[]);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::BufferSubspan)), 0, "{folded}");
    let load = ops_where(&folded, |op| matches!(op, Op::BufferLoad))[0];
    let operands = folded.operands(load);
    assert_eq!(folded.constant_int(operands[1]), Some(16));
    assert_eq!(folded.constant_int(operands[2]), Some(10));
}

#[test]
fn test_select_between_subspans() {
    let module = single_func(&[Type::i1()], &[int32()], |b, args| {
        let (buf, size) = filled_buffer(b)?;
        let [zero, c8, c1] = [b.const_index(0)?, b.const_index(8)?, b.const_index(1)?];
        let low = b.create1(Op::BufferSubspan, [buf, size, zero, c8], Type::ByteBuffer)?;
        let high = b.create1(Op::BufferSubspan, [buf, size, c8, c8], Type::ByteBuffer)?;
        let view = b.select(args[0], low, high)?;
        Ok(vec![b.create1(Op::BufferLoad, [view, c8, c1], int32())?])
    })
    .unwrap();
    let expected_false = eval(&module, &[ConstValue::Bool(false)]);
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Bool(true)]);
    assert_eq!(eval(&folded, &[ConstValue::Bool(false)]), expected_false);
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::BufferSubspan)), 0, "{folded}");
    assert!(!folded.walk().into_iter().any(|op| {
        matches!(folded.op(op).op, Op::Select) && folded.value_type(folded.result(op, 0)) == &Type::ByteBuffer
    }));
}

#[test]
fn test_buffer_size_forwarding() {
    let module = single_func(&[Type::i1()], &[Type::index(), Type::index(), Type::index()], |b, args| {
        let (buf, size) = filled_buffer(b)?;
        let [c4, c12] = [b.const_index(4)?, b.const_index(12)?];
        let view = b.create1(Op::BufferSubspan, [buf, size, c4, c12], Type::ByteBuffer)?;
        let either = b.select(args[0], buf, view)?;
        Ok(vec![
            b.create1(Op::BufferSize, [buf], Type::index())?,
            b.create1(Op::BufferSize, [view], Type::index())?,
            b.create1(Op::BufferSize, [either], Type::index())?,
        ])
    })
    .unwrap();
    let (folded, _) = assert_canonicalizes(module, &[ConstValue::Bool(false)]);
    let results = returned(&folded);
    assert_eq!(folded.constant_int(results[0]), Some(16));
    assert_eq!(folded.constant_int(results[1]), Some(12));
    assert_eq!(count_ops(&folded, |op| matches!(op, Op::BufferSize)), 0, "{folded}");
    assert_eq!(eval(&folded, &[ConstValue::Bool(true)])[2], Some(ConstValue::Int(16)));
}

// ============================================================================
// Driver
// ============================================================================

#[test]
fn test_canonicalize_is_idempotent() {
    let module = single_func(&[Type::index()], &[Type::index()], |b, args| {
        let (c0, c3, c4) = (b.const_index(0)?, b.const_index(3)?, b.const_index(4)?);
        let seven = b.binary(BinaryOp::Add, c3, c4)?;
        let x = b.binary(BinaryOp::Add, args[0], c0)?;
        Ok(vec![b.binary(BinaryOp::Mul, x, seven)?])
    })
    .unwrap();
    let (mut folded, first) = assert_canonicalizes(module, &[ConstValue::Int(6)]);
    assert!(first.rewrites > 0);
    assert!(first.erased > 0);

    let second = canonicalize(&mut folded, &FoldConfig::default()).unwrap();
    assert_eq!(second, FoldStats { iterations: 1, rewrites: 0, erased: 0, converged: true });
}

#[test]
fn test_iteration_bound() {
    let build = || {
        single_func(&[], &[Type::index()], |b, _| {
            let (c3, c4) = (b.const_index(3)?, b.const_index(4)?);
            Ok(vec![b.binary(BinaryOp::Add, c3, c4)?])
        })
        .unwrap()
    };

    let mut lenient = build();
    let stats = canonicalize(&mut lenient, &FoldConfig::builder().max_iterations(1).build()).unwrap();
    assert_eq!(stats.iterations, 1);
    assert!(!stats.converged);

    let mut strict = build();
    let err = canonicalize(&mut strict, &FoldConfig::builder().max_iterations(1).strict(true).build()).unwrap_err();
    assert_eq!(err, Error::NoFixedPoint { iterations: 1 });
}

#[test]
fn test_dead_pure_ops_erased() {
    let mut module = single_func(&[Type::index()], &[Type::index()], |b, args| {
        let c5 = b.const_index(5)?;
        b.binary(BinaryOp::Mul, args[0], c5)?;
        let size = b.const_index(8)?;
        b.create1(Op::BufferAlloc, [size], Type::ByteBuffer)?;
        Ok(vec![args[0]])
    })
    .unwrap();
    assert_eq!(eliminate_dead_ops(&mut module), 2);
    assert_eq!(count_ops(&module, |op| matches!(op, Op::BufferAlloc)), 1);
    assert_eq!(count_ops(&module, |op| matches!(op, Op::Constant(_))), 1);
}

#[test]
fn test_no_match_leaves_module() {
    let mut module = single_func(&[Type::index(), Type::index()], &[Type::index()], |b, args| {
        Ok(vec![b.binary(BinaryOp::Add, args[0], args[1])?])
    })
    .unwrap();
    let add = ops_where(&module, |op| matches!(op, Op::Binary(_)))[0];
    let before = module.to_string();
    assert_eq!(fold_op(&mut module, add).unwrap(), FoldResult::NoMatch);
    assert_eq!(module.to_string(), before);
}
