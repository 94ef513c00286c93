//! Reference semantics of the structured ops and the buffer model.

use crate::error::Error;
use crate::interp::{ByteView, Interpreter, MemRefView, NdArray, RuntimeValue};
use crate::prelude::*;
use crate::test::fixtures::*;
use crate::ty::static_shape;
use crate::verify::verify_module;

fn run_ok(module: Result<Module, Error>, args: Vec<NdArray>) -> Vec<NdArray> {
    let module = module.unwrap();
    run(&module, args).unwrap_or_else(|e| panic!("{e}\n{module}"))
}

fn as_ints(array: &NdArray) -> Vec<i64> {
    array.to_ints().into_iter().map(Option::unwrap).collect()
}

fn as_floats(array: &NdArray) -> Vec<f64> {
    array.data().iter().map(|v| v.as_float().unwrap()).collect()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
    }
}

// ============================================================================
// Pack / unpack
// ============================================================================

#[test]
fn test_pack_blocks_square_tiles() {
    let out = run_ok(pack_module(&[4, 4], &[0, 1], &[2, 2], &[], None), vec![iota(&[4, 4], DType::Int32)]);
    let packed = &out[0];
    assert_eq!(packed.shape(), &[2, 2, 2, 2]);
    // Block (0, 0) holds rows 0..2 and columns 0..2.
    assert_eq!(as_ints(&packed.slice(&[0, 0, 0, 0], &[1, 1, 2, 2]).unwrap()), vec![0, 1, 4, 5]);
    // Block (1, 0) holds rows 2..4 and columns 0..2.
    assert_eq!(as_ints(&packed.slice(&[1, 0, 0, 0], &[1, 1, 2, 2]).unwrap()), vec![8, 9, 12, 13]);
}

#[test]
fn test_pack_pads_partial_tiles_and_permutes_outer_dims() {
    let out = run_ok(pack_module(&[5, 3], &[0], &[2], &[1, 0], Some(-1)), vec![iota(&[5, 3], DType::Int32)]);
    let packed = &out[0];
    // Outer position 0 holds columns, position 1 row blocks.
    assert_eq!(packed.shape(), &[3, 3, 2]);
    assert_eq!(packed.get(&[2, 1, 0]).unwrap(), ConstValue::Int(8));
    assert_eq!(packed.get(&[0, 2, 0]).unwrap(), ConstValue::Int(12));
    assert_eq!(packed.get(&[0, 2, 1]).unwrap(), ConstValue::Int(-1));
}

#[test]
fn test_unpack_restores_packed_layout() {
    let source = iota(&[4, 6], DType::Int32);
    let packed = run_ok(pack_module(&[4, 6], &[1, 0], &[3, 2], &[1, 0], None), vec![source.clone()]);
    assert_eq!(packed[0].shape(), &[2, 2, 3, 2]);

    let unpacked = run_ok(unpack_module(&[2, 2, 3, 2], &[4, 6], &[1, 0], &[3, 2], &[1, 0]), packed);
    assert_eq!(unpacked[0], source);
}

// ============================================================================
// Scatter
// ============================================================================

#[test]
fn test_scatter_overwrites_addressed_elements() {
    let out = run_ok(
        scatter_module(&[2], 1, &[5], &[0], true, false),
        vec![ints(&[2], &[10, 20]), ints(&[2, 1], &[1, 3]), ints(&[5], &[0, 1, 2, 3, 4])],
    );
    assert_eq!(as_ints(&out[0]), vec![0, 10, 2, 20, 4]);
}

#[test]
fn test_scatter_accumulates_duplicate_indices() {
    let out = run_ok(
        scatter_module(&[3], 1, &[4], &[0], false, true),
        vec![ints(&[3], &[1, 2, 4]), ints(&[3, 1], &[2, 0, 2]), ints(&[4], &[100, 100, 100, 100])],
    );
    assert_eq!(as_ints(&out[0]), vec![102, 100, 105, 100]);
}

#[test]
fn test_scatter_writes_row_windows() {
    let out = run_ok(
        scatter_module(&[2, 3], 1, &[3, 3], &[0], true, false),
        vec![ints(&[2, 3], &[1, 2, 3, 4, 5, 6]), ints(&[2, 1], &[2, 0]), NdArray::zeros(&[3, 3], DType::Int32)],
    );
    assert_eq!(as_ints(&out[0]), vec![4, 5, 6, 0, 0, 0, 1, 2, 3]);
}

#[test]
fn test_scatter_negative_index_is_reported() {
    let module = scatter_module(&[1], 1, &[4], &[0], true, false).unwrap();
    let err = run(&module, vec![ints(&[1], &[7]), ints(&[1, 1], &[-2]), NdArray::zeros(&[4], DType::Int32)]);
    assert_eq!(err, Err(Error::NegativeIndex { value: -2 }));
}

// ============================================================================
// Sort, scan, reverse, topk
// ============================================================================

#[test]
fn test_sort_orders_each_row() {
    let out = run_ok(sort_module(&[2, 4], 1), vec![ints(&[2, 4], &[3, 1, 4, 1, 9, -2, 6, 5])]);
    assert_eq!(as_ints(&out[0]), vec![1, 1, 3, 4, -2, 5, 6, 9]);
}

#[test]
fn test_sort_permutes_values_with_keys() {
    let out = run_ok(sort_pairs_module(&[4], 0), vec![ints(&[4], &[3, 0, 2, 1]), ints(&[4], &[30, 0, 20, 10])]);
    assert_eq!(as_ints(&out[0]), vec![0, 1, 2, 3]);
    assert_eq!(as_ints(&out[1]), vec![0, 10, 20, 30]);
}

#[test]
fn test_inclusive_scan() {
    let out = run_ok(scan_module(&[4], 0, true), vec![ints(&[4], &[1, 2, 3, 4]), ints(&[], &[0])]);
    assert_eq!(as_ints(&out[0]), vec![1, 3, 6, 10]);
    assert_eq!(as_ints(&out[1]), vec![10]);
}

#[test]
fn test_exclusive_scan_starts_from_accumulator() {
    let out = run_ok(scan_module(&[2, 3], 1, false), vec![ints(&[2, 3], &[1, 2, 3, 4, 5, 6]), ints(&[2], &[0, 100])]);
    assert_eq!(as_ints(&out[0]), vec![0, 1, 3, 100, 104, 109]);
    assert_eq!(as_ints(&out[1]), vec![3, 109]);
}

#[test]
fn test_reverse_selected_dims() {
    let input = iota(&[2, 3], DType::Int32);
    let cols = run_ok(reverse_module(&[2, 3], &[1]), vec![input.clone()]);
    assert_eq!(as_ints(&cols[0]), vec![2, 1, 0, 5, 4, 3]);

    let both = run_ok(reverse_module(&[2, 3], &[0, 1]), vec![input]);
    assert_eq!(as_ints(&both[0]), vec![5, 4, 3, 2, 1, 0]);
}

#[test]
fn test_topk_keeps_largest_and_earliest_ties() {
    let mut data = vec![5, 1, 9, 3, 9, 0, 7, 2];
    data.extend(8..16);
    let init_values = filled(&[2, 3], DType::Int32, ConstValue::Int(i32::MIN.into()));
    let init_indices = NdArray::zeros(&[2, 3], DType::Int32);
    let out = run_ok(topk_module(&[2, 8], 3, 1), vec![ints(&[2, 8], &data), init_values, init_indices]);

    assert_eq!(as_ints(&out[0]), vec![9, 9, 7, 15, 14, 13]);
    assert_eq!(as_ints(&out[1]), vec![2, 4, 6, 7, 6, 5]);
}

// ============================================================================
// FFT
// ============================================================================

#[test]
fn test_fft_single_butterfly() {
    let out = run_ok(fft_module(&[2], 1), vec![floats(&[2], &[1.0, 2.0]), floats(&[2], &[0.0, 0.0])]);
    assert_close(&as_floats(&out[0]), &[3.0, -1.0]);
    assert_close(&as_floats(&out[1]), &[0.0, 0.0]);
}

#[test]
fn test_fft_stages_compose_into_dft() {
    let ty = tensor(&[4], DType::Float32);
    let module = single_func(&[ty.clone(), ty.clone()], &[ty.clone(), ty], |b, args| {
        let (mut re, mut im) = (args[0], args[1]);
        for stage in 1..=2 {
            let s = b.const_index(stage)?;
            let op = b.fft(s, None, re, im)?;
            (re, im) = (b.module().result(op, 0), b.module().result(op, 1));
        }
        Ok(vec![re, im])
    });
    // Bit-reversed [1, 2, 3, 4].
    let out = run_ok(module, vec![floats(&[4], &[1.0, 3.0, 2.0, 4.0]), floats(&[4], &[0.0; 4])]);
    assert_close(&as_floats(&out[0]), &[10.0, -2.0, -2.0, -2.0]);
    assert_close(&as_floats(&out[1]), &[0.0, 2.0, 0.0, -2.0]);
}

// ============================================================================
// Buffers
// ============================================================================

#[test]
fn test_buffer_semantics_write_through_views() {
    let ty = Type::MemRef(MemRefType::identity(static_shape(&[2, 3]), DType::Int32));
    let module = single_func(&[ty.clone(), ty], &[], |b, args| {
        b.reverse(args[0], args[1], &[0])?;
        Ok(vec![])
    })
    .unwrap();

    let input = MemRefView::from_array(&iota(&[2, 3], DType::Int32));
    let output = MemRefView::alloc(&[2, 3], DType::Int32, MemorySpace::Global);
    let results = Interpreter::new(&module)
        .call(ENTRY, vec![input.into(), output.clone().into()])
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(as_ints(&output.to_array().unwrap()), vec![3, 4, 5, 0, 1, 2]);
}

#[test]
fn test_insert_copies_and_to_buffer_views_tensor() {
    let ty = i32_tensor(&[2, 2]);
    let module = single_func(&[ty.clone()], &[ty.clone(), ty.clone(), Type::Scalar(DType::Int32)], |b, args| {
        let value = b.constant(ConstValue::Int(42), DType::Int32)?;
        let (i, j) = (b.const_index(1)?, b.const_index(0)?);
        let inserted = b.create1(Op::Insert, [value, args[0], i, j], ty.clone())?;
        let memref = Type::MemRef(MemRefType::identity(static_shape(&[2, 2]), DType::Int32));
        let buffer = b.create1(Op::ToBuffer, [inserted], memref)?;
        let loaded = b.load(buffer, &[i, j])?;
        Ok(vec![args[0], inserted, loaded])
    })
    .unwrap();
    verify_module(&module).unwrap();

    let results = Interpreter::new(&module).call(ENTRY, vec![RuntimeValue::tensor(iota(&[2, 2], DType::Int32))]).unwrap();
    let arrays: Vec<NdArray> = results.iter().filter_map(RuntimeValue::to_array).map(Result::unwrap).collect();
    // The argument tensor is left as it was.
    assert_eq!(as_ints(&arrays[0]), vec![0, 1, 2, 3]);
    assert_eq!(as_ints(&arrays[1]), vec![0, 1, 42, 3]);
    assert_eq!(results[2].as_scalar(), Some(ConstValue::Int(42)));
}

#[test]
fn test_subview_aliases_parent() {
    let parent = MemRefView::from_array(&iota(&[4, 4], DType::Int32));
    let tile = parent.subview(&[1, 2], &[2, 2]).unwrap();
    assert!(tile.aliases(&parent));
    assert_eq!(tile.load(&[0, 0]).unwrap(), ConstValue::Int(6));

    tile.store(&[1, 1], ConstValue::Int(-1)).unwrap();
    assert_eq!(parent.load(&[2, 3]).unwrap(), ConstValue::Int(-1));
    assert!(matches!(tile.load(&[2, 0]), Err(Error::OutOfBounds { .. })));
}

fn alloc_then<F>(after_free: F) -> Module
where
    F: FnOnce(&mut Builder, ValueId) -> crate::error::Result<()>,
{
    single_func(&[], &[], |b, _| {
        let ty = MemRefType::identity(static_shape(&[4]), DType::Float32);
        let m = b.alloc(ty, &[], None)?;
        b.create(Op::Dealloc, [m], [])?;
        after_free(b, m)?;
        Ok(vec![])
    })
    .unwrap()
}

#[test]
fn test_load_after_dealloc() {
    let module = alloc_then(|b, m| {
        let i = b.const_index(0)?;
        b.load(m, &[i]).map(|_| ())
    });
    assert_eq!(Interpreter::new(&module).call(ENTRY, vec![]).unwrap_err(), Error::UseAfterFree);
}

#[test]
fn test_double_dealloc() {
    let module = alloc_then(|b, m| b.create(Op::Dealloc, [m], []).map(|_| ()));
    assert_eq!(Interpreter::new(&module).call(ENTRY, vec![]).unwrap_err(), Error::DoubleFree);
}

#[test]
fn test_byte_buffer_fill_and_load() {
    let module = single_func(&[], &[Type::Scalar(DType::Int32), Type::i1()], |b, _| {
        let size = b.const_index(16)?;
        let buf = b.create1(Op::BufferAlloc, [size], Type::ByteBuffer)?;
        let pattern = b.constant(ConstValue::Int(0x0102_0304), DType::Int32)?;
        let (four, eight) = (b.const_index(4)?, b.const_index(8)?);
        b.create(Op::BufferFill, [pattern, buf, size, four, eight], [])?;
        let loaded = b.create1(Op::BufferLoad, [buf, size, eight], Type::Scalar(DType::Int32))?;
        let same = b.create1(Op::BufferCompare, [buf, size, four, buf, size, eight, four], Type::i1())?;
        Ok(vec![loaded, same])
    })
    .unwrap();

    let out = Interpreter::new(&module).call(ENTRY, vec![]).unwrap();
    assert_eq!(out[0].as_scalar(), Some(ConstValue::Int(0x0102_0304)));
    assert_eq!(out[1].as_scalar(), Some(ConstValue::Bool(true)));
}

#[test]
fn test_byte_view_bounds() {
    let view = ByteView::alloc(8);
    let span = view.subspan(4, 4).unwrap();
    span.write(0, &[1, 2, 3, 4]).unwrap();
    assert_eq!(view.to_vec(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    assert_eq!(span.read(2, 4), Err(Error::ByteRangeOutOfBounds { offset: 2, length: 4, size: 4 }));
}

// ============================================================================
// Calling convention
// ============================================================================

#[test]
fn test_call_errors() {
    let module = sort_module(&[4], 0).unwrap();
    let mut interp = Interpreter::new(&module);
    assert_eq!(interp.call("missing", vec![]).unwrap_err(), Error::UnknownFunction { name: "missing".into() });
    assert_eq!(
        interp.call(ENTRY, vec![]).unwrap_err(),
        Error::ArgumentCount { name: ENTRY.into(), expected: 1, actual: 0 }
    );
}
