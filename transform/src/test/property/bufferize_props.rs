use proptest::prelude::*;
use trellis_ir::prelude::*;
use trellis_ir::test::fixtures::*;
use trellis_ir::test::property::generators::*;

use crate::bufferize::{BufferCallbacks, GpuCallbacks, HeapCallbacks, bufferize};
use crate::config::{BufferizeConfig, TilingConfig};
use crate::test::helpers::*;
use crate::tiling::{lower_all_to_loops, tile_to_loops};

fn bufferized(module: &Module, config: &BufferizeConfig, callbacks: &dyn BufferCallbacks) -> Module {
    let mut buffers = module.clone();
    bufferize(&mut buffers, config, callbacks).unwrap_or_else(|e| panic!("{e}\n{buffers}"));
    assert_verifies(&buffers);
    buffers
}

fn reverse_dims(rank: usize, mask: u8) -> Vec<usize> {
    (0..rank).filter(|d| mask & (1 << d) != 0).collect()
}

/// Bufferize, then replace the single structured op by scalar loops.
fn lowered(module: &Module) -> Module {
    let mut lowered = bufferized(module, &BufferizeConfig::default(), &HeapCallbacks);
    assert_eq!(lower_all_to_loops(&mut lowered).unwrap_or_else(|e| panic!("{e}\n{lowered}")), 1);
    assert!(structured_op(&lowered).is_none(), "{lowered}");
    assert_verifies(&lowered);
    lowered
}

/// Shrink every blocked dim by less than its tile, so tiles no longer divide it.
fn unaligned(config: &PackConfig, trim: u8) -> PackConfig {
    let mut config = config.clone();
    for (d, tile) in config.inner_dims_pos.iter().zip(&config.inner_tiles) {
        config.shape[*d] -= usize::from(trim) % tile;
    }
    config
}

fn arb_f32_array(shape: Vec<usize>) -> impl Strategy<Value = NdArray> {
    let n: usize = shape.iter().product();
    prop::collection::vec(-8i32..8, n).prop_map(move |values| {
        let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
        floats(&shape, &values)
    })
}

fn approx_eq(a: &[NdArray], b: &[NdArray]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.shape() == y.shape()
                && x.data().iter().zip(y.data()).all(|(u, v)| match (u, v) {
                    (ConstValue::Float(u), ConstValue::Float(v)) => (u - v).abs() <= 1e-4 * (1.0 + u.abs()),
                    _ => u == v,
                })
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn bufferized_reverse_matches(input in arb_shaped_i32(1..=3, 5), mask in any::<u8>(), workgroup in any::<bool>()) {
        let module = reverse_module(input.shape(), &reverse_dims(input.shape().len(), mask)).unwrap();
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        let gpu = GpuCallbacks::workgroup();
        let callbacks: &dyn BufferCallbacks = if workgroup { &gpu } else { &HeapCallbacks };
        let buffers = bufferized(&module, &BufferizeConfig::default(), callbacks);
        prop_assert_eq!(run_buffers(&buffers, &[input]), expected);
    }

    #[test]
    fn bufferized_sort_pairs_match(
        (keys, values) in arb_shape(1..=2, 6).prop_flat_map(|s| (arb_i32_array(s.clone()), arb_i32_array(s))),
        writable in any::<bool>(),
    ) {
        let dim = keys.shape().len() - 1;
        let module = sort_pairs_module(keys.shape(), dim).unwrap();
        let args = [keys, values];
        let expected = run_tensors(&module, &args);
        let config = BufferizeConfig::builder().writable_func_args(writable).build();
        let buffers = bufferized(&module, &config, &HeapCallbacks);
        prop_assert_eq!(run_buffers(&buffers, &args), expected);
    }

    #[test]
    fn bufferized_scan_matches(input in arb_shaped_i32(2..=2, 5), dim in 0usize..2, inclusive in any::<bool>()) {
        let module = scan_module(input.shape(), dim, inclusive).unwrap();
        let acc_len = input.shape()[1 - dim];
        let args = [input, i32_fill(&[acc_len], 0)];
        let expected = run_tensors(&module, &args);
        let buffers = bufferized(&module, &BufferizeConfig::default(), &HeapCallbacks);
        prop_assert_eq!(run_buffers(&buffers, &args), expected);
    }

    #[test]
    fn lowered_scatter_matches((updates, indices, original) in arb_unique_scatter(), accumulate in any::<bool>()) {
        let module = scatter_module(&[indices.len()], 1, original.shape(), &[0], true, accumulate).unwrap();
        let args = [updates, i32_column(&indices), original];
        let expected = run_tensors(&module, &args);
        prop_assert_eq!(run_buffers(&lowered(&module), &args), expected);
    }

    #[test]
    fn lowered_sort_matches(input in arb_shaped_i32(1..=2, 6), dim in 0usize..2) {
        let module = sort_module(input.shape(), dim % input.shape().len()).unwrap();
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_buffers(&lowered(&module), &[input]), expected);
    }

    #[test]
    fn lowered_topk_matches(
        (values, k) in (arb_shape(2..=2, 6), 1usize..=6).prop_flat_map(|(shape, k)| {
            let n: usize = shape.iter().product();
            let k = k.min(shape[1]);
            Just((0..n as i32).collect::<Vec<_>>()).prop_shuffle().prop_map(move |v| (ints(&shape, &v), k))
        }),
    ) {
        // Distinct values keep the selected indices independent of tie order.
        let rows = values.shape()[0];
        let module = topk_module(values.shape(), k, 1).unwrap();
        let args = [values, i32_fill(&[rows, k], i32::MIN), i32_fill(&[rows, k], 0)];
        let expected = run_tensors(&module, &args);
        prop_assert_eq!(run_buffers(&lowered(&module), &args), expected);
    }

    #[test]
    fn lowered_fft_matches(
        ((real, imag), stage) in (1usize..=2, 1u32..=3).prop_flat_map(|(rows, log)| {
            let shape = vec![rows, 1 << log];
            ((arb_f32_array(shape.clone()), arb_f32_array(shape)), 1..=log as usize)
        }),
    ) {
        let module = fft_module(real.shape(), stage).unwrap();
        let args = [real, imag];
        let expected = run_tensors(&module, &args);
        let actual = run_buffers(&lowered(&module), &args);
        prop_assert!(approx_eq(&actual, &expected), "{:?} != {:?}", actual, expected);
    }

    #[test]
    fn lowered_scan_matches(input in arb_shaped_i32(2..=2, 5), dim in 0usize..2, inclusive in any::<bool>(), init in -5i32..5) {
        let module = scan_module(input.shape(), dim, inclusive).unwrap();
        let acc_len = input.shape()[1 - dim];
        let args = [input, i32_fill(&[acc_len], init)];
        let expected = run_tensors(&module, &args);
        prop_assert_eq!(run_buffers(&lowered(&module), &args), expected);
    }

    #[test]
    fn lowered_pack_matches(config in arb_pack_config(), trim in any::<u8>()) {
        let config = unaligned(&config, trim);
        let module = pack_module(&config.shape, &config.inner_dims_pos, &config.inner_tiles, &config.outer_dims_perm, Some(-1)).unwrap();
        let input = iota(&config.shape, DType::Int32);
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_buffers(&lowered(&module), &[input]), expected);
    }

    #[test]
    fn lowered_unpack_matches(config in arb_pack_config(), trim in any::<u8>()) {
        let config = unaligned(&config, trim);
        let packed = config.packed_shape();
        let module = unpack_module(&packed, &config.shape, &config.inner_dims_pos, &config.inner_tiles, &config.outer_dims_perm).unwrap();
        let input = iota(&packed, DType::Int32);
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_buffers(&lowered(&module), &[input]), expected);
    }

    #[test]
    fn tiled_bufferized_lowered_reverse_matches(input in arb_shaped_i32(1..=2, 6), mask in any::<u8>(), tile_size in 1usize..4) {
        let rank = input.shape().len();
        let module = reverse_module(input.shape(), &reverse_dims(rank, mask)).unwrap();
        let expected = run_tensors(&module, std::slice::from_ref(&input));

        let mut lowered = module;
        let op = structured_op(&lowered).unwrap();
        let config = TilingConfig::builder().tile_sizes(vec![tile_size; rank]).build();
        tile_to_loops(&mut lowered, op, &config).unwrap();
        let mut lowered = bufferized(&lowered, &BufferizeConfig::default(), &HeapCallbacks);
        prop_assert_eq!(lower_all_to_loops(&mut lowered).unwrap(), 1);
        prop_assert!(structured_op(&lowered).is_none());
        assert_verifies(&lowered);
        prop_assert_eq!(run_buffers(&lowered, &[input]), expected);
    }
}
