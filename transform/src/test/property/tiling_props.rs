use proptest::prelude::*;
use trellis_ir::prelude::*;
use trellis_ir::test::fixtures::*;
use trellis_ir::test::property::generators::*;

use crate::config::TilingConfig;
use crate::test::helpers::*;
use crate::tiling::{tile, tile_to_loops};

fn tiled(module: &Module, sizes: &[usize]) -> Module {
    let mut tiled = module.clone();
    let op = structured_op(&tiled).unwrap();
    let config = TilingConfig::builder().tile_sizes(sizes.to_vec()).build();
    tile_to_loops(&mut tiled, op, &config).unwrap_or_else(|e| panic!("{e}\n{tiled}"));
    assert_verifies(&tiled);
    tiled
}

/// Replace the fixture's structured op by one tile spanning its whole domain.
fn full_tile(module: &Module) -> Module {
    let mut tiled = module.clone();
    let op = structured_op(&tiled).unwrap();
    let shape = tiled.value_type(tiled.operands(op)[0]).shape().unwrap().to_vec();
    let sizes: Vec<SInt> = shape.iter().map(|d| SInt::Const(d.as_static().unwrap())).collect();
    let offsets = vec![SInt::Const(0); sizes.len()];
    let t = tile(&mut tiled, op, &offsets, &sizes).unwrap();
    tiled.replace_op_results(op, &t.values);
    tiled.erase_op(op);
    assert_verifies(&tiled);
    tiled
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn full_tile_reproduces_op(input in arb_shaped_i32(1..=3, 5), mask in any::<u8>(), sort in any::<bool>()) {
        let rank = input.shape().len();
        let module = if sort {
            sort_module(input.shape(), rank - 1).unwrap()
        } else {
            let dims: Vec<usize> = (0..rank).filter(|d| mask & (1 << d) != 0).collect();
            reverse_module(input.shape(), &dims).unwrap()
        };
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_tensors(&full_tile(&module), &[input]), expected);
    }

    #[test]
    fn reverse_tiles_cover_output(n in 1usize..12, tile_size in 1usize..5, dims_mask in any::<bool>()) {
        let dims: &[usize] = if dims_mask { &[0] } else { &[] };
        let mut module = reverse_module(&[n], dims).unwrap();
        let op = structured_op(&module).unwrap();

        let mut covered = vec![0usize; n];
        for offset in (0..n).step_by(tile_size) {
            let size = tile_size.min(n - offset);
            let t = tile(&mut module, op, &[SInt::Const(offset)], &[SInt::Const(size)]).unwrap();
            let start = t.result_offsets[0][0].as_const().unwrap();
            prop_assert_eq!(t.result_sizes[0][0], SInt::Const(size));
            for hit in &mut covered[start..start + size] {
                *hit += 1;
            }
        }
        prop_assert!(covered.iter().all(|c| *c == 1), "{:?}", covered);
    }

    #[test]
    fn tiled_reverse_matches(input in arb_shaped_i32(1..=3, 6), mask in any::<u8>(), sizes in prop::collection::vec(0usize..4, 3)) {
        let rank = input.shape().len();
        let dims: Vec<usize> = (0..rank).filter(|d| mask & (1 << d) != 0).collect();
        let module = reverse_module(input.shape(), &dims).unwrap();
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_tensors(&tiled(&module, &sizes[..rank]), &[input]), expected);
    }

    #[test]
    fn tiled_sort_rows_match(input in arb_shaped_i32(2..=2, 6), rows in 1usize..4) {
        let module = sort_module(input.shape(), 1).unwrap();
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        prop_assert_eq!(run_tensors(&tiled(&module, &[rows]), &[input]), expected);
    }

    #[test]
    fn tiled_unique_scatter_matches((updates, indices, original) in arb_unique_scatter(), batch in 1usize..4) {
        let module = scatter_module(&[indices.len()], 1, original.shape(), &[0], true, false).unwrap();
        let args = [updates, i32_column(&indices), original];
        let expected = run_tensors(&module, &args);
        prop_assert_eq!(run_tensors(&tiled(&module, &[batch]), &args), expected);
    }

    #[test]
    fn tiled_pack_matches(config in arb_pack_config(), outer in 1usize..3) {
        let module = pack_module(&config.shape, &config.inner_dims_pos, &config.inner_tiles, &config.outer_dims_perm, None).unwrap();
        let input = iota(&config.shape, DType::Int32);
        let expected = run_tensors(&module, std::slice::from_ref(&input));
        let sizes = vec![outer; config.shape.len()];
        prop_assert_eq!(run_tensors(&tiled(&module, &sizes), &[input]), expected);
    }
}
