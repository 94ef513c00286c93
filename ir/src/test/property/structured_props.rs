use proptest::prelude::*;
use trellis_dtype::DType;

use super::generators::*;
use crate::interp::NdArray;
use crate::test::fixtures::*;

fn values(array: &NdArray) -> Vec<i64> {
    array.to_ints().into_iter().flatten().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn unpack_inverts_pack(config in arb_pack_config()) {
        let source = iota(&config.shape, DType::Int32);
        let pack = pack_module(&config.shape, &config.inner_dims_pos, &config.inner_tiles, &config.outer_dims_perm, None).unwrap();
        let packed = run(&pack, vec![source.clone()]).unwrap();
        let packed_shape = config.packed_shape();
        prop_assert_eq!(packed[0].shape(), packed_shape.as_slice());

        let unpack = unpack_module(
            &config.packed_shape(),
            &config.shape,
            &config.inner_dims_pos,
            &config.inner_tiles,
            &config.outer_dims_perm,
        ).unwrap();
        let restored = run(&unpack, packed).unwrap();
        prop_assert_eq!(&restored[0], &source);
    }

    #[test]
    fn reverse_is_an_involution(input in arb_shaped_i32(1..=3, 5), mask in any::<u8>()) {
        let rank = input.shape().len();
        let dims: Vec<usize> = (0..rank).filter(|d| mask & (1 << d) != 0).collect();
        let module = reverse_module(input.shape(), &dims).unwrap();
        let once = run(&module, vec![input.clone()]).unwrap();
        let twice = run(&module, once).unwrap();
        prop_assert_eq!(&twice[0], &input);
    }

    #[test]
    fn sort_matches_std_and_is_idempotent(input in arb_shaped_i32(1..=1, 9)) {
        let module = sort_module(input.shape(), 0).unwrap();
        let sorted = run(&module, vec![input.clone()]).unwrap();
        let mut expected = values(&input);
        expected.sort_unstable();
        prop_assert_eq!(values(&sorted[0]), expected);

        let again = run(&module, sorted.clone()).unwrap();
        prop_assert_eq!(&again[0], &sorted[0]);
    }

    #[test]
    fn unique_scatter_ignores_update_order((updates, indices, original) in arb_unique_scatter(), rotate in 0usize..8) {
        let n = indices.len();
        let module = scatter_module(&[n], 1, original.shape(), &[0], true, false).unwrap();
        let forward = run(&module, vec![updates.clone(), i32_column(&indices), original.clone()]).unwrap();

        let shift = rotate % n;
        let mut rotated_indices = indices.clone();
        rotated_indices.rotate_left(shift);
        let mut rotated_updates: Vec<i32> = values(&updates).into_iter().map(|v| v as i32).collect();
        rotated_updates.rotate_left(shift);
        let rotated_updates = NdArray::from_host(&[n], &rotated_updates).unwrap();
        let rotated = run(&module, vec![rotated_updates, i32_column(&rotated_indices), original]).unwrap();

        prop_assert_eq!(&forward[0], &rotated[0]);
    }

    #[test]
    fn inclusive_scan_is_shifted_exclusive_scan(input in arb_shaped_i32(1..=1, 8)) {
        let n = input.shape()[0];
        let acc = i32_fill(&[], 0);
        let inclusive = run(&scan_module(&[n], 0, true).unwrap(), vec![input.clone(), acc.clone()]).unwrap();
        let exclusive = run(&scan_module(&[n], 0, false).unwrap(), vec![input.clone(), acc]).unwrap();

        let (inc, exc) = (values(&inclusive[0]), values(&exclusive[0]));
        prop_assert_eq!(exc[0], 0);
        prop_assert_eq!(&exc[1..], &inc[..n - 1]);
        prop_assert_eq!(*inc.last().unwrap(), values(&input).iter().sum::<i64>());
    }

    #[test]
    fn topk_returns_largest_values(input in arb_shaped_i32(1..=1, 10), k in 1usize..4) {
        let n = input.shape()[0];
        let k = k.min(n);
        let module = topk_module(&[n], k, 0).unwrap();
        let out = run(&module, vec![input.clone(), i32_fill(&[k], i32::MIN), i32_fill(&[k], 0)]).unwrap();

        let mut expected = values(&input);
        expected.sort_unstable_by(|a, b| b.cmp(a));
        expected.truncate(k);
        prop_assert_eq!(values(&out[0]), expected);

        let input_values = values(&input);
        for (v, i) in values(&out[0]).into_iter().zip(values(&out[1])) {
            prop_assert_eq!(input_values[i as usize], v);
        }
    }
}
