use proptest::prelude::*;
use trellis_dtype::DType;

use crate::types::ConstValue;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn casts_are_idempotent(dtype in DType::element_generator(), v in any::<i64>()) {
        let once = ConstValue::Int(v).cast(dtype);
        prop_assert_eq!(once.cast(dtype), once);
    }

    #[test]
    fn int_casts_fit_the_target_width(dtype in DType::int_generator(), v in any::<i64>()) {
        let r = ConstValue::Int(v).cast(dtype).as_int().unwrap();
        let bits = dtype.bit_width() as u32;
        if bits < 64 {
            let half = 1i64 << (bits - 1);
            prop_assert!((-half..half).contains(&r), "{} does not fit {}", r, dtype);
            prop_assert_eq!(r.wrapping_sub(v) & (half * 2 - 1), 0);
        } else {
            prop_assert_eq!(r, v);
        }
    }

    #[test]
    fn small_ints_survive_float_round_trip(dtype in DType::float_generator(), v in -(1i64 << 20)..(1i64 << 20)) {
        prop_assert_eq!(ConstValue::Int(v).cast(dtype).cast(DType::Int64), ConstValue::Int(v));
    }
}
