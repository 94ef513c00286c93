//! Host scalar types and the element type each one stands for.

use crate::DType;

/// Native scalars that can seed arrays and constants directly.
pub trait HasDType: Copy {
    const DTYPE: DType;
}

macro_rules! host_scalar {
    ($ty:ty, $dtype:ident) => {
        impl HasDType for $ty {
            const DTYPE: DType = DType::$dtype;
        }
    };
}

host_scalar!(bool, Bool);
host_scalar!(i8, Int8);
host_scalar!(i16, Int16);
host_scalar!(i32, Int32);
host_scalar!(i64, Int64);
host_scalar!(f32, Float32);
host_scalar!(f64, Float64);
