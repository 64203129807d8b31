use std::borrow::Cow;
use std::fmt::Debug;

use byte_slice_cast::{AsMutByteSlice, AsSliceOf, FromByteSlice, ToByteSlice, ToMutByteSlice};
use num_traits::{Num, NumCast};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum Datatype {
    UInt(usize),
    Int(usize),
    Float(usize),
    Custom(usize),
}

impl Datatype {
    pub fn dsize(&self) -> usize {
        use Datatype::*;

        match self {
            UInt(sz) | Int(sz) | Float(sz) | Custom(sz) => *sz,
        }
    }

    /// Fails with `UnsupportedType` unless values of this type can be processed by the kernels.
    pub fn ensure_supported(&self) -> Result<()> {
        use Datatype::*;

        match self {
            Int(1) | Int(2) | Int(4) | Int(8) | Float(4) | Float(8) => Ok(()),
            _ => Err(Error::UnsupportedType(*self)),
        }
    }
}

/// Numeric element stored in a fragment row.
///
/// Sums, products and comparisons are done in the exact accumulator type [`Element::Acc`].
/// Transcendental functions and variances are done in `f64`, narrowing back with `as`-semantics
/// (saturating, NaN becomes zero for integers).
pub trait Element:
    Num
    + NumCast
    + PartialOrd
    + Copy
    + Default
    + Debug
    + FromByteSlice
    + ToByteSlice
    + ToMutByteSlice
    + Send
    + Sync
    + 'static
{
    const DTYPE: Datatype;

    const INTEGER: bool;

    /// `i128` for integers, `f64` for floats.
    type Acc: Num + NumCast + PartialOrd + Copy + Default + Debug + Send + Sync;

    fn widen(self) -> f64;

    fn narrow(v: f64) -> Self;

    fn acc(self) -> Self::Acc;

    /// Back from the accumulator, saturating for integers.
    fn from_acc(a: Self::Acc) -> Self;

    fn count_acc(n: u64) -> Self::Acc;

    fn acc_widen(a: Self::Acc) -> f64;

    /// Decode a single native-endian value from exactly `size_of::<Self>()` bytes.
    fn from_ne_slice(b: &[u8]) -> Result<Self>;

    /// Whether `self` is the registered fill value. A NaN fill matches any NaN.
    #[allow(clippy::eq_op)]
    fn is_fill(self, fill: Option<Self>) -> bool {
        match fill {
            Some(f) => self == f || (f != f && self != self),
            None => false,
        }
    }
}

macro_rules! impl_element {
    ($t: ty, $dtype: expr, $acc: ty, $integer: expr, |$a: ident| $from_acc: expr) => {
        impl Element for $t {
            const DTYPE: Datatype = $dtype;

            const INTEGER: bool = $integer;

            type Acc = $acc;

            #[inline]
            fn widen(self) -> f64 {
                self as f64
            }

            #[inline]
            fn narrow(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn acc(self) -> $acc {
                self as $acc
            }

            #[inline]
            fn from_acc($a: $acc) -> Self {
                $from_acc
            }

            #[inline]
            fn count_acc(n: u64) -> $acc {
                n as $acc
            }

            #[inline]
            fn acc_widen(a: $acc) -> f64 {
                a as f64
            }

            fn from_ne_slice(b: &[u8]) -> Result<Self> {
                let b: [u8; std::mem::size_of::<$t>()] = b.try_into().map_err(|_| {
                    Error::Type(format!(
                        "{} bytes do not make up one {}",
                        b.len(),
                        stringify!($t)
                    ))
                })?;
                Ok(<$t>::from_ne_bytes(b))
            }
        }
    };
}

impl_element!(i8, Datatype::Int(1), i128, true, |a| a.clamp(i8::MIN as i128, i8::MAX as i128) as i8);
impl_element!(i16, Datatype::Int(2), i128, true, |a| a.clamp(i16::MIN as i128, i16::MAX as i128) as i16);
impl_element!(i32, Datatype::Int(4), i128, true, |a| a.clamp(i32::MIN as i128, i32::MAX as i128) as i32);
impl_element!(i64, Datatype::Int(8), i128, true, |a| a.clamp(i64::MIN as i128, i64::MAX as i128) as i64);
impl_element!(f32, Datatype::Float(4), f64, false, |a| a as f32);
impl_element!(f64, Datatype::Float(8), f64, false, |a| a);

/// View `bytes` as a slice of `T`, copying only when the buffer is not aligned for `T`.
pub fn typed<T: Element>(bytes: &[u8]) -> Result<Cow<'_, [T]>> {
    let dsz = std::mem::size_of::<T>();
    if bytes.len() % dsz != 0 {
        return Err(Error::Type(format!(
            "buffer of {} bytes is not a multiple of element size {}",
            bytes.len(),
            dsz
        )));
    }

    match bytes.as_slice_of::<T>() {
        Ok(s) => Ok(Cow::Borrowed(s)),
        Err(_) => {
            let mut v = vec![T::default(); bytes.len() / dsz];
            v.as_mut_byte_slice().copy_from_slice(bytes);
            Ok(Cow::Owned(v))
        }
    }
}

/// Resolve a runtime `Datatype` to one monomorphized expression, binding the element type to
/// the given identifier:
///
/// ```
/// # use fragpop::{dispatch, types::Datatype};
/// let dsize = dispatch!(Datatype::Float(4), T => std::mem::size_of::<T>()).unwrap();
/// assert_eq!(dsize, 4);
/// ```
#[macro_export]
macro_rules! dispatch {
    ($dtype: expr, $t: ident => $body: expr) => {{
        use $crate::types::Datatype as __Dt;
        match $dtype {
            __Dt::Int(1) => {
                type $t = i8;
                Ok($body)
            }
            __Dt::Int(2) => {
                type $t = i16;
                Ok($body)
            }
            __Dt::Int(4) => {
                type $t = i32;
                Ok($body)
            }
            __Dt::Int(8) => {
                type $t = i64;
                Ok($body)
            }
            __Dt::Float(4) => {
                type $t = f32;
                Ok($body)
            }
            __Dt::Float(8) => {
                type $t = f64;
                Ok($body)
            }
            other => Err($crate::error::Error::UnsupportedType(other)),
        }
    }};
}
