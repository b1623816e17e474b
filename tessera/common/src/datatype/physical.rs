use std::cmp::Ordering;
use std::fmt::Debug;

use crate::private::sealed;

/// Equality over raw value bits.
///
/// `PartialEq` on floats makes `NaN` unequal to itself, which breaks generic
/// code that needs every stored value to equal itself (deduplicating merge
/// keys, matching coordinate tuples). `bits_eq` compares the stored bits
/// instead, with one carve-out: zero and negative zero name the same
/// coordinate and compare equal.
pub trait BitsEq {
    fn bits_eq(&self, other: &Self) -> bool;

    fn bits_ne(&self, other: &Self) -> bool {
        !self.bits_eq(other)
    }
}

/// Elementwise; slices of different lengths are unequal.
impl<T> BitsEq for [T]
where
    T: BitsEq,
{
    fn bits_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(l, r)| l.bits_eq(r))
    }
}

/// A total order over raw value bits.
///
/// Floats are only `PartialOrd`, but sorted runs, bounding searches, and the
/// reconciliation queue all need a total order over coordinates. For floats
/// this follows `total_cmp`, except that zero and negative zero compare
/// equal so the order stays consistent with [BitsEq].
pub trait BitsOrd {
    fn bits_cmp(&self, other: &Self) -> Ordering;

    fn bits_lt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Less)
    }

    fn bits_le(&self, other: &Self) -> bool {
        !matches!(self.bits_cmp(other), Ordering::Greater)
    }

    fn bits_ge(&self, other: &Self) -> bool {
        !matches!(self.bits_cmp(other), Ordering::Less)
    }

    fn bits_gt(&self, other: &Self) -> bool {
        matches!(self.bits_cmp(other), Ordering::Greater)
    }
}

/// Lexicographic, with length as the final tiebreak.
impl<T> BitsOrd for [T]
where
    T: BitsOrd,
{
    fn bits_cmp(&self, other: &Self) -> Ordering {
        self.iter()
            .zip(other.iter())
            .map(|(l, r)| l.bits_cmp(r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| self.len().cmp(&other.len()))
    }
}

/// The value types the engine stores.
///
/// A `PhysicalType` has one memory representation on both sides of the tile
/// byte boundary: `write_le`/`read_le` are the only codec, so a value can
/// round-trip through a tile payload, a run file, or a metadata record
/// without a schema in hand.
pub trait PhysicalType:
    BitsEq
    + BitsOrd
    + Copy
    + Debug
    + Default
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + crate::private::Sealed
    + 'static
{
    /// Appends the little-endian encoding of `self` to `out`.
    fn write_le(&self, out: &mut Vec<u8>);

    /// Decodes a value from the first `size_of::<Self>()` bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is too short.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! integral_type_impls {
    ($($T:ty),+) => {
        sealed!($($T),+);

        $(
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }

            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    self.cmp(other)
                }
            }

            impl PhysicalType for $T {
                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes())
                }

                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes[..std::mem::size_of::<Self>()].try_into().unwrap(),
                    )
                }
            }
        )+
    }
}

integral_type_impls!(u8, u16, u32, u64, i8, i16, i32, i64);

sealed!(f32, f64);

macro_rules! float_type_impls {
    ($($T:ty : $zero:expr),+) => {
        $(
            impl BitsEq for $T {
                fn bits_eq(&self, other: &Self) -> bool {
                    // identical bits, or both some form of zero
                    self.to_bits() == other.to_bits()
                        || (*self == $zero && *other == $zero)
                }
            }

            impl BitsOrd for $T {
                fn bits_cmp(&self, other: &Self) -> Ordering {
                    if *self == $zero && *other == $zero {
                        Ordering::Equal
                    } else {
                        self.total_cmp(other)
                    }
                }
            }

            impl PhysicalType for $T {
                fn write_le(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes())
                }

                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(
                        bytes[..std::mem::size_of::<Self>()].try_into().unwrap(),
                    )
                }
            }
        )+
    }
}

float_type_impls!(f32: 0f32, f64: 0f64);

/// The physical types which may carry coordinates.
///
/// Adds the arithmetic needed by tile-ID projection and the odometer
/// increments. `one()` is the coordinate step of the integer odometers; the
/// float impls exist only for sparse irregular tiling, which never steps.
pub trait CoordType:
    PhysicalType
    + num_traits::Num
    + num_traits::NumCast
    + num_traits::Bounded
{
    /// Euclidean division of the distance from `lo`, in units of `extent`.
    /// This is the per-dimension term of the tile-ID dot product.
    fn tile_idx(self, lo: Self, extent: Self) -> u64;
}

macro_rules! coord_type_impls {
    (int: $($T:ty),+) => {
        $(
            impl CoordType for $T {
                fn tile_idx(self, lo: Self, extent: Self) -> u64 {
                    ((self - lo) / extent) as u64
                }
            }
        )+
    };
    (float: $($T:ty),+) => {
        $(
            impl CoordType for $T {
                fn tile_idx(self, lo: Self, extent: Self) -> u64 {
                    ((self - lo) / extent).floor() as u64
                }
            }
        )+
    };
}

coord_type_impls!(int: u8, u16, u32, u64, i8, i16, i32, i64);
coord_type_impls!(float: f32, f64);

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn float_bits_eq() {
        assert!(f64::NAN.bits_eq(&f64::NAN));
        assert!(0f64.bits_eq(&-0f64));
        assert!(1f64.bits_ne(&2f64));
    }

    #[test]
    fn slice_cmp_is_lexicographic() {
        assert_eq!(Ordering::Less, [1i32, 2].bits_cmp(&[1i32, 3]));
        assert_eq!(Ordering::Equal, [1i32, 2].bits_cmp(&[1i32, 2]));
        assert_eq!(Ordering::Greater, [2i32, 0].bits_cmp(&[1i32, 9]));
        assert_eq!(Ordering::Less, [1i32].bits_cmp(&[1i32, 0]));
    }

    #[test]
    fn tile_idx_floors() {
        assert_eq!(0, 1i32.tile_idx(1, 2));
        assert_eq!(1, 3i32.tile_idx(1, 2));
        assert_eq!(2, 5.0f64.tile_idx(0.0, 2.0));
    }

    proptest! {
        #[test]
        fn le_roundtrip_i64(v in any::<i64>()) {
            let mut bytes = Vec::new();
            v.write_le(&mut bytes);
            assert_eq!(v, i64::read_le(&bytes));
        }

        #[test]
        fn le_roundtrip_f64(v in any::<f64>()) {
            let mut bytes = Vec::new();
            v.write_le(&mut bytes);
            let back = f64::read_le(&bytes);
            assert!(v.bits_eq(&back));
        }

        #[test]
        fn bits_cmp_total_i32(a in any::<i32>(), b in any::<i32>()) {
            match a.bits_cmp(&b) {
                Ordering::Less => assert_eq!(Ordering::Greater, b.bits_cmp(&a)),
                Ordering::Greater => assert_eq!(Ordering::Less, b.bits_cmp(&a)),
                Ordering::Equal => assert!(a.bits_eq(&b)),
            }
        }

        #[test]
        fn bits_cmp_total_f64(a in any::<f64>(), b in any::<f64>()) {
            match a.bits_cmp(&b) {
                Ordering::Less => assert_eq!(Ordering::Greater, b.bits_cmp(&a)),
                Ordering::Greater => assert_eq!(Ordering::Less, b.bits_cmp(&a)),
                Ordering::Equal => assert!(a.bits_eq(&b)),
            }
        }
    }
}
