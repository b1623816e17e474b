pub mod physical;

pub use physical::{CoordType, PhysicalType};

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Physical type mismatch: expected {actual_type}, found {requested_type}")]
    PhysicalTypeMismatch {
        requested_type: &'static str,
        actual_type: &'static str,
    },
    #[error("Physical type '{physical_type}' is not compatible with datatype '{datatype}'")]
    PhysicalTypeIncompatible {
        physical_type: &'static str,
        datatype: Datatype,
    },
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<Datatype>())]
    InvalidDiscriminant(u64),
}

impl Error {
    pub fn physical_type_incompatible<T>(datatype: Datatype) -> Self {
        Self::PhysicalTypeIncompatible {
            physical_type: std::any::type_name::<T>(),
            datatype,
        }
    }
}

/// The type of a single value stored in an attribute or dimension.
///
/// The discriminants are the on-disk tags used by the array and fragment
/// metadata serialization, so they must not be reordered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum Datatype {
    /// A 32-bit signed integer
    Int32 = 0,
    /// A 64-bit signed integer
    Int64 = 1,
    /// A 32-bit floating point value
    Float32 = 2,
    /// A 64-bit floating point value
    Float64 = 3,
    /// An 8-bit character value
    Char = 4,
    /// An 8-bit signed integer
    Int8 = 5,
    /// An 8-bit unsigned integer
    UInt8 = 6,
    /// A 16-bit signed integer
    Int16 = 7,
    /// A 16-bit unsigned integer
    UInt16 = 8,
    /// A 32-bit unsigned integer
    UInt32 = 9,
    /// A 64-bit unsigned integer
    UInt64 = 10,
}

const DATATYPES: [Datatype; 11] = [
    Datatype::Int32,
    Datatype::Int64,
    Datatype::Float32,
    Datatype::Float64,
    Datatype::Char,
    Datatype::Int8,
    Datatype::UInt8,
    Datatype::Int16,
    Datatype::UInt16,
    Datatype::UInt32,
    Datatype::UInt64,
];

impl Datatype {
    /// Returns the number of bytes occupied by a single value of this type.
    pub fn size(&self) -> usize {
        crate::physical_type_go!(self, DT, std::mem::size_of::<DT>())
    }

    pub fn is_compatible_type<T: 'static>(&self) -> bool {
        use std::any::TypeId;

        let tid = TypeId::of::<T>();
        if tid == TypeId::of::<f32>() {
            matches!(*self, Datatype::Float32)
        } else if tid == TypeId::of::<f64>() {
            matches!(*self, Datatype::Float64)
        } else if tid == TypeId::of::<i8>() {
            matches!(*self, Datatype::Char | Datatype::Int8)
        } else if tid == TypeId::of::<u8>() {
            matches!(*self, Datatype::UInt8)
        } else if tid == TypeId::of::<i16>() {
            matches!(*self, Datatype::Int16)
        } else if tid == TypeId::of::<u16>() {
            matches!(*self, Datatype::UInt16)
        } else if tid == TypeId::of::<i32>() {
            matches!(*self, Datatype::Int32)
        } else if tid == TypeId::of::<u32>() {
            matches!(*self, Datatype::UInt32)
        } else if tid == TypeId::of::<i64>() {
            matches!(*self, Datatype::Int64)
        } else if tid == TypeId::of::<u64>() {
            matches!(*self, Datatype::UInt64)
        } else {
            false
        }
    }

    /// Returns whether this type is an integral type (i.e. integer)
    pub fn is_integral_type(&self) -> bool {
        matches!(
            *self,
            Datatype::Int8
                | Datatype::Int16
                | Datatype::Int32
                | Datatype::Int64
                | Datatype::UInt8
                | Datatype::UInt16
                | Datatype::UInt32
                | Datatype::UInt64
        )
    }

    /// Returns whether this type is a real number (i.e. floating point)
    pub fn is_real_type(&self) -> bool {
        matches!(*self, Datatype::Float32 | Datatype::Float64)
    }

    /// Returns whether this type can be used as a dimension type of a sparse
    /// array.
    pub fn is_allowed_dimension_type_sparse(&self) -> bool {
        self.is_integral_type() || self.is_real_type()
    }

    /// Returns whether this type can be used as a dimension type of a dense
    /// array. Dense tiling requires discrete coordinates.
    pub fn is_allowed_dimension_type_dense(&self) -> bool {
        self.is_integral_type()
    }

    /// Returns an `Iterator` which yields each variant of `Datatype`
    /// exactly once in tag order.
    pub fn iter() -> impl Iterator<Item = Datatype> {
        DATATYPES.iter().copied()
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl FromStr for Datatype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase();
        match s.as_ref() {
            "int8" => Ok(Datatype::Int8),
            "int16" => Ok(Datatype::Int16),
            "int32" => Ok(Datatype::Int32),
            "int64" => Ok(Datatype::Int64),
            "float32" => Ok(Datatype::Float32),
            "float64" => Ok(Datatype::Float64),
            "char" => Ok(Datatype::Char),
            "uint8" => Ok(Datatype::UInt8),
            "uint16" => Ok(Datatype::UInt16),
            "uint32" => Ok(Datatype::UInt32),
            "uint64" => Ok(Datatype::UInt64),
            _ => Err(s),
        }
    }
}

impl From<Datatype> for u8 {
    fn from(value: Datatype) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Datatype {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Datatype::Int32,
            1 => Datatype::Int64,
            2 => Datatype::Float32,
            3 => Datatype::Float64,
            4 => Datatype::Char,
            5 => Datatype::Int8,
            6 => Datatype::UInt8,
            7 => Datatype::Int16,
            8 => Datatype::UInt16,
            9 => Datatype::UInt32,
            10 => Datatype::UInt64,
            _ => return Err(Error::InvalidDiscriminant(value as u64)),
        })
    }
}

/// Apply a generic expression `$then` with a static type binding in the
/// identifier `$typename` for the physical type corresponding to the dynamic
/// `$datatype`.
///
/// # Examples
///
/// ```
/// use tessera_common::physical_type_go;
/// use tessera_common::datatype::Datatype;
///
/// fn physical_type_to_str(datatype: Datatype) -> String {
///     physical_type_go!(datatype, DT, std::any::type_name::<DT>().to_owned())
/// }
///
/// assert_eq!("u8", physical_type_to_str(Datatype::UInt8));
/// assert_eq!("i8", physical_type_to_str(Datatype::Char));
/// assert_eq!("u64", physical_type_to_str(Datatype::UInt64));
/// ```
#[macro_export]
macro_rules! physical_type_go {
    ($datatype:expr, $typename:ident, $then:expr) => {{
        type Datatype = $crate::datatype::Datatype;
        match $datatype {
            Datatype::Int8 => {
                type $typename = i8;
                $then
            }
            Datatype::Int16 => {
                type $typename = i16;
                $then
            }
            Datatype::Int32 => {
                type $typename = i32;
                $then
            }
            Datatype::Int64 => {
                type $typename = i64;
                $then
            }
            Datatype::UInt8 => {
                type $typename = u8;
                $then
            }
            Datatype::UInt16 => {
                type $typename = u16;
                $then
            }
            Datatype::UInt32 => {
                type $typename = u32;
                $then
            }
            Datatype::UInt64 => {
                type $typename = u64;
                $then
            }
            Datatype::Float32 => {
                type $typename = f32;
                $then
            }
            Datatype::Float64 => {
                type $typename = f64;
                $then
            }
            Datatype::Char => {
                type $typename = i8;
                $then
            }
        }
    }};
}

/// Apply a generic expression `$then` with a static type binding for a
/// coordinate type. This is the dispatch boundary of the read and write
/// entry points; `Char` is not a coordinate type and takes the `$notcoord`
/// arm.
#[macro_export]
macro_rules! coord_type_go {
    ($datatype:expr, $typename:ident, $then:expr, $notcoord:expr) => {{
        type Datatype = $crate::datatype::Datatype;
        match $datatype {
            Datatype::Int8 => {
                type $typename = i8;
                $then
            }
            Datatype::Int16 => {
                type $typename = i16;
                $then
            }
            Datatype::Int32 => {
                type $typename = i32;
                $then
            }
            Datatype::Int64 => {
                type $typename = i64;
                $then
            }
            Datatype::UInt8 => {
                type $typename = u8;
                $then
            }
            Datatype::UInt16 => {
                type $typename = u16;
                $then
            }
            Datatype::UInt32 => {
                type $typename = u32;
                $then
            }
            Datatype::UInt64 => {
                type $typename = u64;
                $then
            }
            Datatype::Float32 => {
                type $typename = f32;
                $then
            }
            Datatype::Float64 => {
                type $typename = f64;
                $then
            }
            Datatype::Char => $notcoord,
        }
    }};
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for Datatype {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            proptest::sample::select(DATATYPES.to_vec()).boxed()
        }
    }

    #[test]
    fn datatype_roundtrips() {
        for i in 0..=u8::MAX {
            if let Ok(dt) = Datatype::try_from(i) {
                assert_eq!(i, u8::from(dt));
            } else {
                assert!(i as usize >= DATATYPES.len());
            }
        }
    }

    #[test]
    fn iter() {
        let mut yielded = HashSet::<Datatype>::new();
        for dt in Datatype::iter() {
            let prev = yielded.insert(dt);
            assert!(prev);
        }
        assert_eq!(DATATYPES.len(), yielded.len());
    }

    #[test]
    fn from_str() {
        for datatype in Datatype::iter() {
            let s_in = datatype.to_string();
            let s_out = Datatype::from_str(&s_in);

            assert_eq!(Ok(datatype), s_out);
        }
    }

    fn check_valid(dt: &Datatype) -> bool {
        let mut count = 0;
        macro_rules! check {
            ($($T:ty),+) => {
                $(
                    if dt.is_compatible_type::<$T>() {
                        count += 1;
                    }
                )+
            }
        }
        check!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);
        count == 1
    }

    proptest! {
        #[test]
        fn physical_type(dt in any::<Datatype>()) {
            physical_type_go!(dt, DT, {
                assert_eq!(dt.size(), std::mem::size_of::<DT>());
                assert!(dt.is_compatible_type::<DT>());
            });
            assert!(check_valid(&dt));
        }

        #[test]
        fn size_via_bytes(dt in any::<Datatype>()) {
            physical_type_go!(dt, DT, {
                let v = <DT as Default>::default();
                let mut bytes = Vec::new();
                crate::datatype::PhysicalType::write_le(&v, &mut bytes);
                assert_eq!(bytes.len(), dt.size());
            })
        }
    }
}
