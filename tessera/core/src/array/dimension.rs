use serde::{Deserialize, Serialize};

use tessera_common::array::COORDS_NAME;
use tessera_common::datatype::{CoordType, Datatype, PhysicalType};

use crate::array::schema::SchemaError;

/// The typed domain bounds and optional tile extent of one dimension.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum DimensionConstraints {
    Int8([i8; 2], Option<i8>),
    Int16([i16; 2], Option<i16>),
    Int32([i32; 2], Option<i32>),
    Int64([i64; 2], Option<i64>),
    UInt8([u8; 2], Option<u8>),
    UInt16([u16; 2], Option<u16>),
    UInt32([u32; 2], Option<u32>),
    UInt64([u64; 2], Option<u64>),
    Float32([f32; 2], Option<f32>),
    Float64([f64; 2], Option<f64>),
}

macro_rules! dimension_constraints_go {
    ($expr:expr, $DT:ident, $range:pat, $extent:pat, $then:expr) => {{
        use $crate::array::dimension::DimensionConstraints;
        match $expr {
            #[allow(unused_variables)]
            DimensionConstraints::Int8($range, $extent) => {
                #[allow(dead_code)]
                type $DT = i8;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::Int16($range, $extent) => {
                #[allow(dead_code)]
                type $DT = i16;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::Int32($range, $extent) => {
                #[allow(dead_code)]
                type $DT = i32;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::Int64($range, $extent) => {
                #[allow(dead_code)]
                type $DT = i64;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::UInt8($range, $extent) => {
                #[allow(dead_code)]
                type $DT = u8;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::UInt16($range, $extent) => {
                #[allow(dead_code)]
                type $DT = u16;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::UInt32($range, $extent) => {
                #[allow(dead_code)]
                type $DT = u32;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::UInt64($range, $extent) => {
                #[allow(dead_code)]
                type $DT = u64;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::Float32($range, $extent) => {
                #[allow(dead_code)]
                type $DT = f32;
                $then
            }
            #[allow(unused_variables)]
            DimensionConstraints::Float64($range, $extent) => {
                #[allow(dead_code)]
                type $DT = f64;
                $then
            }
        }
    }};
}

pub(crate) use dimension_constraints_go;

macro_rules! dimension_constraints_impl {
    ($($V:ident : $U:ty),+) => {
        $(
            impl From<[$U; 2]> for DimensionConstraints {
                fn from(value: [$U; 2]) -> DimensionConstraints {
                    DimensionConstraints::$V(value, None)
                }
            }

            impl From<([$U; 2], $U)> for DimensionConstraints {
                fn from(value: ([$U; 2], $U)) -> DimensionConstraints {
                    DimensionConstraints::$V([value.0[0], value.0[1]], Some(value.1))
                }
            }

            impl From<([$U; 2], Option<$U>)> for DimensionConstraints {
                fn from(value: ([$U; 2], Option<$U>)) -> DimensionConstraints {
                    DimensionConstraints::$V([value.0[0], value.0[1]], value.1)
                }
            }
        )+
    }
}

dimension_constraints_impl!(Int8: i8, Int16: i16, Int32: i32, Int64: i64);
dimension_constraints_impl!(UInt8: u8, UInt16: u16, UInt32: u32, UInt64: u64);
dimension_constraints_impl!(Float32: f32, Float64: f64);

impl DimensionConstraints {
    pub fn datatype(&self) -> Datatype {
        match self {
            Self::UInt8(_, _) => Datatype::UInt8,
            Self::UInt16(_, _) => Datatype::UInt16,
            Self::UInt32(_, _) => Datatype::UInt32,
            Self::UInt64(_, _) => Datatype::UInt64,
            Self::Int8(_, _) => Datatype::Int8,
            Self::Int16(_, _) => Datatype::Int16,
            Self::Int32(_, _) => Datatype::Int32,
            Self::Int64(_, _) => Datatype::Int64,
            Self::Float32(_, _) => Datatype::Float32,
            Self::Float64(_, _) => Datatype::Float64,
        }
    }

    pub fn has_tile_extent(&self) -> bool {
        dimension_constraints_go!(self, _DT, _range, extent, extent.is_some())
    }

    /// The `[lo, hi]` bounds as little-endian bytes.
    pub fn domain_bytes(&self) -> Vec<u8> {
        dimension_constraints_go!(self, _DT, range, _extent, {
            let mut out = Vec::new();
            range[0].write_le(&mut out);
            range[1].write_le(&mut out);
            out
        })
    }

    pub fn extent_bytes(&self) -> Option<Vec<u8>> {
        dimension_constraints_go!(self, _DT, _range, extent, {
            extent.as_ref().map(|e| {
                let mut out = Vec::new();
                e.write_le(&mut out);
                out
            })
        })
    }

    /// Decodes constraints from raw domain/extent bytes of `datatype`.
    pub fn from_bytes(
        datatype: Datatype,
        domain: &[u8],
        extent: Option<&[u8]>,
    ) -> Result<Self, SchemaError> {
        fn build<T>(domain: &[u8], extent: Option<&[u8]>) -> ([T; 2], Option<T>)
        where
            T: CoordType,
        {
            let size = std::mem::size_of::<T>();
            (
                [T::read_le(domain), T::read_le(&domain[size..])],
                extent.map(T::read_le),
            )
        }

        tessera_common::coord_type_go!(
            datatype,
            DT,
            {
                let (range, extent) = build::<DT>(domain, extent);
                Ok(DimensionConstraints::from((range, extent)))
            },
            Err(SchemaError::BadDimensionType(datatype))
        )
    }

    /// Cells spanned by one tile along this dimension, if it has an extent.
    pub fn num_cells_per_tile(&self) -> Option<u64> {
        dimension_constraints_go!(self, _DT, _range, extent, {
            extent.as_ref().map(|e| num_traits::cast::<_, u64>(*e).unwrap_or(0))
        })
    }

    fn check(&self, name: &str) -> Result<(), SchemaError> {
        use tessera_common::datatype::physical::BitsOrd;

        dimension_constraints_go!(self, _DT, range, extent, {
            if range[0].bits_gt(&range[1]) {
                return Err(SchemaError::InvertedDomain(name.to_owned()));
            }
            if let Some(extent) = extent {
                if self.datatype().is_real_type() {
                    return Err(SchemaError::RealTileExtent(name.to_owned()));
                }
                if extent.bits_le(&num_traits::zero()) {
                    return Err(SchemaError::NonPositiveTileExtent(name.to_owned()));
                }
            }
        });
        Ok(())
    }
}

/// An axis of the array domain.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Dimension {
    name: String,
    constraints: DimensionConstraints,
}

impl Dimension {
    pub fn new<S, C>(name: S, constraints: C) -> Result<Self, SchemaError>
    where
        S: Into<String>,
        C: Into<DimensionConstraints>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if name == COORDS_NAME {
            return Err(SchemaError::ReservedName(name));
        }
        let constraints = constraints.into();
        constraints.check(&name)?;
        Ok(Dimension { name, constraints })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.constraints.datatype()
    }

    pub fn constraints(&self) -> &DimensionConstraints {
        &self.constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_domain_rejected() {
        assert!(Dimension::new("d", [4i32, 1]).is_err());
        assert!(Dimension::new("d", [1i32, 4]).is_ok());
    }

    #[test]
    fn float_extent_rejected() {
        assert!(Dimension::new("d", ([0.0f64, 10.0], 2.0)).is_err());
        assert!(Dimension::new("d", [0.0f64, 10.0]).is_ok());
    }

    #[test]
    fn nonpositive_extent_rejected() {
        assert!(Dimension::new("d", ([1i32, 4], 0)).is_err());
        assert!(Dimension::new("d", ([1i32, 4], -2)).is_err());
        assert!(Dimension::new("d", ([1i32, 4], 2)).is_ok());
    }

    #[test]
    fn constraint_bytes_roundtrip() {
        let c = DimensionConstraints::from(([1i64, 100], 10i64));
        let back = DimensionConstraints::from_bytes(
            Datatype::Int64,
            &c.domain_bytes(),
            c.extent_bytes().as_deref(),
        )
        .unwrap();
        assert_eq!(c, back);
    }
}
