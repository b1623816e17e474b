use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::num::NonZeroU32;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The name of the coordinates pseudo-attribute. Attributes and dimensions
/// must not use this name.
pub const COORDS_NAME: &str = "__coords";

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum ArrayType {
    #[default]
    Dense = 0,
    Sparse = 1,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ArrayTypeError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<ArrayType>())]
    InvalidDiscriminant(u64),
}

impl From<ArrayType> for u8 {
    fn from(value: ArrayType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ArrayType {
    type Error = ArrayTypeError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ArrayType::Dense),
            1 => Ok(ArrayType::Sparse),
            _ => Err(ArrayTypeError::InvalidDiscriminant(value as u64)),
        }
    }
}

/// Ordering of tiles within the domain and of cells within a tile.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[repr(u8)]
pub enum Layout {
    #[default]
    RowMajor = 0,
    ColumnMajor = 1,
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LayoutError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<Layout>())]
    InvalidDiscriminant(u64),
}

impl From<Layout> for u8 {
    fn from(value: Layout) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Layout {
    type Error = LayoutError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Layout::RowMajor),
            1 => Ok(Layout::ColumnMajor),
            _ => Err(LayoutError::InvalidDiscriminant(value as u64)),
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

/// Represents the number of values carried within a single cell of an
/// attribute.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CellValNum {
    /// The number of values per cell is a specific fixed number.
    Fixed(NonZeroU32),
    /// The number of values per cell varies. Cells of such an attribute are
    /// stored as a values file plus a file of per-cell byte offsets.
    Var,
}

impl CellValNum {
    pub fn single() -> Self {
        CellValNum::Fixed(NonZeroU32::new(1).unwrap())
    }

    pub fn is_var_sized(&self) -> bool {
        matches!(self, CellValNum::Var)
    }

    pub fn is_single_valued(&self) -> bool {
        matches!(self, CellValNum::Fixed(nz) if nz.get() == 1)
    }

    /// Return the fixed number of values per cell, if not variable.
    pub fn fixed(&self) -> Option<NonZeroU32> {
        if let CellValNum::Fixed(nz) = self {
            Some(*nz)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CellValNumError {
    #[error("{} cannot be zero", std::any::type_name::<CellValNum>())]
    CannotBeZero,
}

impl Default for CellValNum {
    fn default() -> Self {
        Self::single()
    }
}

impl Display for CellValNum {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        Debug::fmt(self, f)
    }
}

impl TryFrom<u32> for CellValNum {
    type Error = CellValNumError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Err(CellValNumError::CannotBeZero),
            u32::MAX => Ok(CellValNum::Var),
            v => Ok(CellValNum::Fixed(NonZeroU32::new(v).unwrap())),
        }
    }
}

impl From<CellValNum> for u32 {
    fn from(value: CellValNum) -> Self {
        match value {
            CellValNum::Fixed(nz) => nz.get(),
            CellValNum::Var => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_array_type() {
        for a in [ArrayType::Dense, ArrayType::Sparse] {
            assert_eq!(a, ArrayType::try_from(u8::from(a)).unwrap());
        }
        assert!(ArrayType::try_from(2u8).is_err());
    }

    #[test]
    fn wire_layout() {
        for l in [Layout::RowMajor, Layout::ColumnMajor] {
            assert_eq!(l, Layout::try_from(u8::from(l)).unwrap());
        }
        assert!(Layout::try_from(9u8).is_err());
    }

    #[test]
    fn wire_cell_val_num() {
        assert_eq!(
            CellValNum::single(),
            CellValNum::try_from(1u32).unwrap()
        );
        assert_eq!(CellValNum::Var, CellValNum::try_from(u32::MAX).unwrap());
        assert!(CellValNum::try_from(0u32).is_err());
        for v in [1u32, 2, 7, u32::MAX] {
            assert_eq!(v, u32::from(CellValNum::try_from(v).unwrap()));
        }
    }
}
