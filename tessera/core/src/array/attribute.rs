use serde::{Deserialize, Serialize};

use tessera_common::array::{CellValNum, COORDS_NAME};
use tessera_common::datatype::Datatype;

use crate::array::schema::SchemaError;
use crate::filter::{Compressor, FilterPipeline};

/// A named, typed column associated with every cell of an array.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: CellValNum,
    compressor: Compressor,
    compression_level: i32,
    nullable: bool,
}

impl Attribute {
    pub fn new<S: Into<String>>(name: S, datatype: Datatype) -> Result<Self, SchemaError> {
        let name = name.into();
        if name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if name == COORDS_NAME {
            return Err(SchemaError::ReservedName(name));
        }
        if name.contains('/') {
            return Err(SchemaError::InvalidName(name));
        }
        Ok(Attribute {
            name,
            datatype,
            cell_val_num: CellValNum::single(),
            compressor: Compressor::None,
            compression_level: -1,
            nullable: false,
        })
    }

    pub fn with_cell_val_num(mut self, cell_val_num: CellValNum) -> Self {
        self.cell_val_num = cell_val_num;
        self
    }

    pub fn var_sized(self) -> Self {
        self.with_cell_val_num(CellValNum::Var)
    }

    pub fn with_compressor(mut self, compressor: Compressor, level: i32) -> Self {
        self.compressor = compressor;
        self.compression_level = level;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn cell_val_num(&self) -> CellValNum {
        self.cell_val_num
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_var_sized(&self) -> bool {
        self.cell_val_num.is_var_sized()
    }

    /// Bytes per cell in the fixed-size file. For a var-sized attribute that
    /// file holds one `u64` offset per cell.
    pub fn cell_size(&self) -> u64 {
        match self.cell_val_num {
            CellValNum::Var => std::mem::size_of::<u64>() as u64,
            CellValNum::Fixed(n) => n.get() as u64 * self.datatype.size() as u64,
        }
    }

    pub fn filter_pipeline(&self) -> FilterPipeline {
        FilterPipeline::new(self.compressor, self.compression_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_and_empty_names() {
        assert!(Attribute::new("", Datatype::Int32).is_err());
        assert!(Attribute::new(COORDS_NAME, Datatype::Int32).is_err());
        assert!(Attribute::new("a/b", Datatype::Int32).is_err());
        assert!(Attribute::new("a", Datatype::Int32).is_ok());
    }

    #[test]
    fn cell_sizes() {
        let a = Attribute::new("a", Datatype::Int32).unwrap();
        assert_eq!(4, a.cell_size());

        let v = Attribute::new("v", Datatype::Char).unwrap().var_sized();
        assert_eq!(8, v.cell_size());
        assert!(v.is_var_sized());

        let pair = Attribute::new("p", Datatype::Float64)
            .unwrap()
            .with_cell_val_num(CellValNum::try_from(2).unwrap());
        assert_eq!(16, pair.cell_size());
    }
}
