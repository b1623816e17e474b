use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tessera_common::array::{ArrayType, CellValNum, Layout, COORDS_NAME};
use tessera_common::datatype::Datatype;
use tessera_storage::buffer::{Buffer, ConstBuffer};

use crate::array::attribute::Attribute;
use crate::array::dimension::{Dimension, DimensionConstraints};
use crate::array::domain::Domain;
use crate::filter::{Compressor, FilterPipeline};

/// Current format version, serialized into every fragment.
pub const FORMAT_VERSION: [i32; 3] = [1, 0, 0];

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchemaError {
    #[error("Names must not be empty")]
    EmptyName,
    #[error("'{0}' is a reserved name")]
    ReservedName(String),
    #[error("'{0}' is not a legal field name")]
    InvalidName(String),
    #[error("Duplicate field name '{0}'")]
    DuplicateName(String),
    #[error("An array requires at least one dimension")]
    NoDimensions,
    #[error("An array requires at least one attribute")]
    NoAttributes,
    #[error("All dimensions must share one datatype")]
    HeterogeneousDimensions,
    #[error("Either all dimensions carry a tile extent or none do")]
    PartialTileExtents,
    #[error("Dimension '{0}' has lo > hi")]
    InvertedDomain(String),
    #[error("Dimension '{0}' is real-typed and cannot carry a tile extent")]
    RealTileExtent(String),
    #[error("Dimension '{0}' tile extent must be positive")]
    NonPositiveTileExtent(String),
    #[error("Datatype {0} cannot be a dimension type")]
    BadDimensionType(Datatype),
    #[error("A dense array requires integer dimensions with tile extents")]
    DenseNeedsRegularTiles,
    #[error("Capacity must be positive")]
    ZeroCapacity,
    #[error("Double-delta compression cannot apply to real-typed {0}")]
    DoubleDeltaOnReal(String),
}

/// The schema of an array: its domain, attributes, tile capacity, and the
/// compressors of the coordinate and var-offset files.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ArraySchema {
    uri: String,
    array_type: ArrayType,
    domain: Domain,
    attributes: Vec<Attribute>,
    coords_compressor: Compressor,
    coords_compression_level: i32,
    offsets_compressor: Compressor,
    offsets_compression_level: i32,
    capacity: u64,
    version: [i32; 3],
}

impl ArraySchema {
    pub fn new<S: Into<String>>(
        uri: S,
        array_type: ArrayType,
        domain: Domain,
        attributes: Vec<Attribute>,
        capacity: u64,
    ) -> Result<Self, SchemaError> {
        let schema = ArraySchema {
            uri: uri.into(),
            array_type,
            domain,
            attributes,
            coords_compressor: Compressor::None,
            coords_compression_level: -1,
            offsets_compressor: Compressor::None,
            offsets_compression_level: -1,
            capacity,
            version: FORMAT_VERSION,
        };
        schema.check()?;
        Ok(schema)
    }

    pub fn with_coords_compressor(mut self, c: Compressor, level: i32) -> Result<Self, SchemaError> {
        self.coords_compressor = c;
        self.coords_compression_level = level;
        self.check()?;
        Ok(self)
    }

    pub fn with_offsets_compressor(mut self, c: Compressor, level: i32) -> Result<Self, SchemaError> {
        self.offsets_compressor = c;
        self.offsets_compression_level = level;
        self.check()?;
        Ok(self)
    }

    /// Validates every schema invariant. Called by the fallible constructors
    /// and again when a schema is deserialized from disk.
    pub fn check(&self) -> Result<(), SchemaError> {
        if self.attributes.is_empty() {
            return Err(SchemaError::NoAttributes);
        }
        if self.capacity == 0 {
            return Err(SchemaError::ZeroCapacity);
        }

        let names = || {
            self.attributes
                .iter()
                .map(|a| a.name())
                .chain(self.domain.dimensions().iter().map(|d| d.name()))
        };
        if let Some(name) = names().find(|n| *n == COORDS_NAME) {
            return Err(SchemaError::ReservedName(name.to_owned()));
        }
        if let Some(name) = names().duplicates().next() {
            return Err(SchemaError::DuplicateName(name.to_owned()));
        }

        if self.array_type == ArrayType::Dense
            && !(self.domain.datatype().is_allowed_dimension_type_dense()
                && self.domain.has_tile_extents())
        {
            return Err(SchemaError::DenseNeedsRegularTiles);
        }

        for a in &self.attributes {
            if a.compressor() == Compressor::DoubleDelta && a.datatype().is_real_type() {
                return Err(SchemaError::DoubleDeltaOnReal(a.name().to_owned()));
            }
        }
        if self.coords_compressor == Compressor::DoubleDelta
            && self.domain.datatype().is_real_type()
        {
            return Err(SchemaError::DoubleDeltaOnReal(COORDS_NAME.to_owned()));
        }

        Ok(())
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    pub fn is_dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn version(&self) -> [i32; 3] {
        self.version
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute(&self, id: usize) -> &Attribute {
        &self.attributes[id]
    }

    /// Index of the named attribute, or `attribute_num` for the coordinates
    /// pseudo-attribute.
    pub fn field_id(&self, name: &str) -> Option<usize> {
        if name == COORDS_NAME {
            return Some(self.attribute_num());
        }
        self.attributes.iter().position(|a| a.name() == name)
    }

    pub fn is_coords_field(&self, id: usize) -> bool {
        id == self.attribute_num()
    }

    pub fn var_size(&self, id: usize) -> bool {
        !self.is_coords_field(id) && self.attributes[id].is_var_sized()
    }

    pub fn nullable(&self, id: usize) -> bool {
        !self.is_coords_field(id) && self.attributes[id].is_nullable()
    }

    /// Bytes per cell in the fixed file of field `id` (coordinates included).
    pub fn cell_size(&self, id: usize) -> u64 {
        if self.is_coords_field(id) {
            self.coords_size()
        } else {
            self.attributes[id].cell_size()
        }
    }

    pub fn datatype(&self, id: usize) -> Datatype {
        if self.is_coords_field(id) {
            self.domain.datatype()
        } else {
            self.attributes[id].datatype()
        }
    }

    pub fn field_name(&self, id: usize) -> &str {
        if self.is_coords_field(id) {
            COORDS_NAME
        } else {
            self.attributes[id].name()
        }
    }

    pub fn filter_pipeline(&self, id: usize) -> FilterPipeline {
        if self.is_coords_field(id) {
            FilterPipeline::new(self.coords_compressor, self.coords_compression_level)
        } else {
            self.attributes[id].filter_pipeline()
        }
    }

    pub fn offsets_filter_pipeline(&self) -> FilterPipeline {
        FilterPipeline::new(self.offsets_compressor, self.offsets_compression_level)
    }

    pub fn coords_size(&self) -> u64 {
        self.domain.coords_size()
    }

    /// Cells per space tile; zero when the domain has no tile extents.
    pub fn cell_num_per_tile(&self) -> u64 {
        self.domain
            .dimensions()
            .iter()
            .map(|d| d.constraints().num_cells_per_tile().unwrap_or(0))
            .product()
    }

    pub fn dim_num(&self) -> usize {
        self.domain.dim_num()
    }

    /// Indexes of the var-sized attributes, in attribute order.
    pub fn var_attribute_ids(&self) -> Vec<usize> {
        (0..self.attributes.len())
            .filter(|&i| self.attributes[i].is_var_sized())
            .collect()
    }

    /// Position of attribute `id` among the var-sized attributes.
    pub fn var_attribute_pos(&self, id: usize) -> Option<usize> {
        if self.is_coords_field(id) || !self.attributes[id].is_var_sized() {
            return None;
        }
        Some(
            self.attributes[..id]
                .iter()
                .filter(|a| a.is_var_sized())
                .count(),
        )
    }

    pub fn serialize(&self, buffer: &mut Buffer) {
        buffer.write_u32(self.uri.len() as u32);
        buffer.write_bytes(self.uri.as_bytes());
        buffer.write_u8(self.array_type.into());
        buffer.write_u8(self.domain.tile_order().into());
        buffer.write_u8(self.domain.cell_order().into());
        buffer.write_u64(self.capacity);
        buffer.write_u8(self.coords_compressor.into());
        buffer.write_i32(self.coords_compression_level);
        buffer.write_u8(self.offsets_compressor.into());
        buffer.write_i32(self.offsets_compression_level);

        let coord_type = self.domain.datatype();
        buffer.write_u8(coord_type.into());
        buffer.write_u32(self.domain.dim_num() as u32);
        let type_size = coord_type.size();
        for dim in self.domain.dimensions() {
            buffer.write_u32(dim.name().len() as u32);
            buffer.write_bytes(dim.name().as_bytes());
            buffer.write_bytes(&dim.constraints().domain_bytes());
            match dim.constraints().extent_bytes() {
                Some(extent) => {
                    debug_assert_eq!(type_size, extent.len());
                    buffer.write_u8(1);
                    buffer.write_bytes(&extent);
                }
                None => buffer.write_u8(0),
            }
        }

        buffer.write_u32(self.attributes.len() as u32);
        for attr in &self.attributes {
            buffer.write_u32(attr.name().len() as u32);
            buffer.write_bytes(attr.name().as_bytes());
            buffer.write_u8(attr.datatype().into());
            buffer.write_u32(attr.cell_val_num().into());
            buffer.write_u8(attr.compressor().into());
            buffer.write_i32(attr.compression_level());
            buffer.write_u8(attr.is_nullable() as u8);
        }

        for v in self.version {
            buffer.write_i32(v);
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, crate::Error> {
        let mut buffer = ConstBuffer::new(bytes);

        let uri_size = buffer.read_u32()? as usize;
        let uri = String::from_utf8(buffer.read_bytes(uri_size)?.to_vec())
            .map_err(|e| crate::Error::MetadataCorrupt(e.to_string()))?;
        let array_type = ArrayType::try_from(buffer.read_u8()?)
            .map_err(|e| crate::Error::MetadataCorrupt(e.to_string()))?;
        let tile_order = Layout::try_from(buffer.read_u8()?)?;
        let cell_order = Layout::try_from(buffer.read_u8()?)?;
        let capacity = buffer.read_u64()?;
        let coords_compressor = Compressor::try_from(buffer.read_u8()?)?;
        let coords_compression_level = buffer.read_i32()?;
        let offsets_compressor = Compressor::try_from(buffer.read_u8()?)?;
        let offsets_compression_level = buffer.read_i32()?;

        let coord_type = Datatype::try_from(buffer.read_u8()?)?;
        let type_size = coord_type.size();
        let dim_num = buffer.read_u32()? as usize;
        let mut dimensions = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            let name_size = buffer.read_u32()? as usize;
            let name = String::from_utf8(buffer.read_bytes(name_size)?.to_vec())
                .map_err(|e| crate::Error::MetadataCorrupt(e.to_string()))?;
            let domain = buffer.read_bytes(2 * type_size)?;
            let extent = if buffer.read_u8()? != 0 {
                Some(buffer.read_bytes(type_size)?)
            } else {
                None
            };
            let constraints = DimensionConstraints::from_bytes(coord_type, domain, extent)?;
            dimensions.push(Dimension::new(name, constraints)?);
        }
        let domain = Domain::new(dimensions, tile_order, cell_order)?;

        let attribute_num = buffer.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            let name_size = buffer.read_u32()? as usize;
            let name = String::from_utf8(buffer.read_bytes(name_size)?.to_vec())
                .map_err(|e| crate::Error::MetadataCorrupt(e.to_string()))?;
            let datatype = Datatype::try_from(buffer.read_u8()?)?;
            let cell_val_num = CellValNum::try_from(buffer.read_u32()?)
                .map_err(|e| crate::Error::MetadataCorrupt(e.to_string()))?;
            let compressor = Compressor::try_from(buffer.read_u8()?)?;
            let compression_level = buffer.read_i32()?;
            let nullable = buffer.read_u8()? != 0;

            let mut attr = Attribute::new(name, datatype)?
                .with_cell_val_num(cell_val_num)
                .with_compressor(compressor, compression_level);
            if nullable {
                attr = attr.nullable();
            }
            attributes.push(attr);
        }

        let mut version = [0i32; 3];
        for v in version.iter_mut() {
            *v = buffer.read_i32()?;
        }

        let schema = ArraySchema {
            uri,
            array_type,
            domain,
            attributes,
            coords_compressor,
            coords_compression_level,
            offsets_compressor,
            offsets_compression_level,
            capacity,
            version,
        };
        schema.check()?;
        Ok(schema)
    }
}
