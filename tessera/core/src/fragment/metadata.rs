use tessera_common::coord_type_go;
use tessera_common::datatype::PhysicalType;
use tessera_storage::buffer::{Buffer, ConstBuffer};

use crate::array::schema::ArraySchema;
use crate::Error;

/// Decodes a raw coordinate-tuple byte string into typed values.
pub fn coords_from_bytes<T: PhysicalType>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(T::read_le)
        .collect()
}

/// Encodes typed coordinate values into their raw byte string.
pub fn coords_to_bytes<T: PhysicalType>(coords: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(coords.len() * std::mem::size_of::<T>());
    for c in coords {
        c.write_le(&mut out);
    }
    out
}

/// The per-fragment book-keeping: tile offsets per field, MBRs and bounding
/// coordinates of sparse tiles, the non-empty domain, and file sizes.
///
/// Built append-only during a write, then serialized once at finalize.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentMetadata {
    dense: bool,
    /// Interleaved `[lo, hi]` pairs, `2 * coords_size` bytes.
    non_empty_domain: Vec<u8>,
    /// The non-empty domain expanded to whole tiles (dense only); rehydrated
    /// from `non_empty_domain` on load.
    domain: Vec<u8>,
    /// MBR per coordinate tile, interleaved pairs (sparse only).
    mbrs: Vec<Vec<u8>>,
    /// First and last cell coordinates per tile in global order
    /// (sparse only); each entry is `2 * coords_size` bytes.
    bounding_coords: Vec<Vec<u8>>,
    /// Byte offset of each tile in its field file. One row per attribute
    /// plus a final row for the coordinates field.
    tile_offsets: Vec<Vec<u64>>,
    next_tile_offsets: Vec<u64>,
    /// Byte offset of each var tile in the var file, one row per var-sized
    /// attribute.
    tile_var_offsets: Vec<Vec<u64>>,
    next_tile_var_offsets: Vec<u64>,
    /// On-disk byte size of each var tile.
    tile_var_sizes: Vec<Vec<u64>>,
    /// Total bytes written per field file (coordinates last).
    file_sizes: Vec<u64>,
    file_var_sizes: Vec<u64>,
    /// Cells in the final, possibly partial, tile (sparse only).
    last_tile_cell_num: u64,
    version: [i32; 3],
}

impl FragmentMetadata {
    pub fn new(schema: &ArraySchema, dense: bool) -> Self {
        let attribute_num = schema.attribute_num();
        let var_num = schema.var_attribute_ids().len();
        FragmentMetadata {
            dense,
            non_empty_domain: Vec::new(),
            domain: Vec::new(),
            mbrs: Vec::new(),
            bounding_coords: Vec::new(),
            tile_offsets: vec![Vec::new(); attribute_num + 1],
            next_tile_offsets: vec![0; attribute_num + 1],
            tile_var_offsets: vec![Vec::new(); var_num],
            next_tile_var_offsets: vec![0; var_num],
            tile_var_sizes: vec![Vec::new(); var_num],
            file_sizes: vec![0; attribute_num + 1],
            file_var_sizes: vec![0; var_num],
            last_tile_cell_num: 0,
            version: schema.version(),
        }
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn version(&self) -> [i32; 3] {
        self.version
    }

    pub fn non_empty_domain(&self) -> &[u8] {
        &self.non_empty_domain
    }

    /// The fragment's domain: the non-empty domain expanded to whole tiles
    /// for a dense fragment, the non-empty domain itself otherwise.
    pub fn domain(&self) -> &[u8] {
        &self.domain
    }

    pub fn mbrs(&self) -> &[Vec<u8>] {
        &self.mbrs
    }

    pub fn mbr(&self, tile_pos: u64) -> &[u8] {
        &self.mbrs[tile_pos as usize]
    }

    pub fn bounding_coords(&self, tile_pos: u64) -> &[u8] {
        &self.bounding_coords[tile_pos as usize]
    }

    pub fn tile_offsets(&self, field_id: usize) -> &[u64] {
        &self.tile_offsets[field_id]
    }

    pub fn tile_var_offsets(&self, var_pos: usize) -> &[u64] {
        &self.tile_var_offsets[var_pos]
    }

    pub fn tile_var_sizes(&self, var_pos: usize) -> &[u64] {
        &self.tile_var_sizes[var_pos]
    }

    pub fn file_sizes(&self, field_id: usize) -> u64 {
        self.file_sizes[field_id]
    }

    pub fn file_var_sizes(&self, var_pos: usize) -> u64 {
        self.file_var_sizes[var_pos]
    }

    pub fn last_tile_cell_num(&self) -> u64 {
        self.last_tile_cell_num
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_offsets[0].len() as u64
    }

    /// Cells in tile `tile_pos`.
    pub fn cell_num(&self, tile_pos: u64, schema: &ArraySchema) -> u64 {
        if self.dense {
            schema.cell_num_per_tile()
        } else if tile_pos + 1 == self.tile_num() && self.last_tile_cell_num != 0 {
            self.last_tile_cell_num
        } else {
            schema.capacity()
        }
    }

    /// The on-disk byte range of tile `tile_pos` in field `field_id`'s file.
    pub fn tile_byte_range(&self, field_id: usize, tile_pos: u64) -> (u64, u64) {
        let offsets = &self.tile_offsets[field_id];
        let start = offsets[tile_pos as usize];
        let end = offsets
            .get(tile_pos as usize + 1)
            .copied()
            .unwrap_or(self.file_sizes[field_id]);
        (start, end)
    }

    /// The on-disk byte range of var tile `tile_pos` for var attribute
    /// `var_pos`.
    pub fn var_tile_byte_range(&self, var_pos: usize, tile_pos: u64) -> (u64, u64) {
        let start = self.tile_var_offsets[var_pos][tile_pos as usize];
        (start, start + self.tile_var_sizes[var_pos][tile_pos as usize])
    }

    pub fn set_non_empty_domain(&mut self, bytes: Vec<u8>, schema: &ArraySchema) {
        self.domain = if self.dense {
            expand_domain_bytes(schema, &bytes)
        } else {
            bytes.clone()
        };
        self.non_empty_domain = bytes;
    }

    pub fn append_mbr(&mut self, mbr: Vec<u8>) {
        self.mbrs.push(mbr);
    }

    pub fn append_bounding_coords(&mut self, bounding_coords: Vec<u8>) {
        self.bounding_coords.push(bounding_coords);
    }

    /// Records the start offset of a new tile in field `field_id`'s file;
    /// `step` is the on-disk size of that tile.
    pub fn append_tile_offset(&mut self, field_id: usize, step: u64) {
        self.tile_offsets[field_id].push(self.next_tile_offsets[field_id]);
        self.next_tile_offsets[field_id] += step;
        self.file_sizes[field_id] = self.next_tile_offsets[field_id];
    }

    pub fn append_tile_var_offset(&mut self, var_pos: usize, step: u64) {
        self.tile_var_offsets[var_pos].push(self.next_tile_var_offsets[var_pos]);
        self.next_tile_var_offsets[var_pos] += step;
        self.file_var_sizes[var_pos] = self.next_tile_var_offsets[var_pos];
    }

    pub fn append_tile_var_size(&mut self, var_pos: usize, size: u64) {
        self.tile_var_sizes[var_pos].push(size);
    }

    pub fn set_last_tile_cell_num(&mut self, cell_num: u64) {
        self.last_tile_cell_num = cell_num;
    }

    pub fn serialize(&self, buffer: &mut Buffer) {
        buffer.write_bytes(&self.non_empty_domain);

        buffer.write_u64(self.mbrs.len() as u64);
        for mbr in &self.mbrs {
            buffer.write_bytes(mbr);
        }

        buffer.write_u64(self.bounding_coords.len() as u64);
        for bc in &self.bounding_coords {
            buffer.write_bytes(bc);
        }

        for offsets in &self.tile_offsets {
            buffer.write_u64(offsets.len() as u64);
            for o in offsets {
                buffer.write_u64(*o);
            }
        }

        for var_pos in 0..self.tile_var_offsets.len() {
            let offsets = &self.tile_var_offsets[var_pos];
            buffer.write_u64(offsets.len() as u64);
            for o in offsets {
                buffer.write_u64(*o);
            }
            let sizes = &self.tile_var_sizes[var_pos];
            buffer.write_u64(sizes.len() as u64);
            for s in sizes {
                buffer.write_u64(*s);
            }
        }

        for s in &self.file_sizes {
            buffer.write_u64(*s);
        }
        for s in &self.file_var_sizes {
            buffer.write_u64(*s);
        }

        buffer.write_u64(self.last_tile_cell_num);
        for v in self.version {
            buffer.write_i32(v);
        }
    }

    pub fn deserialize(bytes: &[u8], schema: &ArraySchema, dense: bool) -> Result<Self, Error> {
        let mut buffer = ConstBuffer::new(bytes);
        let coords_size = schema.coords_size() as usize;
        let attribute_num = schema.attribute_num();
        let var_num = schema.var_attribute_ids().len();

        let non_empty_domain = buffer.read_bytes(2 * coords_size)?.to_vec();

        let mbrs_count = buffer.read_u64()? as usize;
        let mut mbrs = Vec::with_capacity(mbrs_count);
        for _ in 0..mbrs_count {
            mbrs.push(buffer.read_bytes(2 * coords_size)?.to_vec());
        }

        let bounding_count = buffer.read_u64()? as usize;
        let mut bounding_coords = Vec::with_capacity(bounding_count);
        for _ in 0..bounding_count {
            bounding_coords.push(buffer.read_bytes(2 * coords_size)?.to_vec());
        }

        let mut tile_offsets = Vec::with_capacity(attribute_num + 1);
        for _ in 0..attribute_num + 1 {
            let count = buffer.read_u64()? as usize;
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(buffer.read_u64()?);
            }
            tile_offsets.push(offsets);
        }

        let mut tile_var_offsets = Vec::with_capacity(var_num);
        let mut tile_var_sizes = Vec::with_capacity(var_num);
        for _ in 0..var_num {
            let count = buffer.read_u64()? as usize;
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(buffer.read_u64()?);
            }
            tile_var_offsets.push(offsets);

            let count = buffer.read_u64()? as usize;
            let mut sizes = Vec::with_capacity(count);
            for _ in 0..count {
                sizes.push(buffer.read_u64()?);
            }
            tile_var_sizes.push(sizes);
        }

        let mut file_sizes = vec![0u64; attribute_num + 1];
        for s in file_sizes.iter_mut() {
            *s = buffer.read_u64()?;
        }
        let mut file_var_sizes = vec![0u64; var_num];
        for s in file_var_sizes.iter_mut() {
            *s = buffer.read_u64()?;
        }

        let last_tile_cell_num = buffer.read_u64()?;
        let mut version = [0i32; 3];
        for v in version.iter_mut() {
            *v = buffer.read_i32()?;
        }

        let meta = FragmentMetadata {
            dense,
            domain: if dense {
                expand_domain_bytes(schema, &non_empty_domain)
            } else {
                non_empty_domain.clone()
            },
            non_empty_domain,
            mbrs,
            bounding_coords,
            tile_offsets,
            // the builder's running sums end at the total bytes written,
            // which the file-size sections persist
            next_tile_offsets: file_sizes.clone(),
            next_tile_var_offsets: file_var_sizes.clone(),
            tile_var_offsets,
            tile_var_sizes,
            file_sizes,
            file_var_sizes,
            last_tile_cell_num,
            version,
        };
        meta.check(schema)?;
        Ok(meta)
    }

    /// Cross-section consistency checks applied after deserialization.
    fn check(&self, schema: &ArraySchema) -> Result<(), Error> {
        let corrupt = |msg: String| Err(Error::MetadataCorrupt(msg));

        if self.mbrs.len() != self.bounding_coords.len() {
            return corrupt(format!(
                "{} MBRs but {} bounding coordinates",
                self.mbrs.len(),
                self.bounding_coords.len()
            ));
        }

        let tile_num = self.tile_num() as usize;
        for (field_id, offsets) in self.tile_offsets.iter().enumerate() {
            // the coordinates row is empty in a dense fragment
            if self.dense && schema.is_coords_field(field_id) {
                continue;
            }
            if offsets.len() != tile_num {
                return corrupt(format!(
                    "field {field_id} has {} tile offsets, expected {tile_num}",
                    offsets.len()
                ));
            }
            if offsets.windows(2).any(|w| w[0] >= w[1]) {
                return corrupt(format!(
                    "field {field_id} tile offsets are not strictly increasing"
                ));
            }
        }

        if !self.dense && self.mbrs.len() != tile_num {
            return corrupt(format!(
                "sparse fragment has {} MBRs but {tile_num} tiles",
                self.mbrs.len()
            ));
        }

        for var_pos in 0..self.tile_var_offsets.len() {
            if self.tile_var_offsets[var_pos].len() != self.tile_var_sizes[var_pos].len() {
                return corrupt(format!(
                    "var attribute {var_pos} has mismatched offset/size sections"
                ));
            }
        }

        Ok(())
    }
}

/// Expands a raw interleaved domain to whole tile boundaries.
fn expand_domain_bytes(schema: &ArraySchema, bytes: &[u8]) -> Vec<u8> {
    coord_type_go!(
        schema.domain().datatype(),
        DT,
        {
            let mut domain = coords_from_bytes::<DT>(bytes);
            if let Ok(view) = schema.domain().view::<DT>() {
                view.expand_to_tiles(&mut domain);
            }
            coords_to_bytes(&domain)
        },
        bytes.to_vec()
    )
}
