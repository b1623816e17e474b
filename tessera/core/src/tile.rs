use tessera_common::datatype::{Datatype, PhysicalType};

/// An in-memory, unfiltered tile of one field.
///
/// One struct covers the three tile shapes: fixed-size values, var-sized
/// values (a values buffer plus tile-local cell offsets), and coordinate
/// tiles (fixed-size with `cell_size = coords_size`). Consumers branch on
/// [Tile::is_var] once per tile, never per cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    datatype: Datatype,
    cell_size: u64,
    var: bool,
    data: Vec<u8>,
    offsets: Vec<u64>,
    validity: Option<Vec<u8>>,
    cell_num: u64,
}

impl Tile {
    pub fn fixed(datatype: Datatype, cell_size: u64, nullable: bool) -> Self {
        Tile {
            datatype,
            cell_size,
            var: false,
            data: Vec::new(),
            offsets: Vec::new(),
            validity: nullable.then(Vec::new),
            cell_num: 0,
        }
    }

    pub fn var(datatype: Datatype, nullable: bool) -> Self {
        Tile {
            datatype,
            cell_size: std::mem::size_of::<u64>() as u64,
            var: true,
            data: Vec::new(),
            offsets: Vec::new(),
            validity: nullable.then(Vec::new),
            cell_num: 0,
        }
    }

    /// Rehydrates a fixed-size tile from its unfiltered payload.
    pub fn from_fixed_bytes(
        datatype: Datatype,
        cell_size: u64,
        data: Vec<u8>,
        validity: Option<Vec<u8>>,
    ) -> Self {
        debug_assert!(cell_size > 0 && data.len() as u64 % cell_size == 0);
        let cell_num = data.len() as u64 / cell_size;
        Tile {
            datatype,
            cell_size,
            var: false,
            data,
            offsets: Vec::new(),
            validity,
            cell_num,
        }
    }

    /// Rehydrates a var-sized tile. `file_offsets` are the fragment-wide
    /// unfiltered value offsets stored on disk; they are re-based onto this
    /// tile's values buffer.
    pub fn from_var_bytes(
        datatype: Datatype,
        file_offsets: &[u64],
        data: Vec<u8>,
        validity: Option<Vec<u8>>,
    ) -> Self {
        let base = file_offsets.first().copied().unwrap_or(0);
        let offsets = file_offsets.iter().map(|o| o - base).collect::<Vec<_>>();
        Tile {
            datatype,
            cell_size: std::mem::size_of::<u64>() as u64,
            var: true,
            data,
            offsets,
            validity,
            cell_num: file_offsets.len() as u64,
        }
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn is_var(&self) -> bool {
        self.var
    }

    pub fn is_nullable(&self) -> bool {
        self.validity.is_some()
    }

    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    pub fn cell_size(&self) -> u64 {
        self.cell_size
    }

    pub fn is_empty(&self) -> bool {
        self.cell_num == 0
    }

    /// The values payload: fixed-size cells back to back, or the var values.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Tile-local var offsets, one per cell.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn validity_bytes(&self) -> Option<&[u8]> {
        self.validity.as_deref()
    }

    /// Total bytes this tile holds in memory.
    pub fn size(&self) -> u64 {
        (self.data.len()
            + self.offsets.len() * std::mem::size_of::<u64>()
            + self.validity.as_ref().map(Vec::len).unwrap_or(0)) as u64
    }

    pub fn append(&mut self, value: &[u8], validity: Option<u8>) {
        if self.var {
            self.offsets.push(self.data.len() as u64);
        } else {
            debug_assert_eq!(self.cell_size as usize, value.len());
        }
        self.data.extend_from_slice(value);
        if let Some(v) = &mut self.validity {
            v.push(validity.unwrap_or(1));
        }
        self.cell_num += 1;
    }

    /// The value bytes of one cell.
    pub fn get(&self, pos: u64) -> &[u8] {
        debug_assert!(pos < self.cell_num);
        if self.var {
            let start = self.offsets[pos as usize] as usize;
            let end = self
                .offsets
                .get(pos as usize + 1)
                .map(|o| *o as usize)
                .unwrap_or(self.data.len());
            &self.data[start..end]
        } else {
            let start = (pos * self.cell_size) as usize;
            &self.data[start..start + self.cell_size as usize]
        }
    }

    pub fn validity(&self, pos: u64) -> u8 {
        self.validity
            .as_ref()
            .map(|v| v[pos as usize])
            .unwrap_or(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.cell_num).map(move |pos| self.get(pos))
    }

    /// Decodes the payload as a sequence of `T`, e.g. coordinate tuples.
    pub fn typed_values<T: PhysicalType>(&self) -> Vec<T> {
        self.data
            .chunks_exact(std::mem::size_of::<T>())
            .map(T::read_le)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_append_get() {
        let mut tile = Tile::fixed(Datatype::Int32, 4, false);
        tile.append(&1i32.to_le_bytes(), None);
        tile.append(&2i32.to_le_bytes(), None);
        assert_eq!(2, tile.cell_num());
        assert_eq!(&1i32.to_le_bytes(), tile.get(0));
        assert_eq!(&2i32.to_le_bytes(), tile.get(1));
        assert_eq!(vec![1i32, 2], tile.typed_values::<i32>());
    }

    #[test]
    fn var_append_get() {
        let mut tile = Tile::var(Datatype::Char, false);
        tile.append(b"a", None);
        tile.append(b"", None);
        tile.append(b"ccc", None);
        assert_eq!(3, tile.cell_num());
        assert_eq!(b"a", tile.get(0));
        assert_eq!(b"", tile.get(1));
        assert_eq!(b"ccc", tile.get(2));
        assert_eq!(&[0u64, 1, 1], tile.offsets());
    }

    #[test]
    fn var_rebase_from_file_offsets() {
        let tile = Tile::from_var_bytes(
            Datatype::Char,
            &[100, 102, 105],
            b"xxyyy".to_vec(),
            None,
        );
        assert_eq!(b"xx", tile.get(0));
        assert_eq!(b"yyy", tile.get(1));
        assert_eq!(b"", tile.get(2));
    }

    #[test]
    fn nullable_validity() {
        let mut tile = Tile::fixed(Datatype::Int32, 4, true);
        tile.append(&1i32.to_le_bytes(), Some(1));
        tile.append(&0i32.to_le_bytes(), Some(0));
        assert_eq!(1, tile.validity(0));
        assert_eq!(0, tile.validity(1));
    }
}
