use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::{debug, warn};

use tessera_common::datatype::physical::{BitsEq, BitsOrd};
use tessera_common::datatype::CoordType;
use tessera_storage::buffer::Buffer;
use tessera_storage::{BufferCache, Storage, Uri};

use crate::array::domain::DomainView;
use crate::array::schema::ArraySchema;
use crate::config::Config;
use crate::error::WriteError;
use crate::fragment::metadata::{coords_from_bytes, coords_to_bytes, FragmentMetadata};
use crate::fragment::{attribute_file, validity_file, var_file, COMMIT_FILE, FRAGMENT_METADATA_FILE, RUNS_DIR};
use crate::query::WriteBuffers;
use crate::tile::Tile;
use crate::{Error, Result};

/// What the global order requires of each run element.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RunMode {
    /// Coordinate comparison alone defines the global order
    /// (sparse fragments without space tiles).
    Cell,
    /// A tile ID is compared before the coordinates
    /// (sparse fragments over a regular tile grid).
    CellWithId,
    /// Tile ID, then in-tile cell ID, then coordinates
    /// (dense fragments).
    CellWith2Ids,
}

impl RunMode {
    fn id_bytes(&self) -> usize {
        match self {
            RunMode::Cell => 0,
            RunMode::CellWithId => 8,
            RunMode::CellWith2Ids => 16,
        }
    }
}

/// One cell staged in a run: its decoded coordinates, the packed payload
/// (coordinates followed by attribute values), and the precomputed ids.
#[derive(Clone, Debug)]
struct CellRecord<T> {
    coords: Box<[T]>,
    payload: Box<[u8]>,
    tile_id: u64,
    cell_id: u64,
}

/// The merge ordering of one record: global order first, then a recency
/// rank which decides ties between runs.
struct SortKey<T> {
    tile_id: u64,
    cell_id: u64,
    /// Coordinates permuted into comparison order (reversed for
    /// column-major cell order) so plain lexicographic compare applies.
    coords: Box<[T]>,
    rank: (u64, u64),
}

impl<T: CoordType> SortKey<T> {
    fn same_cell(&self, other: &Self) -> bool {
        self.tile_id == other.tile_id
            && self.cell_id == other.cell_id
            && self.coords.bits_eq(&other.coords)
    }
}

impl<T: CoordType> Ord for SortKey<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tile_id
            .cmp(&other.tile_id)
            .then_with(|| self.cell_id.cmp(&other.cell_id))
            .then_with(|| self.coords.bits_cmp(&other.coords))
            .then_with(|| self.rank.cmp(&other.rank))
    }
}

impl<T: CoordType> PartialOrd for SortKey<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: CoordType> PartialEq for SortKey<T> {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.cmp(other), Ordering::Equal)
    }
}

impl<T: CoordType> Eq for SortKey<T> {}

struct HeapEntry<T> {
    key: SortKey<T>,
    rec: CellRecord<T>,
    src: usize,
}

impl<T: CoordType> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl<T: CoordType> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: CoordType> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.cmp(other), Ordering::Equal)
    }
}

impl<T: CoordType> Eq for HeapEntry<T> {}

/// Object-safe face of the typed write pipeline, selected once per write at
/// the coordinate-type dispatch boundary.
pub trait WriteDriver: Send {
    fn write(&mut self, buffers: &WriteBuffers) -> Result<()>;
    fn finalize(&mut self) -> Result<FragmentMetadata>;
    /// Drops all fragment state on disk. Called instead of `finalize`.
    fn abort(&mut self);
}

/// External-sort write pipeline of a single fragment.
pub struct WriteState<T: CoordType> {
    storage: Arc<dyn Storage>,
    cache: Arc<BufferCache>,
    schema: Arc<ArraySchema>,
    config: Config,
    fragment_uri: Uri,
    dense: bool,
    view: DomainView<T>,
    mode: RunMode,
    run: Vec<CellRecord<T>>,
    run_size: u64,
    runs_num: u64,
    /// Interleaved running `[lo, hi]` of all written coordinates.
    non_empty: Vec<T>,
    cells_written: u64,
    finalized: bool,
}

impl<T: CoordType> WriteState<T> {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<BufferCache>,
        schema: Arc<ArraySchema>,
        config: Config,
        fragment_uri: Uri,
    ) -> Result<Self> {
        let dense = schema.is_dense();
        let view = schema.domain().view::<T>()?;
        let mode = if !view.has_tile_extents() {
            RunMode::Cell
        } else if dense {
            RunMode::CellWith2Ids
        } else {
            RunMode::CellWithId
        };

        storage.create_dir(&fragment_uri)?;
        storage.create_dir(&fragment_uri.join(RUNS_DIR))?;
        debug!("opened fragment {fragment_uri} for writing");

        Ok(WriteState {
            storage,
            cache,
            schema,
            config,
            fragment_uri,
            dense,
            view,
            mode,
            run: Vec::new(),
            run_size: 0,
            runs_num: 0,
            non_empty: Vec::new(),
            cells_written: 0,
            finalized: false,
        })
    }

    fn pack_cell(&self, buffers: &WriteBuffers, i: usize) -> CellRecord<T> {
        let coords_size = self.schema.coords_size() as usize;
        let coord_bytes = &buffers.coords[i * coords_size..(i + 1) * coords_size];
        let coords: Box<[T]> = coords_from_bytes::<T>(coord_bytes).into();

        let mut payload = Vec::with_capacity(coords_size + 16);
        payload.extend_from_slice(coord_bytes);
        for (id, field) in buffers.fields.iter().enumerate() {
            let attr = self.schema.attribute(id);
            if attr.is_var_sized() {
                let value = field.var_cell(i);
                payload.extend_from_slice(&(value.len() as u64).to_le_bytes());
                payload.extend_from_slice(value);
            } else {
                let cell_size = attr.cell_size() as usize;
                payload.extend_from_slice(&field.data[i * cell_size..(i + 1) * cell_size]);
            }
            if let Some(validity) = field.validity {
                payload.push(validity[i]);
            }
        }

        let (tile_id, cell_id) = match self.mode {
            RunMode::Cell => (0, 0),
            RunMode::CellWithId => (self.view.tile_id(&coords), 0),
            RunMode::CellWith2Ids => (
                self.view.tile_id(&coords),
                self.view.cell_pos_in_tile(&coords),
            ),
        };

        CellRecord {
            coords,
            payload: payload.into(),
            tile_id,
            cell_id,
        }
    }

    fn expand_non_empty(&mut self, coords: &[T]) {
        let dim_num = self.view.dim_num();
        if self.non_empty.is_empty() {
            self.non_empty = (0..2 * dim_num).map(|i| coords[i / 2]).collect();
            return;
        }
        for d in 0..dim_num {
            if coords[d].bits_lt(&self.non_empty[2 * d]) {
                self.non_empty[2 * d] = coords[d];
            }
            if coords[d].bits_gt(&self.non_empty[2 * d + 1]) {
                self.non_empty[2 * d + 1] = coords[d];
            }
        }
    }

    fn global_cmp(&self, a: &CellRecord<T>, b: &CellRecord<T>) -> Ordering {
        match self.mode {
            RunMode::Cell => self.view.cell_order_cmp(&a.coords, &b.coords),
            RunMode::CellWithId => a
                .tile_id
                .cmp(&b.tile_id)
                .then_with(|| self.view.cell_order_cmp(&a.coords, &b.coords)),
            RunMode::CellWith2Ids => a
                .tile_id
                .cmp(&b.tile_id)
                .then_with(|| a.cell_id.cmp(&b.cell_id))
                .then_with(|| self.view.cell_order_cmp(&a.coords, &b.coords)),
        }
    }

    /// Sorts the in-memory run and spills it to the next run file.
    fn spill_run(&mut self) -> Result<()> {
        let mut run = std::mem::take(&mut self.run);
        run.sort_by(|a, b| self.global_cmp(a, b));

        let uri = self.run_uri(self.runs_num);
        let mut bytes = Vec::with_capacity(self.run_size as usize + run.len() * 8);
        for rec in &run {
            bytes.extend_from_slice(&(rec.payload.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&rec.payload);
            match self.mode {
                RunMode::Cell => {}
                RunMode::CellWithId => bytes.extend_from_slice(&rec.tile_id.to_le_bytes()),
                RunMode::CellWith2Ids => {
                    bytes.extend_from_slice(&rec.tile_id.to_le_bytes());
                    bytes.extend_from_slice(&rec.cell_id.to_le_bytes());
                }
            }
        }
        self.storage.write(&uri, &bytes)?;
        debug!(
            "spilled run {} ({} cells, {} bytes)",
            self.runs_num,
            run.len(),
            bytes.len()
        );
        self.runs_num += 1;
        self.run_size = 0;
        Ok(())
    }

    fn run_uri(&self, idx: u64) -> Uri {
        self.fragment_uri.join(RUNS_DIR).join(&format!("r{idx}"))
    }

    fn key_of(&self, rec: &CellRecord<T>, run_idx: u64, seq: u64) -> SortKey<T> {
        let coords: Box<[T]> = match self.view.cell_order() {
            tessera_common::array::Layout::RowMajor => rec.coords.clone(),
            tessera_common::array::Layout::ColumnMajor => {
                rec.coords.iter().rev().copied().collect()
            }
        };
        // Ties between runs: the newest wins for dense fragments (it must
        // pop first so older duplicates can be skipped); sparse fragments
        // keep duplicates in write order.
        let rank = if self.dense {
            (u64::MAX - run_idx, u64::MAX - seq)
        } else {
            (run_idx, seq)
        };
        SortKey {
            tile_id: rec.tile_id,
            cell_id: rec.cell_id,
            coords,
            rank,
        }
    }

    fn finalize_inner(&mut self) -> Result<FragmentMetadata> {
        if self.finalized {
            return Err(WriteError::AlreadyFinalized.into());
        }
        if self.cells_written == 0 {
            return Err(WriteError::EmptyFragment.into());
        }

        // the in-memory run participates in the merge as the newest run
        let mut mem_run = std::mem::take(&mut self.run);
        mem_run.sort_by(|a, b| self.global_cmp(a, b));

        let mut sources: Vec<MergeSource<T>> = (0..self.runs_num)
            .map(|idx| {
                MergeSource::open_spilled(
                    Arc::clone(&self.storage),
                    self.run_uri(idx),
                    self.mode,
                    self.schema.coords_size() as usize,
                    self.config.segment_size,
                )
            })
            .collect::<Result<_>>()?;
        sources.push(MergeSource::memory(mem_run));
        let source_num = sources.len();

        let mut heap: BinaryHeap<std::cmp::Reverse<HeapEntry<T>>> =
            BinaryHeap::with_capacity(source_num);
        let mut seqs = vec![0u64; source_num];
        for (src, source) in sources.iter_mut().enumerate() {
            if let Some(rec) = source.next_record()? {
                let key = self.key_of(&rec, src as u64, seqs[src]);
                seqs[src] += 1;
                heap.push(std::cmp::Reverse(HeapEntry { key, rec, src }));
            }
        }

        let mut builder = TileBuilder::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.cache),
            Arc::clone(&self.schema),
            &self.fragment_uri,
            self.dense,
        );
        let mut last_key: Option<SortKey<T>> = None;
        let mut emitted = 0u64;

        while let Some(std::cmp::Reverse(entry)) = heap.pop() {
            let HeapEntry { key, rec, src } = entry;
            if let Some(next) = sources[src].next_record()? {
                let next_key = self.key_of(&next, src as u64, seqs[src]);
                seqs[src] += 1;
                heap.push(std::cmp::Reverse(HeapEntry {
                    key: next_key,
                    rec: next,
                    src,
                }));
            }

            // A dense cell at already-emitted coordinates was written by an
            // older run; its key sorts after the newer one's.
            if self.dense {
                if let Some(last) = &last_key {
                    if last.same_cell(&key) {
                        continue;
                    }
                }
            }

            builder.append(&rec)?;
            emitted += 1;
            last_key = Some(key);
        }

        let mut meta = builder.finish()?;
        meta.set_non_empty_domain(coords_to_bytes(&self.non_empty), &self.schema);

        if self.dense {
            let mut expanded = self.non_empty.clone();
            self.view.expand_to_tiles(&mut expanded);
            let expected = self.view.subarray_volume(&expanded);
            if emitted != expected {
                return Err(WriteError::IncompleteDenseWrite {
                    written: emitted,
                    expected,
                }
                .into());
            }
        }

        let mut buffer = Buffer::new();
        meta.serialize(&mut buffer);
        self.storage.write(
            &self.fragment_uri.join(FRAGMENT_METADATA_FILE),
            buffer.as_slice(),
        )?;
        self.storage
            .write(&self.fragment_uri.join(COMMIT_FILE), &[])?;
        self.finalized = true;
        debug!(
            "committed fragment {} ({} tiles)",
            self.fragment_uri,
            meta.tile_num()
        );
        Ok(meta)
    }

    fn cleanup_runs(&self) {
        if let Err(e) = self.storage.remove(&self.fragment_uri.join(RUNS_DIR)) {
            warn!("failed to remove run files of {}: {e}", self.fragment_uri);
        }
    }

    fn discard_cache_entries(&self) {
        for id in 0..=self.schema.attribute_num() {
            let name = self.schema.field_name(id);
            self.cache.discard(&attribute_file(&self.fragment_uri, name));
            self.cache.discard(&var_file(&self.fragment_uri, name));
            self.cache.discard(&validity_file(&self.fragment_uri, name));
        }
    }
}

impl<T: CoordType> WriteDriver for WriteState<T> {
    fn write(&mut self, buffers: &WriteBuffers) -> Result<()> {
        if self.finalized {
            return Err(WriteError::AlreadyFinalized.into());
        }
        let cell_num = buffers.cell_num(&self.schema)?;
        let domain = self.view.domain().to_vec();

        for i in 0..cell_num as usize {
            let rec = self.pack_cell(buffers, i);
            if !self.view.cell_in_subarray(&rec.coords, &domain) {
                return Err(WriteError::CoordinatesOutOfDomain {
                    cell: self.cells_written + i as u64,
                }
                .into());
            }
            self.expand_non_empty(&rec.coords);
            self.run_size += rec.payload.len() as u64 + 64;
            self.run.push(rec);

            if self.run_size >= self.config.write_buffer_size {
                self.spill_run()?;
            }
        }
        self.cells_written += cell_num;
        Ok(())
    }

    fn finalize(&mut self) -> Result<FragmentMetadata> {
        let result = self.finalize_inner();
        self.cleanup_runs();
        if result.is_err() {
            self.discard_cache_entries();
            if let Err(e) = self.storage.remove(&self.fragment_uri) {
                warn!("failed to remove aborted fragment {}: {e}", self.fragment_uri);
            }
        }
        result
    }

    fn abort(&mut self) {
        self.cleanup_runs();
        self.discard_cache_entries();
        if let Err(e) = self.storage.remove(&self.fragment_uri) {
            warn!("failed to remove aborted fragment {}: {e}", self.fragment_uri);
        }
        self.finalized = true;
    }
}

/// A merge input: either the final in-memory run or a spilled run file read
/// back through a segment-sized buffer.
enum MergeSource<T> {
    Memory {
        run: std::vec::IntoIter<CellRecord<T>>,
    },
    Spilled(SortedRunReader<T>),
}

impl<T: CoordType> MergeSource<T> {
    fn memory(run: Vec<CellRecord<T>>) -> Self {
        MergeSource::Memory {
            run: run.into_iter(),
        }
    }

    fn open_spilled(
        storage: Arc<dyn Storage>,
        uri: Uri,
        mode: RunMode,
        coords_size: usize,
        segment_size: u64,
    ) -> Result<Self> {
        Ok(MergeSource::Spilled(SortedRunReader::open(
            storage,
            uri,
            mode,
            coords_size,
            segment_size,
        )?))
    }

    fn next_record(&mut self) -> Result<Option<CellRecord<T>>> {
        match self {
            MergeSource::Memory { run } => Ok(run.next()),
            MergeSource::Spilled(reader) => reader.next_record(),
        }
    }
}

/// Segment-buffered reader over one spilled run file.
struct SortedRunReader<T> {
    storage: Arc<dyn Storage>,
    uri: Uri,
    file_size: u64,
    mode: RunMode,
    coords_size: usize,
    segment_size: u64,
    segment: Vec<u8>,
    /// Absolute file offset of `segment[0]`.
    segment_start: u64,
    offset_in_segment: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: CoordType> SortedRunReader<T> {
    fn open(
        storage: Arc<dyn Storage>,
        uri: Uri,
        mode: RunMode,
        coords_size: usize,
        segment_size: u64,
    ) -> Result<Self> {
        let file_size = storage.size(&uri)?;
        Ok(SortedRunReader {
            storage,
            uri,
            file_size,
            mode,
            coords_size,
            segment_size: segment_size.max(64),
            segment: Vec::new(),
            segment_start: 0,
            offset_in_segment: 0,
            _marker: std::marker::PhantomData,
        })
    }

    fn absolute_pos(&self) -> u64 {
        self.segment_start + self.offset_in_segment as u64
    }

    /// Ensures at least `need` bytes of the file, starting at the current
    /// position, sit in the segment buffer.
    fn fill(&mut self, need: usize) -> Result<()> {
        if self.segment.len() - self.offset_in_segment >= need {
            return Ok(());
        }
        let pos = self.absolute_pos();
        let len = (self.segment_size.max(need as u64)).min(self.file_size - pos);
        if (len as usize) < need {
            return Err(Error::MetadataCorrupt(format!(
                "run file {} truncated at offset {pos}",
                self.uri
            )));
        }
        self.segment = self.storage.read(&self.uri, pos, len)?;
        self.segment_start = pos;
        self.offset_in_segment = 0;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<CellRecord<T>>> {
        if self.absolute_pos() >= self.file_size {
            return Ok(None);
        }
        self.fill(8)?;
        let payload_len = u64::from_le_bytes(
            self.segment[self.offset_in_segment..self.offset_in_segment + 8]
                .try_into()
                .unwrap(),
        ) as usize;
        let record_len = 8 + payload_len + self.mode.id_bytes();
        self.fill(record_len)?;

        let start = self.offset_in_segment + 8;
        let payload: Box<[u8]> = self.segment[start..start + payload_len].into();
        let mut ids = [0u64; 2];
        let mut id_at = start + payload_len;
        for id in ids.iter_mut().take(self.mode.id_bytes() / 8) {
            *id = u64::from_le_bytes(self.segment[id_at..id_at + 8].try_into().unwrap());
            id_at += 8;
        }
        self.offset_in_segment += record_len;

        let coords: Box<[T]> = coords_from_bytes::<T>(&payload[..self.coords_size]).into();
        Ok(Some(CellRecord {
            coords,
            payload,
            tile_id: ids[0],
            cell_id: ids[1],
        }))
    }
}

/// Accumulates merged cells into per-field tiles and flushes each full tile
/// through the filter pipeline into the fragment's files.
struct TileBuilder<'a> {
    storage: Arc<dyn Storage>,
    cache: Arc<BufferCache>,
    schema: Arc<ArraySchema>,
    fragment_uri: &'a Uri,
    dense: bool,
    meta: FragmentMetadata,
    tiles: Vec<Tile>,
    coords_tile: Tile,
    /// Cumulative unfiltered var bytes per var attribute; the on-disk cell
    /// offsets continue across tiles.
    var_cum: Vec<u64>,
    first_coords: Vec<u8>,
    last_coords: Vec<u8>,
    mbr: Vec<u8>,
    tile_cell_limit: u64,
    current_cells: u64,
}

impl<'a> TileBuilder<'a> {
    fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<BufferCache>,
        schema: Arc<ArraySchema>,
        fragment_uri: &'a Uri,
        dense: bool,
    ) -> Self {
        let tiles = Self::fresh_tiles(&schema);
        let coords_tile = Tile::fixed(schema.domain().datatype(), schema.coords_size(), false);
        let var_num = schema.var_attribute_ids().len();
        let tile_cell_limit = if dense {
            schema.cell_num_per_tile()
        } else {
            schema.capacity()
        };
        let meta = FragmentMetadata::new(&schema, dense);
        TileBuilder {
            storage,
            cache,
            schema,
            fragment_uri,
            dense,
            meta,
            tiles,
            coords_tile,
            var_cum: vec![0; var_num],
            first_coords: Vec::new(),
            last_coords: Vec::new(),
            mbr: Vec::new(),
            tile_cell_limit,
            current_cells: 0,
        }
    }

    fn fresh_tiles(schema: &ArraySchema) -> Vec<Tile> {
        schema
            .attributes()
            .iter()
            .map(|a| {
                if a.is_var_sized() {
                    Tile::var(a.datatype(), a.is_nullable())
                } else {
                    Tile::fixed(a.datatype(), a.cell_size(), a.is_nullable())
                }
            })
            .collect()
    }

    fn append<T: CoordType>(&mut self, rec: &CellRecord<T>) -> Result<()> {
        let coords_size = self.schema.coords_size() as usize;
        let coord_bytes = &rec.payload[..coords_size];

        let mut at = coords_size;
        for (id, tile) in self.tiles.iter_mut().enumerate() {
            let attr = self.schema.attribute(id);
            let value = if attr.is_var_sized() {
                let len =
                    u64::from_le_bytes(rec.payload[at..at + 8].try_into().unwrap()) as usize;
                at += 8;
                let v = &rec.payload[at..at + len];
                at += len;
                v
            } else {
                let len = attr.cell_size() as usize;
                let v = &rec.payload[at..at + len];
                at += len;
                v
            };
            let validity = attr.is_nullable().then(|| {
                let v = rec.payload[at];
                at += 1;
                v
            });
            tile.append(value, validity);
        }

        if !self.dense {
            self.coords_tile.append(coord_bytes, None);
            if self.current_cells == 0 {
                self.first_coords = coord_bytes.to_vec();
                self.mbr = interleave_mbr::<T>(&rec.coords);
            } else {
                expand_mbr::<T>(&mut self.mbr, &rec.coords);
            }
            self.last_coords = coord_bytes.to_vec();
        }

        self.current_cells += 1;
        if self.current_cells == self.tile_cell_limit {
            self.flush_tile()?;
        }
        Ok(())
    }

    fn flush_tile(&mut self) -> Result<()> {
        let tiles = std::mem::replace(&mut self.tiles, Self::fresh_tiles(&self.schema));
        for (id, tile) in tiles.into_iter().enumerate() {
            let attr = self.schema.attribute(id);
            let pipeline = self.schema.filter_pipeline(id);
            let name = attr.name();

            if attr.is_var_sized() {
                let var_pos = self.schema.var_attribute_pos(id).unwrap();
                // offsets tile: fragment-wide unfiltered value offsets
                let base = self.var_cum[var_pos];
                let mut offsets_bytes = Vec::with_capacity(tile.offsets().len() * 8);
                for o in tile.offsets() {
                    offsets_bytes.extend_from_slice(&(base + o).to_le_bytes());
                }
                let filtered = self
                    .schema
                    .offsets_filter_pipeline()
                    .filter(tessera_common::datatype::Datatype::UInt64, &offsets_bytes)?;
                self.cache.write_to_file(
                    self.storage.as_ref(),
                    &attribute_file(self.fragment_uri, name),
                    &filtered,
                )?;
                self.meta.append_tile_offset(id, filtered.len() as u64);

                let var_filtered = pipeline.filter(attr.datatype(), tile.data())?;
                self.cache.write_to_file(
                    self.storage.as_ref(),
                    &var_file(self.fragment_uri, name),
                    &var_filtered,
                )?;
                self.meta
                    .append_tile_var_offset(var_pos, var_filtered.len() as u64);
                self.meta
                    .append_tile_var_size(var_pos, var_filtered.len() as u64);
                self.var_cum[var_pos] += tile.data().len() as u64;
            } else {
                let filtered = pipeline.filter(attr.datatype(), tile.data())?;
                self.cache.write_to_file(
                    self.storage.as_ref(),
                    &attribute_file(self.fragment_uri, name),
                    &filtered,
                )?;
                self.meta.append_tile_offset(id, filtered.len() as u64);
            }

            if let Some(validity) = tile.validity_bytes() {
                self.cache.write_to_file(
                    self.storage.as_ref(),
                    &validity_file(self.fragment_uri, name),
                    validity,
                )?;
            }
        }

        if !self.dense {
            let coords_tile = std::mem::replace(
                &mut self.coords_tile,
                Tile::fixed(self.schema.domain().datatype(), self.schema.coords_size(), false),
            );
            let pipeline = self.schema.filter_pipeline(self.schema.attribute_num());
            let filtered = pipeline.filter(self.schema.domain().datatype(), coords_tile.data())?;
            self.cache.write_to_file(
                self.storage.as_ref(),
                &attribute_file(self.fragment_uri, tessera_common::array::COORDS_NAME),
                &filtered,
            )?;
            self.meta
                .append_tile_offset(self.schema.attribute_num(), filtered.len() as u64);
            self.meta.append_mbr(std::mem::take(&mut self.mbr));
            let mut bounding = std::mem::take(&mut self.first_coords);
            bounding.extend_from_slice(&std::mem::take(&mut self.last_coords));
            self.meta.append_bounding_coords(bounding);
            self.meta.set_last_tile_cell_num(self.current_cells);
        }

        self.current_cells = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<FragmentMetadata> {
        if self.current_cells > 0 {
            self.flush_tile()?;
        }

        // flush every buffered file
        for id in 0..self.schema.attribute_num() {
            let attr = self.schema.attribute(id);
            let name = attr.name();
            self.cache
                .flush_file(self.storage.as_ref(), &attribute_file(self.fragment_uri, name))?;
            if attr.is_var_sized() {
                self.cache
                    .flush_file(self.storage.as_ref(), &var_file(self.fragment_uri, name))?;
            }
            if attr.is_nullable() {
                self.cache
                    .flush_file(self.storage.as_ref(), &validity_file(self.fragment_uri, name))?;
            }
        }
        if !self.dense {
            self.cache.flush_file(
                self.storage.as_ref(),
                &attribute_file(self.fragment_uri, tessera_common::array::COORDS_NAME),
            )?;
        }

        Ok(self.meta)
    }
}

fn interleave_mbr<T: CoordType>(coords: &[T]) -> Vec<u8> {
    let interleaved: Vec<T> = coords.iter().flat_map(|c| [*c, *c]).collect();
    coords_to_bytes(&interleaved)
}

fn expand_mbr<T: CoordType>(mbr_bytes: &mut Vec<u8>, coords: &[T]) {
    let mut mbr = coords_from_bytes::<T>(mbr_bytes);
    for (d, c) in coords.iter().enumerate() {
        if c.bits_lt(&mbr[2 * d]) {
            mbr[2 * d] = *c;
        }
        if c.bits_gt(&mbr[2 * d + 1]) {
            mbr[2 * d + 1] = *c;
        }
    }
    *mbr_bytes = coords_to_bytes(&mbr);
}

/// Builds the typed write pipeline for the schema's coordinate type.
pub fn new_write_driver(
    storage: Arc<dyn Storage>,
    cache: Arc<BufferCache>,
    schema: Arc<ArraySchema>,
    config: Config,
    fragment_uri: Uri,
) -> Result<Box<dyn WriteDriver>> {
    tessera_common::coord_type_go!(
        schema.domain().datatype(),
        DT,
        {
            let state = WriteState::<DT>::new(storage, cache, schema, config, fragment_uri)?;
            Ok(Box::new(state) as Box<dyn WriteDriver>)
        },
        Err(Error::Schema(
            crate::array::schema::SchemaError::BadDimensionType(schema.domain().datatype()),
        ))
    )
}
