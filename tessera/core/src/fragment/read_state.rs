use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace, warn};
use rayon::prelude::*;

use tessera_common::datatype::physical::BitsOrd;
use tessera_common::datatype::CoordType;
use tessera_storage::{Storage, Uri};

use crate::array::domain::DomainView;
use crate::array::schema::ArraySchema;
use crate::config::Config;
use crate::error::ReadError;
use crate::fragment::metadata::{coords_from_bytes, FragmentMetadata};
use crate::fragment::{attribute_file, validity_file, var_file};
use crate::tile::Tile;
use crate::{Error, Result};

/// Direction of a segment load relative to the trigger tile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadDirection {
    /// The trigger tile starts the segment; following tiles ride along.
    Forward,
    /// The trigger tile ends the segment; preceding tiles ride along, so
    /// reverse traversal does not degenerate to one seek per tile.
    Backward,
}

/// Per-fragment read cursor and tile window (one fragment of one query).
pub struct ReadState<T: CoordType> {
    fragment_idx: usize,
    uri: Uri,
    dense: bool,
    schema: Arc<ArraySchema>,
    meta: Arc<FragmentMetadata>,
    view: DomainView<T>,
    storage: Arc<dyn Storage>,
    config: Config,
    subarray: Vec<T>,
    /// The fragment's domain, interleaved.
    frag_domain: Vec<T>,
    /// Dense: the fragment's tile-index box within the array tile grid.
    frag_tile_domain: Vec<u64>,
    /// Sparse: the next tile index the overlap scan will examine.
    tile_cursor: u64,
    /// Sparse: the tile the cursor currently rests on.
    current_tile: Option<u64>,
    done: bool,
    /// Loaded, unfiltered tiles keyed by `(field_id, tile_pos)`.
    tiles: HashMap<(usize, u64), Arc<Tile>>,
    /// Decoded coordinate tuples per loaded coordinate tile.
    coords_cache: HashMap<u64, Arc<Vec<T>>>,
    loaded_bytes: u64,
    memory_budget: u64,
}

impl<T: CoordType> ReadState<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fragment_idx: usize,
        uri: Uri,
        schema: Arc<ArraySchema>,
        meta: Arc<FragmentMetadata>,
        storage: Arc<dyn Storage>,
        config: Config,
        subarray: Vec<T>,
        memory_budget: u64,
    ) -> Result<Self> {
        let view = schema.domain().view::<T>()?;
        let dense = meta.dense();
        let frag_domain = coords_from_bytes::<T>(meta.domain());
        let frag_tile_domain = if dense {
            view.subarray_tile_domain(&frag_domain)
        } else {
            Vec::new()
        };

        Ok(ReadState {
            fragment_idx,
            uri,
            dense,
            schema,
            meta,
            view,
            storage,
            config,
            subarray,
            frag_domain,
            frag_tile_domain,
            tile_cursor: 0,
            current_tile: None,
            done: false,
            tiles: HashMap::new(),
            coords_cache: HashMap::new(),
            loaded_bytes: 0,
            memory_budget,
        })
    }

    pub fn fragment_idx(&self) -> usize {
        self.fragment_idx
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn metadata(&self) -> &FragmentMetadata {
        &self.meta
    }

    pub fn current_tile(&self) -> Option<u64> {
        self.current_tile
    }

    /* ---------------- sparse cursor ---------------- */

    /// Advances the cursor to the next tile whose MBR overlaps the query
    /// subarray. Marks the fragment done when none remains.
    pub fn advance_overlapping_tile_sparse(&mut self) {
        debug_assert!(!self.dense);
        let tile_num = self.meta.tile_num();
        self.current_tile = None;
        while self.tile_cursor < tile_num {
            let pos = self.tile_cursor;
            self.tile_cursor += 1;
            if self.mbr_overlaps_subarray(pos) {
                trace!(
                    "fragment {} advances to overlapping tile {pos}",
                    self.fragment_idx
                );
                self.current_tile = Some(pos);
                return;
            }
        }
        self.done = true;
    }

    fn mbr_overlaps_subarray(&self, tile_pos: u64) -> bool {
        let mbr = coords_from_bytes::<T>(self.meta.mbr(tile_pos));
        (0..self.view.dim_num()).all(|d| {
            mbr[2 * d].bits_le(&self.subarray[2 * d + 1])
                && mbr[2 * d + 1].bits_ge(&self.subarray[2 * d])
        })
    }

    /// First and last cell coordinates of the current tile in global order.
    pub fn bounding_coords(&self) -> Option<(Vec<T>, Vec<T>)> {
        let tile_pos = self.current_tile?;
        let bytes = self.meta.bounding_coords(tile_pos);
        let coords = coords_from_bytes::<T>(bytes);
        let dim_num = self.view.dim_num();
        Some((
            coords[..dim_num].to_vec(),
            coords[dim_num..].to_vec(),
        ))
    }

    /* ---------------- dense tile mapping ---------------- */

    /// Position of a space tile within this dense fragment, if covered.
    pub fn tile_pos_of_space_tile(&self, tile_coords: &[u64]) -> Option<u64> {
        debug_assert!(self.dense);
        let inside = (0..self.view.dim_num()).all(|d| {
            tile_coords[d] >= self.frag_tile_domain[2 * d]
                && tile_coords[d] <= self.frag_tile_domain[2 * d + 1]
        });
        inside.then(|| self.view.tile_pos_in(&self.frag_tile_domain, tile_coords))
    }

    /// Whether this dense fragment covers the query's part of a space tile.
    pub fn subarray_area_covered(&self, tile_coords: &[u64]) -> bool {
        let tile_sub = self.view.tile_subarray(tile_coords);
        let (overlap, kind) = self.view.subarray_overlap(&self.subarray, &tile_sub);
        if kind == crate::array::domain::Overlap::None {
            return false;
        }
        (0..self.view.dim_num()).all(|d| {
            overlap[2 * d].bits_ge(&self.frag_domain[2 * d])
                && overlap[2 * d + 1].bits_le(&self.frag_domain[2 * d + 1])
        })
    }

    /// The query overlap of this fragment within one space tile, as flat
    /// `[start, end]` coordinate ranges in cell order.
    pub fn cell_ranges_dense(&self, tile_coords: &[u64]) -> Vec<Box<[T]>> {
        debug_assert!(self.dense);
        let tile_sub = self.view.tile_subarray(tile_coords);
        let (overlap, kind) = self.view.subarray_overlap(&self.subarray, &tile_sub);
        if kind == crate::array::domain::Overlap::None {
            return Vec::new();
        }
        let query_in_tile = overlap;
        let (overlap, kind) = self.view.subarray_overlap(&self.frag_domain, &query_in_tile);
        if kind == crate::array::domain::Overlap::None {
            return Vec::new();
        }
        // classify contiguity within the space tile
        let (_, tile_kind) = self.view.subarray_overlap(&overlap, &tile_sub);
        cell_ranges_of_box(&self.view, &overlap, tile_kind)
    }

    /* ---------------- coordinate searches (sparse) ---------------- */

    /// Decoded coordinate tuples of one coordinate tile.
    pub fn coords_values(&mut self, tile_pos: u64) -> Result<Arc<Vec<T>>> {
        if let Some(v) = self.coords_cache.get(&tile_pos) {
            return Ok(Arc::clone(v));
        }
        let tile = self.tile(self.schema.attribute_num(), tile_pos)?;
        let values = Arc::new(tile.typed_values::<T>());
        self.coords_cache.insert(tile_pos, Arc::clone(&values));
        Ok(values)
    }

    fn coord_at(coords: &[T], dim_num: usize, pos: u64) -> &[T] {
        &coords[pos as usize * dim_num..(pos as usize + 1) * dim_num]
    }

    /// First cell position in the tile whose coordinates are `>= target`
    /// in global order.
    fn lower_bound(&self, coords: &[T], target: &[T]) -> u64 {
        let dim_num = self.view.dim_num();
        let cell_num = (coords.len() / dim_num) as u64;
        let mut lo = 0u64;
        let mut hi = cell_num;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let c = Self::coord_at(coords, dim_num, mid);
            if matches!(self.view.tile_cell_order_cmp(c, target), Ordering::Less) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First cell position in the tile whose coordinates are `> target`.
    fn upper_bound(&self, coords: &[T], target: &[T]) -> u64 {
        let dim_num = self.view.dim_num();
        let cell_num = (coords.len() / dim_num) as u64;
        let mut lo = 0u64;
        let mut hi = cell_num;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let c = Self::coord_at(coords, dim_num, mid);
            if matches!(
                self.view.tile_cell_order_cmp(c, target),
                Ordering::Less | Ordering::Equal
            ) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The smallest coordinates in tile `tile_pos` strictly after `target`
    /// in global order.
    pub fn get_coords_after(&mut self, tile_pos: u64, target: &[T]) -> Result<Option<Vec<T>>> {
        let coords = self.coords_values(tile_pos)?;
        let dim_num = self.view.dim_num();
        let cell_num = (coords.len() / dim_num) as u64;
        let pos = self.upper_bound(&coords, target);
        if pos < cell_num {
            Ok(Some(Self::coord_at(&coords, dim_num, pos).to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Within `[start, end]` of tile `tile_pos`, the coordinates enclosing
    /// `target`: the greatest strictly before it, whether it exists, and the
    /// smallest strictly after it.
    #[allow(clippy::type_complexity)]
    pub fn get_enclosing_coords(
        &mut self,
        tile_pos: u64,
        target: &[T],
        start: &[T],
        end: &[T],
    ) -> Result<(Option<Vec<T>>, bool, Option<Vec<T>>)> {
        let coords = self.coords_values(tile_pos)?;
        let dim_num = self.view.dim_num();

        let lo = self.lower_bound(&coords, start);
        let hi = self.upper_bound(&coords, end); // exclusive
        let at = self.lower_bound(&coords, target);

        let left = (at > lo).then(|| Self::coord_at(&coords, dim_num, at - 1).to_vec());
        let target_exists = at < hi
            && matches!(
                self.view
                    .tile_cell_order_cmp(Self::coord_at(&coords, dim_num, at), target),
                Ordering::Equal
            );
        let after = self.upper_bound(&coords, target);
        let right = (after < hi).then(|| Self::coord_at(&coords, dim_num, after).to_vec());

        Ok((left, target_exists, right))
    }

    /// Positions in tile `tile_pos` of the cells inside the coordinate
    /// range `[start, end]`, or `None` when the range holds no cell.
    pub fn cell_pos_range_sparse(
        &mut self,
        tile_pos: u64,
        start: &[T],
        end: &[T],
    ) -> Result<Option<(u64, u64)>> {
        let coords = self.coords_values(tile_pos)?;
        let lo = self.lower_bound(&coords, start);
        let hi = self.upper_bound(&coords, end);
        if lo < hi {
            Ok(Some((lo, hi - 1)))
        } else {
            Ok(None)
        }
    }

    /// One cell-coordinate range of the current tile covering global-order
    /// positions between `start` and `end` inclusive.
    pub fn cell_range_sparse(
        &mut self,
        start: &[T],
        end: &[T],
    ) -> Result<Option<(u64, Box<[T]>)>> {
        let Some(tile_pos) = self.current_tile else {
            return Ok(None);
        };
        let coords = self.coords_values(tile_pos)?;
        let dim_num = self.view.dim_num();
        let lo = self.lower_bound(&coords, start);
        let hi = self.upper_bound(&coords, end);
        if lo >= hi {
            return Ok(None);
        }
        let mut range = Vec::with_capacity(2 * dim_num);
        range.extend_from_slice(Self::coord_at(&coords, dim_num, lo));
        range.extend_from_slice(Self::coord_at(&coords, dim_num, hi - 1));
        Ok(Some((tile_pos, range.into())))
    }

    /* ---------------- tile loading ---------------- */

    /// Fetches one tile. `slab` names the cell positions the caller will
    /// touch: a seekable filter pipeline then restores only those cells,
    /// and the partial tile bypasses the cache. Without a hint (or through
    /// a non-seekable pipeline) a segment-sized window of neighbors loads
    /// with a single I/O.
    pub fn tile_slab(
        &mut self,
        field_id: usize,
        tile_pos: u64,
        direction: LoadDirection,
        slab: Option<std::ops::Range<u64>>,
    ) -> Result<Arc<Tile>> {
        if let Some(tile) = self.tiles.get(&(field_id, tile_pos)) {
            return Ok(Arc::clone(tile));
        }

        if let Some(slab) = slab {
            let pipeline = self.schema.filter_pipeline(field_id);
            let cell_num = self.meta.cell_num(tile_pos, &self.schema);
            let partial = slab.start > 0 || slab.end < cell_num;
            if partial && pipeline.is_selective() && !self.schema.var_size(field_id) {
                return self.load_tile_selective(field_id, tile_pos, slab);
            }
        }

        self.load_window(field_id, tile_pos, direction)?;
        self.tiles
            .get(&(field_id, tile_pos))
            .map(Arc::clone)
            .ok_or_else(|| Error::MetadataCorrupt(format!(
                "tile {tile_pos} of field {field_id} missing after load"
            )))
    }

    pub fn tile_directed(
        &mut self,
        field_id: usize,
        tile_pos: u64,
        direction: LoadDirection,
    ) -> Result<Arc<Tile>> {
        self.tile_slab(field_id, tile_pos, direction, None)
    }

    pub fn tile(&mut self, field_id: usize, tile_pos: u64) -> Result<Arc<Tile>> {
        self.tile_directed(field_id, tile_pos, LoadDirection::Forward)
    }

    /// Restores only the hinted cell slab of one fixed-size tile. The
    /// result is valid solely within the slab, so it is returned one-shot
    /// and never cached.
    fn load_tile_selective(
        &mut self,
        field_id: usize,
        tile_pos: u64,
        slab: std::ops::Range<u64>,
    ) -> Result<Arc<Tile>> {
        let name = self.schema.field_name(field_id);
        let cell_size = self.schema.cell_size(field_id);
        let datatype = self.schema.datatype(field_id);
        let pipeline = self.schema.filter_pipeline(field_id);

        let (start_off, end_off) = self.meta.tile_byte_range(field_id, tile_pos);
        let filtered =
            self.storage
                .read(&attribute_file(&self.uri, name), start_off, end_off - start_off)?;

        let byte_ranges = [slab.start * cell_size..slab.end * cell_size];
        trace!(
            "fragment {} selectively restores cells {}..{} of tile {tile_pos} of '{name}'",
            self.fragment_idx,
            slab.start,
            slab.end
        );
        let data = pipeline.unfilter(datatype, &filtered, Some(&byte_ranges))?;

        let validity = if self.schema.nullable(field_id) {
            let start_cell = self.cells_before(tile_pos);
            let cell_num = self.meta.cell_num(tile_pos, &self.schema);
            Some(self.storage.read(
                &validity_file(&self.uri, name),
                start_cell,
                cell_num,
            )?)
        } else {
            None
        };

        Ok(Arc::new(Tile::from_fixed_bytes(
            datatype, cell_size, data, validity,
        )))
    }

    /// The contiguous tile span whose filtered bytes fit one segment,
    /// anchored at `tile_pos`.
    fn window_span(&self, field_id: usize, tile_pos: u64, direction: LoadDirection) -> (u64, u64) {
        let tile_num = self.meta.tile_offsets(field_id).len() as u64;
        let segment = self.config.segment_size;
        let anchor_range = self.meta.tile_byte_range(field_id, tile_pos);
        let mut first = tile_pos;
        let mut last = tile_pos;
        match direction {
            LoadDirection::Forward => {
                while last + 1 < tile_num {
                    let (_, end) = self.meta.tile_byte_range(field_id, last + 1);
                    if end - anchor_range.0 > segment {
                        break;
                    }
                    last += 1;
                }
            }
            LoadDirection::Backward => {
                while first > 0 {
                    let (start, _) = self.meta.tile_byte_range(field_id, first - 1);
                    if anchor_range.1 - start > segment {
                        break;
                    }
                    first -= 1;
                }
            }
        }
        (first, last)
    }

    fn load_window(
        &mut self,
        field_id: usize,
        tile_pos: u64,
        direction: LoadDirection,
    ) -> Result<()> {
        let (first, last) = self.window_span(field_id, tile_pos, direction);
        let name = self.schema.field_name(field_id);
        let var = self.schema.var_size(field_id);
        let nullable = self.schema.nullable(field_id);
        let datatype = self.schema.datatype(field_id);
        let cell_size = self.schema.cell_size(field_id);
        let pipeline = self.schema.filter_pipeline(field_id);

        let (start_off, _) = self.meta.tile_byte_range(field_id, first);
        let (_, end_off) = self.meta.tile_byte_range(field_id, last);
        let fixed_uri = attribute_file(&self.uri, name);
        let segment = self.storage.read(&fixed_uri, start_off, end_off - start_off)?;
        debug!(
            "fragment {} loads tiles {first}..={last} of '{name}' ({} bytes)",
            self.fragment_idx,
            segment.len()
        );

        // var payloads ride along in one further contiguous read
        let var_segment = if var {
            let var_pos = self.schema.var_attribute_pos(field_id).unwrap();
            let (var_start, _) = self.meta.var_tile_byte_range(var_pos, first);
            let (_, var_end) = self.meta.var_tile_byte_range(var_pos, last);
            Some((
                var_start,
                self.storage
                    .read(&var_file(&self.uri, name), var_start, var_end - var_start)?,
            ))
        } else {
            None
        };

        let validity_segment = if nullable {
            let start_cell = self.cells_before(first);
            let end_cell = self.cells_before(last) + self.meta.cell_num(last, &self.schema);
            Some((
                start_cell,
                self.storage.read(
                    &validity_file(&self.uri, name),
                    start_cell,
                    end_cell - start_cell,
                )?,
            ))
        } else {
            None
        };

        let offsets_pipeline = self.schema.offsets_filter_pipeline();
        let meta = Arc::clone(&self.meta);
        let schema = Arc::clone(&self.schema);

        let built: Vec<(u64, Tile)> = (first..=last)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|pos| -> Result<(u64, Tile)> {
                let (tile_start, tile_end) = meta.tile_byte_range(field_id, pos);
                let filtered =
                    &segment[(tile_start - start_off) as usize..(tile_end - start_off) as usize];

                let validity = validity_segment.as_ref().map(|(base, bytes)| {
                    let cell_start = (self.cells_before(pos) - base) as usize;
                    let cell_num = meta.cell_num(pos, &schema) as usize;
                    bytes[cell_start..cell_start + cell_num].to_vec()
                });

                let tile = if var {
                    let var_pos = schema.var_attribute_pos(field_id).unwrap();
                    let offsets_bytes =
                        offsets_pipeline.unfilter(tessera_common::datatype::Datatype::UInt64, filtered, None)?;
                    let offsets: Vec<u64> = offsets_bytes
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    let (var_base, var_bytes) = var_segment.as_ref().unwrap();
                    let (vt_start, vt_end) = meta.var_tile_byte_range(var_pos, pos);
                    let var_filtered =
                        &var_bytes[(vt_start - var_base) as usize..(vt_end - var_base) as usize];
                    let var_data = pipeline.unfilter(datatype, var_filtered, None)?;
                    Tile::from_var_bytes(datatype, &offsets, var_data, validity)
                } else {
                    let data = pipeline.unfilter(datatype, filtered, None)?;
                    Tile::from_fixed_bytes(datatype, cell_size, data, validity)
                };
                Ok((pos, tile))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                warn!(
                    "dropping tiles {first}..={last} of fragment {}: {e}",
                    self.fragment_idx
                );
                e
            })?;

        for (pos, tile) in built {
            self.loaded_bytes += tile.size();
            self.tiles.insert((field_id, pos), Arc::new(tile));
        }
        self.enforce_budget(field_id, first, last)?;
        Ok(())
    }

    /// Total cells in tiles before `tile_pos`.
    fn cells_before(&self, tile_pos: u64) -> u64 {
        if self.dense {
            tile_pos * self.schema.cell_num_per_tile()
        } else {
            tile_pos * self.schema.capacity()
        }
    }

    fn enforce_budget(&mut self, keep_field: usize, keep_first: u64, keep_last: u64) -> Result<()> {
        if self.loaded_bytes <= self.memory_budget {
            return Ok(());
        }
        // evict everything outside the window just loaded
        let mut freed = 0u64;
        self.tiles.retain(|(field, pos), tile| {
            let keep = *field == keep_field && (keep_first..=keep_last).contains(pos);
            if !keep {
                freed += tile.size();
            }
            keep
        });
        self.coords_cache.clear();
        self.loaded_bytes -= freed;

        if self.loaded_bytes > self.memory_budget {
            return Err(ReadError::OutOfMemory {
                budget: self.memory_budget,
                required: self.loaded_bytes,
            }
            .into());
        }
        Ok(())
    }

}

/// Decomposes an interleaved box into flat `[start, end]` cell ranges in
/// cell order: one range if the box is contiguous, otherwise one slab per
/// run along the fastest-varying dimension.
pub fn cell_ranges_of_box<T: CoordType>(
    view: &DomainView<T>,
    overlap: &[T],
    kind: crate::array::domain::Overlap,
) -> Vec<Box<[T]>> {
    use crate::array::domain::Overlap;
    let dim_num = view.dim_num();

    let flat = |lo_hi: &dyn Fn(usize) -> (T, T)| -> Box<[T]> {
        let mut range = Vec::with_capacity(2 * dim_num);
        for d in 0..dim_num {
            range.push(lo_hi(d).0);
        }
        for d in 0..dim_num {
            range.push(lo_hi(d).1);
        }
        range.into()
    };

    match kind {
        Overlap::None => Vec::new(),
        Overlap::Full | Overlap::PartialContiguous => {
            vec![flat(&|d| (overlap[2 * d], overlap[2 * d + 1]))]
        }
        Overlap::PartialNonContiguous => {
            let fastest = match view.cell_order() {
                tessera_common::array::Layout::RowMajor => dim_num - 1,
                tessera_common::array::Layout::ColumnMajor => 0,
            };
            let mut coords: Vec<T> = (0..dim_num).map(|d| overlap[2 * d]).collect();
            let mut ranges = Vec::new();
            loop {
                ranges.push(flat(&|d| {
                    if d == fastest {
                        (overlap[2 * d], overlap[2 * d + 1])
                    } else {
                        (coords[d], coords[d])
                    }
                }));
                if !advance_slab(view, overlap, &mut coords, fastest) {
                    break;
                }
            }
            ranges
        }
    }
}

/// Odometer step over every dimension but the fastest one.
fn advance_slab<T: CoordType>(
    view: &DomainView<T>,
    overlap: &[T],
    coords: &mut [T],
    fastest: usize,
) -> bool {
    let dim_num = view.dim_num();
    let walk: Vec<usize> = match view.cell_order() {
        tessera_common::array::Layout::RowMajor => (0..dim_num).rev().collect(),
        tessera_common::array::Layout::ColumnMajor => (0..dim_num).collect(),
    };
    for &d in walk.iter().filter(|&&d| d != fastest) {
        if coords[d].bits_lt(&overlap[2 * d + 1]) {
            coords[d] = coords[d] + T::one();
            return true;
        }
        coords[d] = overlap[2 * d];
    }
    false
}
