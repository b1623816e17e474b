use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::{debug, trace};
use rayon::prelude::*;

use tessera_common::array::COORDS_NAME;
use tessera_common::datatype::physical::BitsOrd;
use tessera_common::datatype::{CoordType, Datatype};
use tessera_common::physical_type_go;
use tessera_storage::{Storage, Uri};

use crate::array::domain::{strides, DomainView};
use crate::array::schema::ArraySchema;
use crate::config::Config;
use crate::error::ReadError;
use crate::fragment::metadata::{coords_from_bytes, FragmentMetadata};
use crate::fragment::read_state::{cell_ranges_of_box, LoadDirection, ReadState};
use crate::query::condition::QueryCondition;
use crate::query::pq::{FragmentCellRange, PQFragmentCellRange, PQKey};
use crate::query::{OutputBuffers, OutputSizes, ReadLayout, ReadStatus};
use crate::tile::Tile;
use crate::{Error, Result};

/// The fill bytes of one unwritten cell of a field. Var-sized fields fill
/// with a zero-length value.
pub(crate) fn fill_value(datatype: Datatype, cell_val_num: u64) -> Vec<u8> {
    let one: Vec<u8> = physical_type_go!(datatype, DT, {
        let v: DT = if datatype.is_real_type() {
            num_traits::cast::<f64, DT>(f64::NAN).unwrap_or_else(DT::default)
        } else if datatype == Datatype::Char {
            DT::default()
        } else if matches!(
            datatype,
            Datatype::UInt8 | Datatype::UInt16 | Datatype::UInt32 | Datatype::UInt64
        ) {
            <DT as num_traits::Bounded>::max_value()
        } else {
            <DT as num_traits::Bounded>::min_value()
        };
        let mut bytes = Vec::new();
        tessera_common::datatype::PhysicalType::write_le(&v, &mut bytes);
        bytes
    });
    one.iter()
        .cycle()
        .take(one.len() * cell_val_num as usize)
        .copied()
        .collect()
}

/// A read query bound to one array snapshot. Repeated [ReadQuery::submit]
/// calls drain the result; an `Incomplete` status means the buffers filled
/// before the result did.
pub struct ReadQuery {
    driver: Box<dyn ReadDriver>,
    field_names: Vec<String>,
}

impl ReadQuery {
    pub(crate) fn new(driver: Box<dyn ReadDriver>, field_names: Vec<String>) -> Self {
        ReadQuery {
            driver,
            field_names,
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.field_names
    }

    /// Fills `outputs` (one entry per requested field, in order) with the
    /// next slice of results.
    pub fn submit(
        &mut self,
        outputs: &mut [OutputBuffers<'_>],
    ) -> Result<(Vec<OutputSizes>, ReadStatus)> {
        self.driver.read(outputs)
    }
}

pub trait ReadDriver: Send {
    fn read(
        &mut self,
        outputs: &mut [OutputBuffers<'_>],
    ) -> Result<(Vec<OutputSizes>, ReadStatus)>;
}

/// A reconciled cell range converted to tile positions, ready for copying.
#[derive(Clone, Debug)]
struct PosRange<T> {
    fragment: Option<usize>,
    tile_pos: u64,
    pos_lo: u64,
    pos_hi: u64,
    /// Sparse: the tile straddles the subarray boundary, so each cell must
    /// be checked against the subarray before copying.
    check_subarray: bool,
    /// Cells copy back to front (reverse global-order reads).
    reversed: bool,
    /// The flat `[start, end]` coordinate box of the range.
    range: Box<[T]>,
}

impl<T> PosRange<T> {
    fn positions(&self) -> u64 {
        self.pos_hi - self.pos_lo + 1
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FieldCursor {
    /// Absolute index of the round being copied.
    round: u64,
    /// Index of the range within that round.
    range: usize,
    /// Tile positions of that range already consumed.
    cells_done: u64,
}

struct Round<T> {
    ranges: Vec<PosRange<T>>,
}

/// Drives one read: primes per-fragment cursors, reconciles cell ranges
/// through the priority queue, and copies results to the caller's buffers.
/// The merge loop is the query's serialization point; tile unfiltering,
/// condition bitmaps, and slab copies fan out around it.
pub struct ArrayReadState<T: CoordType> {
    schema: Arc<ArraySchema>,
    view: DomainView<T>,
    config: Config,
    layout: ReadLayout,
    dups_allowed: bool,
    subarray: Vec<T>,
    field_ids: Vec<usize>,
    condition: Option<QueryCondition>,
    read_states: Vec<ReadState<T>>,
    cancelled: Arc<AtomicBool>,
    // dense space-tile iteration
    subarray_tile_domain: Vec<u64>,
    subarray_tile_coords: Option<Vec<u64>>,
    started: bool,
    done: bool,
    // sparse round state: per-fragment [start, end] bounding coordinates of
    // the current tile; the start advances as rounds consume it
    frag_bounding: Vec<Option<(Vec<T>, Vec<T>)>>,
    min_bounding_end: Option<Vec<T>>,
    // reconciled rounds pending copy
    rounds: Vec<Round<T>>,
    rounds_base: u64,
    cursors: Vec<FieldCursor>,
    bitmaps: HashMap<(usize, u64), Arc<Vec<u8>>>,
}

impl<T: CoordType> ArrayReadState<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Arc<ArraySchema>,
        storage: Arc<dyn Storage>,
        config: Config,
        layout: ReadLayout,
        subarray: Vec<T>,
        field_ids: Vec<usize>,
        condition: Option<QueryCondition>,
        fragments: Vec<(Uri, Arc<FragmentMetadata>)>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self> {
        let view = schema.domain().view::<T>()?;
        let dense = schema.is_dense();

        if layout != ReadLayout::Global && !dense {
            return Err(ReadError::UnsupportedLayout(layout).into());
        }
        if layout != ReadLayout::Global {
            for &id in &field_ids {
                if schema.var_size(id) {
                    return Err(ReadError::UnsupportedLayout(layout).into());
                }
            }
        }
        if dense && field_ids.iter().any(|&id| schema.is_coords_field(id)) {
            return Err(ReadError::CoordinatesOnDenseRead.into());
        }

        let fragment_num = fragments.len().max(1) as u64;
        let per_fragment_budget = config.coords_budget() / fragment_num;
        let read_states = fragments
            .into_iter()
            .enumerate()
            .map(|(idx, (uri, meta))| {
                ReadState::new(
                    idx,
                    uri,
                    Arc::clone(&schema),
                    meta,
                    Arc::clone(&storage),
                    config.clone(),
                    subarray.clone(),
                    per_fragment_budget,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let subarray_tile_domain = view.subarray_tile_domain(&subarray);
        let dups_allowed = !dense && !config.dedup_sparse;
        let field_num = field_ids.len();
        let frag_num = read_states.len();

        Ok(ArrayReadState {
            schema,
            view,
            config,
            layout,
            dups_allowed,
            subarray,
            field_ids,
            condition,
            read_states,
            cancelled,
            subarray_tile_domain,
            subarray_tile_coords: None,
            started: false,
            done: false,
            frag_bounding: vec![None; frag_num],
            min_bounding_end: None,
            rounds: Vec::new(),
            rounds_base: 0,
            cursors: vec![FieldCursor::default(); field_num],
            bitmaps: HashMap::new(),
        })
    }

    fn dense(&self) -> bool {
        self.schema.is_dense()
    }

    fn reversed(&self) -> bool {
        self.layout == ReadLayout::GlobalReverse
    }

    /* ---------------- round production: dense ---------------- */

    fn advance_space_tile(&mut self) -> bool {
        let dim_num = self.view.dim_num();
        if !self.started {
            self.started = true;
            // no overlap between subarray and the tile grid
            for d in 0..dim_num {
                if self.subarray_tile_domain[2 * d] > self.subarray_tile_domain[2 * d + 1] {
                    return false;
                }
            }
            let init: Vec<u64> = (0..dim_num)
                .map(|d| {
                    if self.reversed() {
                        self.subarray_tile_domain[2 * d + 1]
                    } else {
                        self.subarray_tile_domain[2 * d]
                    }
                })
                .collect();
            self.subarray_tile_coords = Some(init);
            return true;
        }

        let Some(coords) = &mut self.subarray_tile_coords else {
            return false;
        };
        let more = if self.layout == ReadLayout::GlobalReverse {
            self.view.prev_tile_coords(&self.subarray_tile_domain, coords)
        } else {
            self.view.next_tile_coords(&self.subarray_tile_domain, coords)
        };
        if !more {
            self.subarray_tile_coords = None;
        }
        more
    }

    /// Computes the next dense round: every fragment's ranges within the
    /// next space tile, reconciled through the queue.
    fn next_round_dense(&mut self) -> Result<bool> {
        if !self.advance_space_tile() {
            self.done = true;
            return Ok(false);
        }
        let tile_coords = self.subarray_tile_coords.clone().unwrap();
        let tile_subarray = self.view.tile_subarray(&tile_coords);

        let fragment_num = self.read_states.len();
        let mut unsorted: Vec<Vec<FragmentCellRange<T>>> = Vec::with_capacity(fragment_num + 1);
        let mut covered = false;
        for state in &self.read_states {
            if let Some(tile_pos) = state.tile_pos_of_space_tile(&tile_coords) {
                let ranges = state
                    .cell_ranges_dense(&tile_coords)
                    .into_iter()
                    .map(|range| FragmentCellRange {
                        fragment: Some(state.fragment_idx()),
                        tile_pos,
                        range,
                    })
                    .collect::<Vec<_>>();
                covered = covered || state.subarray_area_covered(&tile_coords);
                unsorted.push(ranges);
            } else {
                unsorted.push(Vec::new());
            }
        }

        // a fragment that accounts for the unwritten areas of the array
        if !covered {
            let (overlap, kind) = self.view.subarray_overlap(&self.subarray, &tile_subarray);
            let empty = cell_ranges_of_box(&self.view, &overlap, kind)
                .into_iter()
                .map(|range| FragmentCellRange {
                    fragment: None,
                    tile_pos: 0,
                    range,
                })
                .collect::<Vec<_>>();
            unsorted.push(empty);
        } else {
            unsorted.push(Vec::new());
        }

        let sorted = self.sort_fragment_cell_ranges(unsorted, Some(&tile_subarray))?;
        let round = self.to_pos_ranges(sorted)?;
        self.precompute_bitmaps(&round)?;
        self.push_round(round);
        Ok(true)
    }

    /* ---------------- round production: sparse ---------------- */

    fn next_round_sparse(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            for i in 0..self.read_states.len() {
                self.read_states[i].advance_overlapping_tile_sparse();
                self.frag_bounding[i] = self.read_states[i].bounding_coords();
            }
        } else {
            let min_end = self.min_bounding_end.clone().expect("round ordering");
            for i in 0..self.read_states.len() {
                let advance = matches!(
                    &self.frag_bounding[i],
                    Some((_, end)) if matches!(
                        self.view.tile_cell_order_cmp(end, &min_end),
                        std::cmp::Ordering::Equal
                    )
                );
                if advance {
                    self.read_states[i].advance_overlapping_tile_sparse();
                    self.frag_bounding[i] = self.read_states[i].bounding_coords();
                }
            }
        }

        // smallest end bounding coordinate across the fragments
        let mut min_end: Option<Vec<T>> = None;
        for bounding in self.frag_bounding.iter().flatten() {
            let end = &bounding.1;
            min_end = match min_end {
                None => Some(end.clone()),
                Some(current)
                    if matches!(
                        self.view.tile_cell_order_cmp(end, &current),
                        std::cmp::Ordering::Less
                    ) =>
                {
                    Some(end.clone())
                }
                keep => keep,
            };
        }
        let Some(min_end) = min_end else {
            self.done = true;
            return Ok(false);
        };
        self.min_bounding_end = Some(min_end.clone());

        let fragment_num = self.read_states.len();
        let mut unsorted: Vec<Vec<FragmentCellRange<T>>> = vec![Vec::new(); fragment_num];
        for i in 0..fragment_num {
            let Some((start, end)) = self.frag_bounding[i].clone() else {
                continue;
            };
            if matches!(
                self.view.tile_cell_order_cmp(&start, &min_end),
                std::cmp::Ordering::Greater
            ) {
                continue;
            }
            if let Some((tile_pos, range)) =
                self.read_states[i].cell_range_sparse(&start, &min_end)?
            {
                unsorted[i].push(FragmentCellRange {
                    fragment: Some(i),
                    tile_pos,
                    range,
                });
            }
            // this tile extends past the round: advance its start bounding
            // coordinate beyond the smallest end
            if !matches!(
                self.view.tile_cell_order_cmp(&end, &min_end),
                std::cmp::Ordering::Equal
            ) {
                let tile_pos = self.read_states[i]
                    .current_tile()
                    .expect("bounded fragment has a current tile");
                let after = self.read_states[i].get_coords_after(tile_pos, &min_end)?;
                let after = after.expect("end bounding coordinate past the round minimum");
                self.frag_bounding[i] = Some((after, end));
            }
        }

        let sorted = self.sort_fragment_cell_ranges(unsorted, None)?;
        let round = self.to_pos_ranges(sorted)?;
        self.precompute_bitmaps(&round)?;
        self.push_round(round);
        Ok(true)
    }

    fn push_round(&mut self, mut ranges: Vec<PosRange<T>>) {
        if self.reversed() {
            ranges.reverse();
            for r in ranges.iter_mut() {
                r.reversed = true;
            }
        }
        trace!("round {} holds {} ranges", self.rounds_base as usize + self.rounds.len(), ranges.len());
        self.rounds.push(Round { ranges });
    }

    /* ---------------- the reconciliation queue ---------------- */

    /// Merges per-fragment range lists into one globally ordered, disjoint
    /// list obeying the recency rule. This is the query's serial spine.
    fn sort_fragment_cell_ranges(
        &mut self,
        mut unsorted: Vec<Vec<FragmentCellRange<T>>>,
        tile_domain: Option<&[T]>,
    ) -> Result<Vec<FragmentCellRange<T>>> {
        let list_num = unsorted.len();
        let non_empty = unsorted.iter().filter(|l| !l.is_empty()).count();
        if non_empty == 0 {
            return Ok(Vec::new());
        }
        if non_empty == 1 {
            let first = unsorted.iter_mut().find(|l| !l.is_empty()).unwrap();
            return Ok(std::mem::take(first));
        }

        struct Entry<T> {
            key: PQKey<T>,
            pq: PQFragmentCellRange<T>,
        }
        impl<T: CoordType> Ord for Entry<T> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.key.cmp(&other.key)
            }
        }
        impl<T: CoordType> PartialOrd for Entry<T> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl<T: CoordType> PartialEq for Entry<T> {
            fn eq(&self, other: &Self) -> bool {
                matches!(self.cmp(other), std::cmp::Ordering::Equal)
            }
        }
        impl<T: CoordType> Eq for Entry<T> {}

        let mut rid = vec![0usize; list_num];
        let mut heap: BinaryHeap<Reverse<Entry<T>>> = BinaryHeap::new();
        let dups_allowed = self.dups_allowed;
        let view = self.view.clone();

        let mut push = |heap: &mut BinaryHeap<Reverse<Entry<T>>>, pq: PQFragmentCellRange<T>| {
            let key = pq.heap_key(&view, dups_allowed);
            heap.push(Reverse(Entry { key, pq }));
        };
        // Pulls the next precomputed range of a fragment's list; the empty
        // sentinel maps to the final list.
        let mut refill = |heap: &mut BinaryHeap<Reverse<Entry<T>>>,
                          rid: &mut Vec<usize>,
                          fragment: Option<usize>| {
            let fid = fragment.unwrap_or(list_num - 1);
            if rid[fid] < unsorted[fid].len() {
                let pq = PQFragmentCellRange::import_from(&unsorted[fid][rid[fid]], &view);
                rid[fid] += 1;
                let key = pq.heap_key(&view, dups_allowed);
                heap.push(Reverse(Entry { key, pq }));
            }
        };

        for fid in 0..list_num {
            if !unsorted[fid].is_empty() {
                let pq = PQFragmentCellRange::import_from(&unsorted[fid][0], &view);
                rid[fid] = 1;
                push(&mut heap, pq);
            }
        }

        let mut result: Vec<FragmentCellRange<T>> = Vec::new();
        while let Some(Reverse(entry)) = heap.pop() {
            let mut popped = entry.pq;
            if heap.is_empty() {
                result.push(popped.export_to());
                refill(&mut heap, &mut rid, popped.fragment);
                continue;
            }

            if popped.dense(&self.read_states) || popped.unary() {
                // trim phase: consume older overlapping ranges from the queue
                loop {
                    let Some(Reverse(top_entry)) = heap.peek() else {
                        break;
                    };
                    if dups_allowed || !popped.must_trim(&top_entry.pq, &view) {
                        break;
                    }
                    let ends_after = top_entry.pq.ends_after(&popped, &view);
                    let Reverse(top_entry) = heap.pop().unwrap();
                    let top = top_entry.pq;
                    if ends_after {
                        match popped.trim(&top, &view, tile_domain, &mut self.read_states)? {
                            Some(trimmed) => push(&mut heap, trimmed),
                            None => refill(&mut heap, &mut rid, top.fragment),
                        }
                    } else {
                        // fully shadowed
                        refill(&mut heap, &mut rid, top.fragment);
                    }
                }

                // split phase: a newer range starting inside forces a split
                let split = match heap.peek() {
                    Some(Reverse(top_entry)) => {
                        !dups_allowed && popped.must_be_split(&top_entry.pq, &view)
                    }
                    None => false,
                };
                if split {
                    let Reverse(top_entry) = heap.pop().unwrap();
                    let tail = popped.split(
                        &top_entry.pq,
                        &view,
                        tile_domain.expect("split requires a tile domain"),
                    );
                    heap.push(Reverse(top_entry));
                    push(&mut heap, tail);
                } else {
                    refill(&mut heap, &mut rid, popped.fragment);
                }
                result.push(popped.export_to());
            } else {
                // sparse, multi-cell popped
                let begins_after = {
                    let Reverse(top_entry) = heap.peek().unwrap();
                    top_entry.pq.begins_after(&popped, &view)
                };
                if begins_after {
                    result.push(popped.export_to());
                    refill(&mut heap, &mut rid, popped.fragment);
                } else {
                    let (left, unary, alive) = {
                        let top = {
                            let Reverse(top_entry) = heap.peek().unwrap();
                            top_entry.pq.clone()
                        };
                        popped.split_to_3(&top, &view, &mut self.read_states)?
                    };
                    if unary.is_none() && !alive {
                        refill(&mut heap, &mut rid, popped.fragment);
                    }
                    if let Some(left) = left {
                        result.push(left.export_to());
                    }
                    if let Some(unary) = unary {
                        push(&mut heap, unary);
                    }
                    if alive {
                        push(&mut heap, popped);
                    }
                }
            }
        }

        Ok(result)
    }

    /* ---------------- range conversion & copying ---------------- */

    /// Converts reconciled coordinate ranges into tile-position ranges.
    fn to_pos_ranges(&mut self, ranges: Vec<FragmentCellRange<T>>) -> Result<Vec<PosRange<T>>> {
        let dim_num = self.view.dim_num();

        // one round must fit the queued-range budget; a round is bounded by
        // a single space tile (dense) or bounding window (sparse), so this
        // only trips on pathological tiling
        let range_bytes =
            (std::mem::size_of::<PosRange<T>>() + 2 * dim_num * std::mem::size_of::<T>()) as u64;
        let estimated = ranges.len() as u64 * range_bytes;
        if estimated > self.config.tile_ranges_budget() {
            return Err(ReadError::OutOfMemory {
                budget: self.config.tile_ranges_budget(),
                required: estimated,
            }
            .into());
        }

        let mut out = Vec::with_capacity(ranges.len());
        for fcr in ranges {
            let start = &fcr.range[..dim_num];
            let end = &fcr.range[dim_num..];
            match fcr.fragment {
                None => {
                    out.push(PosRange {
                        fragment: None,
                        tile_pos: fcr.tile_pos,
                        pos_lo: self.view.cell_pos_in_tile(start),
                        pos_hi: self.view.cell_pos_in_tile(end),
                        check_subarray: false,
                        reversed: false,
                        range: fcr.range,
                    });
                }
                Some(f) if self.read_states[f].dense() => {
                    out.push(PosRange {
                        fragment: fcr.fragment,
                        tile_pos: fcr.tile_pos,
                        pos_lo: self.view.cell_pos_in_tile(start),
                        pos_hi: self.view.cell_pos_in_tile(end),
                        check_subarray: false,
                        reversed: false,
                        range: fcr.range,
                    });
                }
                Some(f) => {
                    let Some((pos_lo, pos_hi)) =
                        self.read_states[f].cell_pos_range_sparse(fcr.tile_pos, start, end)?
                    else {
                        continue;
                    };
                    // only cells of a boundary-straddling MBR need the
                    // per-cell subarray test
                    let mbr = coords_from_bytes::<T>(
                        self.read_states[f].metadata().mbr(fcr.tile_pos),
                    );
                    let inside = (0..dim_num).all(|d| {
                        mbr[2 * d].bits_ge(&self.subarray[2 * d])
                            && mbr[2 * d + 1].bits_le(&self.subarray[2 * d + 1])
                    });
                    out.push(PosRange {
                        fragment: fcr.fragment,
                        tile_pos: fcr.tile_pos,
                        pos_lo,
                        pos_hi,
                        check_subarray: !inside,
                        reversed: false,
                        range: fcr.range,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Evaluates the condition over every distinct tile of a round at once;
    /// the per-tile evaluations are independent and fan out on the pool.
    fn precompute_bitmaps(&mut self, ranges: &[PosRange<T>]) -> Result<()> {
        let Some(condition) = self.condition.as_ref() else {
            return Ok(());
        };
        let condition = condition.clone();

        let mut jobs: Vec<((usize, u64), HashMap<String, Arc<Tile>>, u64)> = Vec::new();
        for range in ranges {
            let Some(fragment) = range.fragment else {
                continue;
            };
            let key = (fragment, range.tile_pos);
            if self.bitmaps.contains_key(&key) || jobs.iter().any(|(k, _, _)| *k == key) {
                continue;
            }
            let mut tiles = HashMap::new();
            for name in condition.fields() {
                let id = self
                    .schema
                    .field_id(name)
                    .ok_or_else(|| ReadError::UnknownField(name.to_owned()))?;
                tiles.insert(name.to_owned(), self.read_states[fragment].tile(id, range.tile_pos)?);
            }
            let cell_num = self.read_states[fragment]
                .metadata()
                .cell_num(range.tile_pos, &self.schema);
            jobs.push((key, tiles, cell_num));
        }

        let computed = jobs
            .into_par_iter()
            .map(|(key, tiles, cell_num)| {
                condition
                    .evaluate(&|name: &str| tiles.get(name).map(|t| t.as_ref()), cell_num)
                    .map(|bm| (key, bm))
                    .map_err(ReadError::Condition)
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        for (key, bm) in computed {
            self.bitmaps.insert(key, Arc::new(bm));
        }
        Ok(())
    }

    /// Survival bitmap of one tile under the query condition.
    fn bitmap(&mut self, fragment: usize, tile_pos: u64) -> Result<Option<Arc<Vec<u8>>>> {
        let Some(condition) = self.condition.as_ref() else {
            return Ok(None);
        };
        if let Some(bm) = self.bitmaps.get(&(fragment, tile_pos)) {
            return Ok(Some(Arc::clone(bm)));
        }
        let condition = condition.clone();

        let mut tiles: HashMap<String, Arc<Tile>> = HashMap::new();
        for name in condition.fields() {
            let id = self
                .schema
                .field_id(name)
                .ok_or_else(|| ReadError::UnknownField(name.to_owned()))?;
            let tile = self.read_states[fragment].tile(id, tile_pos)?;
            tiles.insert(name.to_owned(), tile);
        }
        let cell_num = self.read_states[fragment]
            .metadata()
            .cell_num(tile_pos, &self.schema);
        let bitmap = Arc::new(
            condition
                .evaluate(&|name: &str| tiles.get(name).map(|t| t.as_ref()), cell_num)
                .map_err(ReadError::Condition)?,
        );
        self.bitmaps.insert((fragment, tile_pos), Arc::clone(&bitmap));
        Ok(Some(bitmap))
    }

    fn fits_fixed(out: &OutputBuffers<'_>, sizes: &OutputSizes, cell_size: u64) -> bool {
        sizes.data_bytes + cell_size <= out.data.len() as u64
            && out
                .validity
                .as_ref()
                .map(|v| sizes.validity_bytes < v.len() as u64)
                .unwrap_or(true)
    }

    fn fits_var(out: &OutputBuffers<'_>, sizes: &OutputSizes, value_len: u64) -> bool {
        let offsets_ok = out
            .offsets
            .as_ref()
            .map(|o| sizes.offsets_count < o.len() as u64)
            .unwrap_or(false);
        offsets_ok
            && sizes.data_bytes + value_len <= out.data.len() as u64
            && out
                .validity
                .as_ref()
                .map(|v| sizes.validity_bytes < v.len() as u64)
                .unwrap_or(true)
    }

    fn push_fixed(
        out: &mut OutputBuffers<'_>,
        sizes: &mut OutputSizes,
        value: &[u8],
        validity: Option<u8>,
    ) {
        let at = sizes.data_bytes as usize;
        out.data[at..at + value.len()].copy_from_slice(value);
        sizes.data_bytes += value.len() as u64;
        if let Some(v) = &mut out.validity {
            v[sizes.validity_bytes as usize] = validity.unwrap_or(1);
            sizes.validity_bytes += 1;
        }
    }

    fn push_var(
        out: &mut OutputBuffers<'_>,
        sizes: &mut OutputSizes,
        value: &[u8],
        validity: Option<u8>,
    ) {
        let offsets = out.offsets.as_mut().expect("var output requires offsets");
        offsets[sizes.offsets_count as usize] = sizes.data_bytes;
        sizes.offsets_count += 1;
        let at = sizes.data_bytes as usize;
        out.data[at..at + value.len()].copy_from_slice(value);
        sizes.data_bytes += value.len() as u64;
        if let Some(v) = &mut out.validity {
            v[sizes.validity_bytes as usize] = validity.unwrap_or(1);
            sizes.validity_bytes += 1;
        }
    }

    /// Copies one range into a field's output. Returns `None` when the
    /// range is exhausted, or `Some(consumed)` on overflow after consuming
    /// `consumed` of its positions.
    fn copy_range(
        &mut self,
        field_id: usize,
        range: &PosRange<T>,
        skip: u64,
        out: &mut OutputBuffers<'_>,
        sizes: &mut OutputSizes,
    ) -> Result<Option<u64>> {
        let var = self.schema.var_size(field_id);
        let cell_size = self.schema.cell_size(field_id);
        let datatype = self.schema.datatype(field_id);
        let cell_val_num: u64 = if self.schema.is_coords_field(field_id) {
            self.schema.dim_num() as u64
        } else {
            match self.schema.attribute(field_id).cell_val_num() {
                tessera_common::array::CellValNum::Fixed(n) => n.get() as u64,
                tessera_common::array::CellValNum::Var => 1,
            }
        };
        let positions = range.positions();

        let Some(fragment) = range.fragment else {
            // empty-fragment fill
            let fill = fill_value(datatype, cell_val_num);
            for i in skip..positions {
                let ok = if var {
                    Self::fits_var(out, sizes, 0)
                } else {
                    Self::fits_fixed(out, sizes, cell_size)
                };
                if !ok {
                    return Ok(Some(i));
                }
                if var {
                    Self::push_var(out, sizes, &[], Some(0));
                } else {
                    Self::push_fixed(out, sizes, &fill, Some(0));
                }
            }
            return Ok(None);
        };

        let direction = if range.reversed {
            LoadDirection::Backward
        } else {
            LoadDirection::Forward
        };
        // name the cells this copy will touch so a seekable pipeline can
        // skip restoring the rest of the tile
        let tile = self.read_states[fragment].tile_slab(
            field_id,
            range.tile_pos,
            direction,
            Some(range.pos_lo..range.pos_hi + 1),
        )?;
        let bitmap = self.bitmap(fragment, range.tile_pos)?;
        let source_dense = self.read_states[fragment].dense();
        let coords = if range.check_subarray {
            Some(self.read_states[fragment].coords_values(range.tile_pos)?)
        } else {
            None
        };
        let dim_num = self.view.dim_num();
        let fill = fill_value(datatype, cell_val_num);

        for i in skip..positions {
            let pos = if range.reversed {
                range.pos_hi - i
            } else {
                range.pos_lo + i
            };

            if let Some(coords) = &coords {
                let c = &coords[pos as usize * dim_num..(pos as usize + 1) * dim_num];
                if !self.view.cell_in_subarray(c, &self.subarray) {
                    continue;
                }
            }
            let surviving = bitmap.as_ref().map(|bm| bm[pos as usize] == 1).unwrap_or(true);
            if !surviving && !source_dense {
                // sparse cells failing the condition drop out of the result
                continue;
            }

            let value = if surviving { tile.get(pos) } else { fill.as_slice() };
            let validity = if surviving { tile.validity(pos) } else { 0 };
            let ok = if var {
                Self::fits_var(out, sizes, value.len() as u64)
            } else {
                Self::fits_fixed(out, sizes, cell_size)
            };
            if !ok {
                return Ok(Some(i));
            }
            if var {
                Self::push_var(out, sizes, value, Some(validity));
            } else {
                Self::push_fixed(out, sizes, value, Some(validity));
            }
        }
        Ok(None)
    }

    /// Copies everything available for one field. Returns `true` when the
    /// field's buffers overflowed.
    fn copy_field(
        &mut self,
        out_idx: usize,
        out: &mut OutputBuffers<'_>,
        sizes: &mut OutputSizes,
    ) -> Result<bool> {
        let field_id = self.field_ids[out_idx];
        loop {
            let cursor = self.cursors[out_idx];
            let round_idx = (cursor.round - self.rounds_base) as usize;
            if round_idx >= self.rounds.len() {
                return Ok(false);
            }

            if cursor.cells_done == 0 && cursor.range == 0 {
                self.copy_round_slabs(out_idx, field_id, out, sizes)?;
            }

            let cursor = self.cursors[out_idx];
            let round_idx = (cursor.round - self.rounds_base) as usize;
            if round_idx >= self.rounds.len() {
                continue;
            }
            let range_count = self.rounds[round_idx].ranges.len();
            if cursor.range >= range_count {
                self.cursors[out_idx] = FieldCursor {
                    round: cursor.round + 1,
                    range: 0,
                    cells_done: 0,
                };
                continue;
            }

            let range = self.rounds[round_idx].ranges[cursor.range].clone();
            match self.copy_range(field_id, &range, cursor.cells_done, out, sizes)? {
                None => {
                    self.cursors[out_idx] = FieldCursor {
                        round: cursor.round,
                        range: cursor.range + 1,
                        cells_done: 0,
                    };
                }
                Some(consumed) => {
                    self.cursors[out_idx] = FieldCursor {
                        round: cursor.round,
                        range: cursor.range,
                        cells_done: consumed,
                    };
                    return Ok(true);
                }
            }
        }
    }

    /// The parallel fast path of result assembly: whole ranges of the
    /// current round that fit the remaining buffer are copied concurrently
    /// into precomputed disjoint output slabs. Applies to fixed-size fields
    /// in forward global order with no condition; everything else falls to
    /// the per-cell loop.
    fn copy_round_slabs(
        &mut self,
        out_idx: usize,
        field_id: usize,
        out: &mut OutputBuffers<'_>,
        sizes: &mut OutputSizes,
    ) -> Result<()> {
        if self.layout != ReadLayout::Global
            || self.condition.is_some()
            || self.schema.var_size(field_id)
            || out.validity.is_some()
        {
            return Ok(());
        }
        let cursor = self.cursors[out_idx];
        let round_idx = (cursor.round - self.rounds_base) as usize;
        let cell_size = self.schema.cell_size(field_id);
        let datatype = self.schema.datatype(field_id);
        let cell_val_num: u64 = if self.schema.is_coords_field(field_id) {
            self.schema.dim_num() as u64
        } else {
            match self.schema.attribute(field_id).cell_val_num() {
                tessera_common::array::CellValNum::Fixed(n) => n.get() as u64,
                tessera_common::array::CellValNum::Var => return Ok(()),
            }
        };

        // gather the prefix of whole ranges that fit
        enum SlabSource {
            Fill,
            Tile(Arc<Tile>),
        }
        let mut slabs: Vec<(SlabSource, u64, u64)> = Vec::new(); // (source, pos_lo, bytes)
        let mut budget = out.data.len() as u64 - sizes.data_bytes;
        let mut taken = 0usize;
        for range in &self.rounds[round_idx].ranges {
            if range.check_subarray || range.reversed {
                break;
            }
            let bytes = range.positions() * cell_size;
            if bytes > budget {
                break;
            }
            budget -= bytes;
            taken += 1;
            slabs.push((SlabSource::Fill, range.pos_lo, bytes));
        }
        if taken < 2 {
            return Ok(());
        }
        // prefetch tiles serially; loading mutates the read states
        for (i, slab) in slabs.iter_mut().enumerate() {
            let range = &self.rounds[round_idx].ranges[i];
            if let Some(f) = range.fragment {
                let tile = self.read_states[f].tile(field_id, range.tile_pos)?;
                slab.0 = SlabSource::Tile(tile);
            }
        }

        let fill = fill_value(datatype, cell_val_num);
        let mut rest: &mut [u8] = &mut out.data[sizes.data_bytes as usize..];
        let mut jobs: Vec<(&mut [u8], &SlabSource, u64)> = Vec::with_capacity(taken);
        for (source, pos_lo, bytes) in slabs.iter() {
            let (slice, tail) = std::mem::take(&mut rest).split_at_mut(*bytes as usize);
            jobs.push((slice, source, *pos_lo));
            rest = tail;
        }

        jobs.into_par_iter().for_each(|(slice, source, pos_lo)| {
            match source {
                SlabSource::Fill => {
                    for chunk in slice.chunks_exact_mut(fill.len()) {
                        chunk.copy_from_slice(&fill);
                    }
                }
                SlabSource::Tile(tile) => {
                    let start = (pos_lo * cell_size) as usize;
                    slice.copy_from_slice(&tile.data()[start..start + slice.len()]);
                }
            }
        });

        let copied_bytes: u64 = slabs.iter().map(|(_, _, b)| b).sum();
        sizes.data_bytes += copied_bytes;
        self.cursors[out_idx] = FieldCursor {
            round: cursor.round,
            range: taken,
            cells_done: 0,
        };
        Ok(())
    }

    /// Drops rounds every field has fully copied.
    fn gc_rounds(&mut self) {
        let min_round = self.cursors.iter().map(|c| c.round).min().unwrap_or(0);
        while self.rounds_base < min_round && !self.rounds.is_empty() {
            self.rounds.remove(0);
            self.rounds_base += 1;
        }
    }

    fn all_fields_drained(&self) -> bool {
        let end = self.rounds_base + self.rounds.len() as u64;
        self.cursors.iter().all(|c| c.round >= end)
    }

    /* ---------------- sorted (scatter) layouts ---------------- */

    /// Row/column-major dense reads: the whole subarray is assembled in one
    /// shot, each cell scattered to its position in the requested order.
    fn scatter_read(
        &mut self,
        outputs: &mut [OutputBuffers<'_>],
    ) -> Result<(Vec<OutputSizes>, ReadStatus)> {
        let volume = self.view.subarray_volume(&self.subarray);
        let dim_num = self.view.dim_num();
        let counts: Vec<u64> = (0..dim_num)
            .map(|d| {
                num_traits::cast::<T, i128>(self.subarray[2 * d + 1])
                    .zip(num_traits::cast::<T, i128>(self.subarray[2 * d]))
                    .map(|(hi, lo)| (hi - lo + 1) as u64)
                    .unwrap_or(0)
            })
            .collect();
        let (row, col) = strides(&counts);
        let scatter_strides = if self.layout == ReadLayout::RowMajor {
            row
        } else {
            col
        };

        for (out_idx, out) in outputs.iter().enumerate() {
            let field_id = self.field_ids[out_idx];
            let required = volume * self.schema.cell_size(field_id);
            if (out.data.len() as u64) < required {
                return Err(ReadError::SortedLayoutBufferTooSmall {
                    field: self.schema.field_name(field_id).to_owned(),
                    required,
                }
                .into());
            }
            if let Some(v) = &out.validity {
                if (v.len() as u64) < volume {
                    return Err(ReadError::SortedLayoutBufferTooSmall {
                        field: self.schema.field_name(field_id).to_owned(),
                        required: volume,
                    }
                    .into());
                }
            }
        }

        let mut sizes = vec![OutputSizes::default(); outputs.len()];
        while self.next_round_dense()? {
            if self.cancelled.load(AtomicOrdering::Relaxed) {
                return Err(ReadError::Cancelled.into());
            }
            let round = self.rounds.pop().expect("round just produced");
            for range in &round.ranges {
                for (out_idx, out) in outputs.iter_mut().enumerate() {
                    let field_id = self.field_ids[out_idx];
                    self.scatter_range(field_id, range, &scatter_strides, out, &mut sizes[out_idx])?;
                }
            }
        }
        for (out_idx, s) in sizes.iter_mut().enumerate() {
            let field_id = self.field_ids[out_idx];
            s.data_bytes = volume * self.schema.cell_size(field_id);
            if outputs[out_idx].validity.is_some() {
                s.validity_bytes = volume;
            }
        }
        Ok((sizes, ReadStatus::Complete))
    }

    fn scatter_range(
        &mut self,
        field_id: usize,
        range: &PosRange<T>,
        scatter_strides: &[u64],
        out: &mut OutputBuffers<'_>,
        _sizes: &mut OutputSizes,
    ) -> Result<()> {
        let dim_num = self.view.dim_num();
        let cell_size = self.schema.cell_size(field_id) as usize;
        let datatype = self.schema.datatype(field_id);
        let cell_val_num: u64 = match self.schema.attribute(field_id).cell_val_num() {
            tessera_common::array::CellValNum::Fixed(n) => n.get() as u64,
            tessera_common::array::CellValNum::Var => 1,
        };
        let fill = fill_value(datatype, cell_val_num);

        let source = match range.fragment {
            None => None,
            Some(f) => Some((
                self.read_states[f].tile(field_id, range.tile_pos)?,
                self.bitmap(f, range.tile_pos)?,
            )),
        };

        // walk the range's box in cell order; positions advance in step
        let box_range: Vec<T> = (0..dim_num)
            .flat_map(|d| [range.range[d], range.range[dim_num + d]])
            .collect();
        let mut coords: Vec<T> = range.range[..dim_num].to_vec();
        let mut pos = range.pos_lo;
        loop {
            let dest: u64 = (0..dim_num)
                .map(|d| {
                    let lo = self.subarray[2 * d];
                    num_traits::cast::<T, i128>(coords[d])
                        .zip(num_traits::cast::<T, i128>(lo))
                        .map(|(c, lo)| (c - lo) as u64)
                        .unwrap_or(0)
                        * scatter_strides[d]
                })
                .sum();
            let at = dest as usize * cell_size;

            match &source {
                None => out.data[at..at + cell_size].copy_from_slice(&fill),
                Some((tile, bitmap)) => {
                    let surviving = bitmap.as_ref().map(|bm| bm[pos as usize] == 1).unwrap_or(true);
                    if surviving {
                        out.data[at..at + cell_size].copy_from_slice(tile.get(pos));
                        if let Some(v) = &mut out.validity {
                            v[dest as usize] = tile.validity(pos);
                        }
                    } else {
                        out.data[at..at + cell_size].copy_from_slice(&fill);
                        if let Some(v) = &mut out.validity {
                            v[dest as usize] = 0;
                        }
                    }
                }
            }
            if source.is_none() {
                if let Some(v) = &mut out.validity {
                    v[dest as usize] = 0;
                }
            }

            if !self.view.next_cell_coords(&box_range, &mut coords) {
                break;
            }
            pos += 1;
        }
        Ok(())
    }
}

impl<T: CoordType> ReadDriver for ArrayReadState<T> {
    fn read(
        &mut self,
        outputs: &mut [OutputBuffers<'_>],
    ) -> Result<(Vec<OutputSizes>, ReadStatus)> {
        if outputs.len() != self.field_ids.len() {
            return Err(ReadError::OutputCount {
                expected: self.field_ids.len(),
                actual: outputs.len(),
            }
            .into());
        }
        for (i, out) in outputs.iter().enumerate() {
            let field_id = self.field_ids[i];
            if self.schema.var_size(field_id) != out.offsets.is_some() {
                return Err(ReadError::OutputShape {
                    field: self.schema.field_name(field_id).to_owned(),
                }
                .into());
            }
        }

        if matches!(self.layout, ReadLayout::RowMajor | ReadLayout::ColumnMajor) {
            return self.scatter_read(outputs);
        }

        let mut sizes = vec![OutputSizes::default(); outputs.len()];
        let mut overflowed = vec![false; outputs.len()];

        loop {
            if self.cancelled.load(AtomicOrdering::Relaxed) {
                return Err(ReadError::Cancelled.into());
            }

            for (i, out) in outputs.iter_mut().enumerate() {
                if !overflowed[i] {
                    overflowed[i] = self.copy_field(i, out, &mut sizes[i])?;
                }
            }
            self.gc_rounds();

            if overflowed.iter().any(|o| *o) {
                debug!("read round overflowed; returning incomplete");
                return Ok((sizes, ReadStatus::Incomplete));
            }
            if self.done && self.all_fields_drained() {
                return Ok((sizes, ReadStatus::Complete));
            }

            let produced = if self.dense() {
                self.next_round_dense()?
            } else {
                self.next_round_sparse()?
            };
            if !produced && self.done && self.all_fields_drained() {
                return Ok((sizes, ReadStatus::Complete));
            }
        }
    }
}

/// Builds the typed read driver at the coordinate-type dispatch boundary.
#[allow(clippy::too_many_arguments)]
pub fn new_read_query(
    schema: Arc<ArraySchema>,
    storage: Arc<dyn Storage>,
    config: Config,
    layout: ReadLayout,
    subarray_bytes: &[u8],
    field_names: &[&str],
    condition: Option<QueryCondition>,
    fragments: Vec<(Uri, Arc<FragmentMetadata>)>,
    cancelled: Arc<AtomicBool>,
) -> Result<ReadQuery> {
    let expected = 2 * schema.coords_size();
    if subarray_bytes.len() as u64 != expected {
        return Err(ReadError::SubarrayShape {
            expected,
            actual: subarray_bytes.len() as u64,
        }
        .into());
    }

    let mut field_ids = Vec::with_capacity(field_names.len());
    for name in field_names {
        let id = field_ids_lookup(&schema, name)?;
        field_ids.push(id);
    }
    if let Some(condition) = &condition {
        for name in condition.fields() {
            let id = field_ids_lookup(&schema, name)?;
            if schema.is_coords_field(id) {
                return Err(ReadError::UnknownField(name.to_owned()).into());
            }
        }
    }

    let names = field_names.iter().map(|s| s.to_string()).collect();
    tessera_common::coord_type_go!(
        schema.domain().datatype(),
        DT,
        {
            let subarray = coords_from_bytes::<DT>(subarray_bytes);
            let driver = Box::new(ArrayReadState::<DT>::new(
                schema, storage, config, layout, subarray, field_ids, condition, fragments,
                cancelled,
            )?);
            Ok(ReadQuery::new(driver, names))
        },
        Err(Error::Schema(
            crate::array::schema::SchemaError::BadDimensionType(schema.domain().datatype()),
        ))
    )
}

fn field_ids_lookup(schema: &ArraySchema, name: &str) -> Result<usize> {
    if name == COORDS_NAME {
        return Ok(schema.attribute_num());
    }
    schema
        .field_id(name)
        .ok_or_else(|| ReadError::UnknownField(name.to_owned()).into())
}
