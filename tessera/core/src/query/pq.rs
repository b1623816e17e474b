use std::cmp::Ordering;

use tessera_common::array::Layout;
use tessera_common::datatype::physical::{BitsEq, BitsOrd};
use tessera_common::datatype::CoordType;

use crate::array::domain::DomainView;
use crate::fragment::read_state::ReadState;
use crate::Result;

/// A contiguous global-order coordinate range drawn from one tile of one
/// fragment, or from the empty-fragment sentinel (`fragment == None`) which
/// stands in for unwritten dense cells.
#[derive(Clone, Debug)]
pub struct FragmentCellRange<T> {
    pub fragment: Option<usize>,
    pub tile_pos: u64,
    /// Flat `[start_coords..., end_coords...]`, `2 * dim_num` values.
    pub range: Box<[T]>,
}

/// A [FragmentCellRange] enriched with the space-tile IDs of its endpoints,
/// the element type of the reconciliation priority queue.
#[derive(Clone, Debug)]
pub struct PQFragmentCellRange<T> {
    pub fragment: Option<usize>,
    pub tile_pos: u64,
    pub start: Box<[T]>,
    pub end: Box<[T]>,
    pub tile_id_l: u64,
    pub tile_id_r: u64,
}

impl<T: CoordType> PQFragmentCellRange<T> {
    pub fn import_from(fcr: &FragmentCellRange<T>, view: &DomainView<T>) -> Self {
        let dim_num = view.dim_num();
        let start: Box<[T]> = fcr.range[..dim_num].into();
        let end: Box<[T]> = fcr.range[dim_num..].into();
        let tile_id_l = view.tile_id(&start);
        let tile_id_r = view.tile_id(&end);
        PQFragmentCellRange {
            fragment: fcr.fragment,
            tile_pos: fcr.tile_pos,
            start,
            end,
            tile_id_l,
            tile_id_r,
        }
    }

    pub fn export_to(&self) -> FragmentCellRange<T> {
        let mut range = Vec::with_capacity(2 * self.start.len());
        range.extend_from_slice(&self.start);
        range.extend_from_slice(&self.end);
        FragmentCellRange {
            fragment: self.fragment,
            tile_pos: self.tile_pos,
            range: range.into(),
        }
    }

    pub fn dense(&self, read_states: &[ReadState<T>]) -> bool {
        match self.fragment {
            None => true,
            Some(f) => read_states[f].dense(),
        }
    }

    pub fn unary(&self) -> bool {
        self.start.bits_eq(&self.end)
    }

    /// Whether `self`'s range begins after `fcr`'s range ends.
    pub fn begins_after(&self, fcr: &Self, view: &DomainView<T>) -> bool {
        self.tile_id_l > fcr.tile_id_r
            || (self.tile_id_l == fcr.tile_id_r
                && matches!(
                    view.cell_order_cmp(&self.start, &fcr.end),
                    Ordering::Greater
                ))
    }

    /// Whether `self`'s range ends after `fcr`'s range ends.
    pub fn ends_after(&self, fcr: &Self, view: &DomainView<T>) -> bool {
        self.tile_id_r > fcr.tile_id_r
            || (self.tile_id_r == fcr.tile_id_r
                && matches!(view.cell_order_cmp(&self.end, &fcr.end), Ordering::Greater))
    }

    /// Whether `fcr` (a newer range) starts inside `self`, forcing a split.
    pub fn must_be_split(&self, fcr: &Self, view: &DomainView<T>) -> bool {
        fcr.fragment.is_some()
            && newer(fcr.fragment, self.fragment)
            && (fcr.tile_id_l < self.tile_id_r
                || (fcr.tile_id_l == self.tile_id_r
                    && matches!(
                        view.cell_order_cmp(&fcr.start, &self.end),
                        Ordering::Less | Ordering::Equal
                    )))
    }

    /// Whether `fcr` (an older range) starts inside `self`, so `self`
    /// shadows some prefix of it.
    pub fn must_trim(&self, fcr: &Self, view: &DomainView<T>) -> bool {
        self.fragment.is_some()
            && newer(self.fragment, fcr.fragment)
            && (fcr.tile_id_l > self.tile_id_l
                || (fcr.tile_id_l == self.tile_id_l
                    && matches!(
                        view.cell_order_cmp(&fcr.start, &self.start),
                        Ordering::Greater | Ordering::Equal
                    )))
            && (fcr.tile_id_l < self.tile_id_r
                || (fcr.tile_id_l == self.tile_id_r
                    && matches!(
                        view.cell_order_cmp(&fcr.start, &self.end),
                        Ordering::Less | Ordering::Equal
                    )))
    }

    /// Produces the portion of `fcr` that survives after `self`'s end: the
    /// trimmed range starts at the first of `fcr`'s cells past `self.end`.
    /// Returns `None` when nothing survives.
    pub fn trim(
        &self,
        fcr: &Self,
        view: &DomainView<T>,
        tile_domain: Option<&[T]>,
        read_states: &mut [ReadState<T>],
    ) -> Result<Option<Self>> {
        let mut trimmed = PQFragmentCellRange {
            fragment: fcr.fragment,
            tile_pos: fcr.tile_pos,
            start: self.end.clone(),
            end: fcr.end.clone(),
            tile_id_l: self.tile_id_r,
            tile_id_r: fcr.tile_id_r,
        };

        let retrieved = if trimmed.dense(read_states) {
            let domain = tile_domain.expect("dense trim requires a tile domain");
            let mut coords = trimmed.start.to_vec();
            let found = view.next_cell_coords(domain, &mut coords);
            trimmed.start = coords.into();
            found
        } else {
            let fragment = fcr.fragment.expect("sparse trim requires a fragment");
            match read_states[fragment].get_coords_after(fcr.tile_pos, &self.end)? {
                Some(coords) => {
                    trimmed.tile_id_l = view.tile_id(&coords);
                    trimmed.start = coords.into();
                    true
                }
                None => false,
            }
        };

        Ok(retrieved.then_some(trimmed))
    }

    /// Splits `self` at `fcr.start`: `self` keeps the head (ending just
    /// before `fcr.start`), the returned tail re-enters the queue.
    pub fn split(&mut self, fcr: &Self, view: &DomainView<T>, tile_domain: &[T]) -> Self {
        let tail = PQFragmentCellRange {
            fragment: self.fragment,
            tile_pos: self.tile_pos,
            start: fcr.start.clone(),
            end: self.end.clone(),
            tile_id_l: fcr.tile_id_l,
            tile_id_r: self.tile_id_r,
        };

        let mut head_end = fcr.start.to_vec();
        view.previous_cell_coords(tile_domain, &mut head_end);
        self.end = head_end.into();
        self.tile_id_r = view.tile_id(&self.end);
        tail
    }

    /// Splits a sparse multi-cell `self` around `fcr.start` using the
    /// fragment's actual coordinates: a left part to emit, an optional unary
    /// range at exactly `fcr.start` which re-enters the queue to compete on
    /// recency, and `self` shrunk to the right part. Returns
    /// `(left, unary, self_alive)`.
    pub fn split_to_3(
        &mut self,
        fcr: &Self,
        view: &DomainView<T>,
        read_states: &mut [ReadState<T>],
    ) -> Result<(Option<Self>, Option<Self>, bool)> {
        let fragment = self.fragment.expect("split_to_3 on the empty fragment");
        let (left_coords, target_exists, right_coords) = read_states[fragment]
            .get_enclosing_coords(self.tile_pos, &fcr.start, &self.start, &self.end)?;

        let left = left_coords.map(|coords| PQFragmentCellRange {
            fragment: self.fragment,
            tile_pos: self.tile_pos,
            start: self.start.clone(),
            tile_id_l: self.tile_id_l,
            tile_id_r: view.tile_id(&coords),
            end: coords.into(),
        });

        let unary = target_exists.then(|| PQFragmentCellRange {
            fragment: self.fragment,
            tile_pos: self.tile_pos,
            start: fcr.start.clone(),
            end: fcr.start.clone(),
            tile_id_l: fcr.tile_id_l,
            tile_id_r: fcr.tile_id_l,
        });

        let alive = match right_coords {
            Some(coords) => {
                self.tile_id_l = view.tile_id(&coords);
                self.start = coords.into();
                true
            }
            None => false,
        };

        Ok((left, unary, alive))
    }

    /// Key of the reconciliation queue's three-level comparator: space tile
    /// of the left endpoint, then its cell-order position, then recency.
    /// With duplicates suppressed the newest fragment pops first so it can
    /// shadow older ranges; with duplicates allowed the oldest pops first so
    /// equal coordinates come out in write order. The empty-fragment
    /// sentinel always pops last.
    pub fn heap_key(&self, view: &DomainView<T>, dups_allowed: bool) -> PQKey<T> {
        let coords: Box<[T]> = match view.cell_order() {
            Layout::RowMajor => self.start.clone(),
            Layout::ColumnMajor => self.start.iter().rev().copied().collect(),
        };
        let rank = match (self.fragment, dups_allowed) {
            (None, _) => u64::MAX,
            (Some(f), false) => u64::MAX - 1 - f as u64,
            (Some(f), true) => f as u64,
        };
        PQKey {
            tile_id_l: self.tile_id_l,
            coords,
            rank,
        }
    }
}

fn newer(a: Option<usize>, b: Option<usize>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Total-ordered key of the reconciliation queue; smallest pops first.
pub struct PQKey<T> {
    tile_id_l: u64,
    coords: Box<[T]>,
    rank: u64,
}

impl<T: CoordType> Ord for PQKey<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tile_id_l
            .cmp(&other.tile_id_l)
            .then_with(|| self.coords.bits_cmp(&other.coords))
            .then_with(|| self.rank.cmp(&other.rank))
    }
}

impl<T: CoordType> PartialOrd for PQKey<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: CoordType> PartialEq for PQKey<T> {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.cmp(other), Ordering::Equal)
    }
}

impl<T: CoordType> Eq for PQKey<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Dimension, Domain};
    use tessera_common::array::Layout;

    fn view_1d() -> DomainView<i64> {
        Domain::new(
            vec![Dimension::new("d", [1i64, 100]).unwrap()],
            Layout::RowMajor,
            Layout::RowMajor,
        )
        .unwrap()
        .view::<i64>()
        .unwrap()
    }

    fn pq(fragment: Option<usize>, start: i64, end: i64) -> PQFragmentCellRange<i64> {
        PQFragmentCellRange {
            fragment,
            tile_pos: 0,
            start: vec![start].into(),
            end: vec![end].into(),
            tile_id_l: 0,
            tile_id_r: 0,
        }
    }

    #[test]
    fn comparator_orders_by_start_then_recency() {
        let view = view_1d();
        let a = pq(Some(0), 3, 5);
        let b = pq(Some(1), 5, 7);
        assert!(a.heap_key(&view, false) < b.heap_key(&view, false));

        // equal starts: newer first when deduplicating
        let old = pq(Some(0), 5, 5);
        let new = pq(Some(1), 5, 5);
        assert!(new.heap_key(&view, false) < old.heap_key(&view, false));
        // and older first when duplicates are allowed
        assert!(old.heap_key(&view, true) < new.heap_key(&view, true));

        // the empty-fragment sentinel always loses ties
        let empty = pq(None, 5, 9);
        assert!(new.heap_key(&view, false) < empty.heap_key(&view, false));
        assert!(old.heap_key(&view, false) < empty.heap_key(&view, false));
    }

    #[test]
    fn trim_and_split_predicates() {
        let view = view_1d();
        let newer_range = pq(Some(1), 4, 8);
        let older_range = pq(Some(0), 6, 9);
        // the newer popped range shadows the older one's prefix
        assert!(newer_range.must_trim(&older_range, &view));
        assert!(!older_range.must_trim(&newer_range, &view));
        // an older popped range must be split around a newer overlap
        assert!(older_range.must_be_split(&newer_range, &view));
        assert!(!newer_range.must_be_split(&older_range, &view));
    }

    #[test]
    fn begins_and_ends_after() {
        let view = view_1d();
        let a = pq(Some(0), 3, 5);
        let b = pq(Some(1), 6, 7);
        assert!(b.begins_after(&a, &view));
        assert!(!a.begins_after(&b, &view));
        assert!(b.ends_after(&a, &view));
    }

    #[test]
    fn unary_detection() {
        assert!(pq(Some(0), 4, 4).unary());
        assert!(!pq(Some(0), 4, 5).unary());
    }
}
