use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use tessera_common::array::Layout;
use tessera_common::datatype::physical::{BitsEq, BitsOrd};
use tessera_common::datatype::{CoordType, Datatype, Error as DatatypeError, PhysicalType};

use crate::array::dimension::Dimension;
use crate::array::schema::SchemaError;

/// The relationship of an overlap region to the second input of
/// [DomainView::subarray_overlap].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Overlap {
    /// The inputs do not intersect.
    None,
    /// The intersection covers the second input entirely.
    Full,
    /// The intersection is a strict subset forming one contiguous run of
    /// cells in cell order, letting readers skip per-cell filtering.
    PartialContiguous,
    /// The intersection is a strict subset spanning multiple runs.
    PartialNonContiguous,
}

/// An ordered set of dimensions of a common type, plus the tile and cell
/// orders. This is the layout authority of the array.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Domain {
    dimensions: Vec<Dimension>,
    tile_order: Layout,
    cell_order: Layout,
}

impl Domain {
    pub fn new(
        dimensions: Vec<Dimension>,
        tile_order: Layout,
        cell_order: Layout,
    ) -> Result<Self, SchemaError> {
        if dimensions.is_empty() {
            return Err(SchemaError::NoDimensions);
        }
        let datatype = dimensions[0].datatype();
        if dimensions.iter().any(|d| d.datatype() != datatype) {
            return Err(SchemaError::HeterogeneousDimensions);
        }
        let with_extent = dimensions
            .iter()
            .filter(|d| d.constraints().has_tile_extent())
            .count();
        if with_extent != 0 && with_extent != dimensions.len() {
            return Err(SchemaError::PartialTileExtents);
        }
        Ok(Domain {
            dimensions,
            tile_order,
            cell_order,
        })
    }

    pub fn datatype(&self) -> Datatype {
        self.dimensions[0].datatype()
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn coords_size(&self) -> u64 {
        (self.dim_num() * self.datatype().size()) as u64
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn has_tile_extents(&self) -> bool {
        self.dimensions[0].constraints().has_tile_extent()
    }

    /// Builds the typed compute view used by the read and write paths.
    pub fn view<T: CoordType>(&self) -> Result<DomainView<T>, DatatypeError> {
        if !self.datatype().is_compatible_type::<T>() {
            return Err(DatatypeError::physical_type_incompatible::<T>(
                self.datatype(),
            ));
        }

        let dim_num = self.dim_num();
        let mut domain = Vec::with_capacity(2 * dim_num);
        let mut extents: Vec<T> = Vec::new();
        for dim in &self.dimensions {
            let bytes = dim.constraints().domain_bytes();
            domain.push(T::read_le(&bytes));
            domain.push(T::read_le(&bytes[std::mem::size_of::<T>()..]));
            if let Some(e) = dim.constraints().extent_bytes() {
                extents.push(T::read_le(&e));
            }
        }
        let tile_extents = if extents.is_empty() {
            None
        } else {
            Some(extents)
        };

        Ok(DomainView::new(
            domain,
            tile_extents,
            self.tile_order,
            self.cell_order,
        ))
    }
}

/// Typed, stride-precomputed projection of a [Domain]. Tile-ID and cell
/// position are flat dot products against tables computed once here.
#[derive(Clone, Debug)]
pub struct DomainView<T: CoordType> {
    dim_num: usize,
    tile_order: Layout,
    cell_order: Layout,
    /// `[lo, hi]` interleaved per dimension.
    domain: Vec<T>,
    tile_extents: Option<Vec<T>>,
    /// Tiles per dimension over the full domain.
    tiles_per_dim: Vec<u64>,
    tile_strides_row: Vec<u64>,
    tile_strides_col: Vec<u64>,
    cell_strides_row: Vec<u64>,
    cell_strides_col: Vec<u64>,
    cell_num_per_tile: u64,
}

pub(crate) fn strides(counts: &[u64]) -> (Vec<u64>, Vec<u64>) {
    let n = counts.len();
    let mut row = vec![1u64; n];
    for i in (0..n.saturating_sub(1)).rev() {
        row[i] = row[i + 1] * counts[i + 1];
    }
    let mut col = vec![1u64; n];
    for i in 1..n {
        col[i] = col[i - 1] * counts[i - 1];
    }
    (row, col)
}

impl<T: CoordType> DomainView<T> {
    fn new(
        domain: Vec<T>,
        tile_extents: Option<Vec<T>>,
        tile_order: Layout,
        cell_order: Layout,
    ) -> Self {
        let dim_num = domain.len() / 2;

        let (tiles_per_dim, cell_counts) = if let Some(extents) = &tile_extents {
            let tiles = (0..dim_num)
                .map(|d| domain[2 * d + 1].tile_idx(domain[2 * d], extents[d]) + 1)
                .collect::<Vec<_>>();
            let cells = extents
                .iter()
                .map(|e| num_traits::cast::<T, u64>(*e).unwrap_or(0))
                .collect::<Vec<_>>();
            (tiles, cells)
        } else {
            (vec![1u64; dim_num], vec![1u64; dim_num])
        };

        let (tile_strides_row, tile_strides_col) = strides(&tiles_per_dim);
        let (cell_strides_row, cell_strides_col) = strides(&cell_counts);
        let cell_num_per_tile = if tile_extents.is_some() {
            cell_counts.iter().product()
        } else {
            0
        };

        DomainView {
            dim_num,
            tile_order,
            cell_order,
            domain,
            tile_extents,
            tiles_per_dim,
            tile_strides_row,
            tile_strides_col,
            cell_strides_row,
            cell_strides_col,
            cell_num_per_tile,
        }
    }

    pub fn dim_num(&self) -> usize {
        self.dim_num
    }

    pub fn domain(&self) -> &[T] {
        &self.domain
    }

    pub fn tile_extents(&self) -> Option<&[T]> {
        self.tile_extents.as_deref()
    }

    pub fn has_tile_extents(&self) -> bool {
        self.tile_extents.is_some()
    }

    pub fn cell_order(&self) -> Layout {
        self.cell_order
    }

    pub fn tile_order(&self) -> Layout {
        self.tile_order
    }

    /// Cells per space tile; zero when the domain has no tile extents.
    pub fn cell_num_per_tile(&self) -> u64 {
        self.cell_num_per_tile
    }

    fn tile_strides(&self) -> &[u64] {
        match self.tile_order {
            Layout::RowMajor => &self.tile_strides_row,
            Layout::ColumnMajor => &self.tile_strides_col,
        }
    }

    fn cell_strides(&self) -> &[u64] {
        match self.cell_order {
            Layout::RowMajor => &self.cell_strides_row,
            Layout::ColumnMajor => &self.cell_strides_col,
        }
    }

    /// Per-dimension tile index of a coordinate tuple.
    pub fn tile_coords(&self, coords: &[T]) -> Vec<u64> {
        match &self.tile_extents {
            None => vec![0; self.dim_num],
            Some(extents) => (0..self.dim_num)
                .map(|d| coords[d].tile_idx(self.domain[2 * d], extents[d]))
                .collect(),
        }
    }

    /// Scalar tile ID of a coordinate tuple in tile order.
    pub fn tile_id(&self, coords: &[T]) -> u64 {
        if self.tile_extents.is_none() {
            return 0;
        }
        let strides = self.tile_strides();
        let extents = self.tile_extents.as_ref().unwrap();
        (0..self.dim_num)
            .map(|d| coords[d].tile_idx(self.domain[2 * d], extents[d]) * strides[d])
            .sum()
    }

    pub fn tile_id_from_tile_coords(&self, tile_coords: &[u64]) -> u64 {
        let strides = self.tile_strides();
        tile_coords
            .iter()
            .zip(strides)
            .map(|(c, s)| c * s)
            .sum()
    }

    /// Position of a coordinate tuple within its space tile, in cell order.
    pub fn cell_pos_in_tile(&self, coords: &[T]) -> u64 {
        let Some(extents) = &self.tile_extents else {
            return 0;
        };
        let strides = self.cell_strides();
        (0..self.dim_num)
            .map(|d| {
                let tile_idx = coords[d].tile_idx(self.domain[2 * d], extents[d]);
                let tile_lo = self.domain[2 * d]
                    + T::from(tile_idx).unwrap_or_else(T::zero) * extents[d];
                let in_tile = num_traits::cast::<T, u64>(coords[d] - tile_lo).unwrap_or(0);
                in_tile * strides[d]
            })
            .sum()
    }

    /// Lexicographic comparison in cell order. Equal coordinates compare
    /// `Equal`; callers break ties by fragment or run recency.
    pub fn cell_order_cmp(&self, a: &[T], b: &[T]) -> Ordering {
        match self.cell_order {
            Layout::RowMajor => {
                for d in 0..self.dim_num {
                    match a[d].bits_cmp(&b[d]) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                Ordering::Equal
            }
            Layout::ColumnMajor => {
                for d in (0..self.dim_num).rev() {
                    match a[d].bits_cmp(&b[d]) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                Ordering::Equal
            }
        }
    }

    /// Global-order comparison: tile IDs first, cell order to break ties.
    pub fn tile_cell_order_cmp(&self, a: &[T], b: &[T]) -> Ordering {
        self.tile_id(a)
            .cmp(&self.tile_id(b))
            .then_with(|| self.cell_order_cmp(a, b))
    }

    pub fn cell_in_subarray(&self, coords: &[T], subarray: &[T]) -> bool {
        (0..self.dim_num).all(|d| {
            coords[d].bits_ge(&subarray[2 * d]) && coords[d].bits_le(&subarray[2 * d + 1])
        })
    }

    /// Number of cells in an interleaved `[lo, hi]` box. Integer domains only.
    pub fn subarray_volume(&self, subarray: &[T]) -> u64 {
        (0..self.dim_num)
            .map(|d| {
                num_traits::cast::<T, i128>(subarray[2 * d + 1])
                    .zip(num_traits::cast::<T, i128>(subarray[2 * d]))
                    .map(|(hi, lo)| (hi - lo + 1).max(0) as u64)
                    .unwrap_or(0)
            })
            .product()
    }

    /// Intersects `a` and `b`, classifying the result relative to `b`.
    pub fn subarray_overlap(&self, a: &[T], b: &[T]) -> (Vec<T>, Overlap) {
        let mut overlap = Vec::with_capacity(2 * self.dim_num);
        for d in 0..self.dim_num {
            let lo = if a[2 * d].bits_gt(&b[2 * d]) {
                a[2 * d]
            } else {
                b[2 * d]
            };
            let hi = if a[2 * d + 1].bits_lt(&b[2 * d + 1]) {
                a[2 * d + 1]
            } else {
                b[2 * d + 1]
            };
            if lo.bits_gt(&hi) {
                return (Vec::new(), Overlap::None);
            }
            overlap.push(lo);
            overlap.push(hi);
        }

        if overlap.bits_eq(b) {
            return (overlap, Overlap::Full);
        }

        // A box is one contiguous cell-order run iff, walking dimensions from
        // slowest to fastest, a prefix is unary, one dimension is arbitrary,
        // and every faster dimension covers b entirely.
        let order: Vec<usize> = match self.cell_order {
            Layout::RowMajor => (0..self.dim_num).collect(),
            Layout::ColumnMajor => (0..self.dim_num).rev().collect(),
        };
        let mut k = 0;
        while k < order.len() {
            let d = order[k];
            if overlap[2 * d].bits_eq(&overlap[2 * d + 1]) {
                k += 1;
            } else {
                break;
            }
        }
        let contiguous = order.iter().skip(k + 1).all(|&d| {
            overlap[2 * d].bits_eq(&b[2 * d]) && overlap[2 * d + 1].bits_eq(&b[2 * d + 1])
        });

        if contiguous {
            (overlap, Overlap::PartialContiguous)
        } else {
            (overlap, Overlap::PartialNonContiguous)
        }
    }

    /// Expands an interleaved subarray outward to whole tile boundaries.
    pub fn expand_to_tiles(&self, subarray: &mut [T]) {
        let Some(extents) = &self.tile_extents else {
            return;
        };
        for d in 0..self.dim_num {
            let lo_idx = subarray[2 * d].tile_idx(self.domain[2 * d], extents[d]);
            let hi_idx = subarray[2 * d + 1].tile_idx(self.domain[2 * d], extents[d]);
            let lo = self.domain[2 * d] + T::from(lo_idx).unwrap_or_else(T::zero) * extents[d];
            let hi = self.domain[2 * d] + T::from(hi_idx + 1).unwrap_or_else(T::zero) * extents[d]
                - T::one();
            subarray[2 * d] = lo;
            subarray[2 * d + 1] = hi;
        }
    }

    /// The interleaved subarray covered by the space tile at `tile_coords`.
    pub fn tile_subarray(&self, tile_coords: &[u64]) -> Vec<T> {
        let Some(extents) = &self.tile_extents else {
            return self.domain.clone();
        };
        let mut out = Vec::with_capacity(2 * self.dim_num);
        for d in 0..self.dim_num {
            let lo = self.domain[2 * d]
                + T::from(tile_coords[d]).unwrap_or_else(T::zero) * extents[d];
            out.push(lo);
            out.push(lo + extents[d] - T::one());
        }
        out
    }

    /// Tile-index ranges (interleaved `[lo, hi]` per dimension) overlapped by
    /// an interleaved subarray, clamped to the domain's tile grid.
    pub fn subarray_tile_domain(&self, subarray: &[T]) -> Vec<u64> {
        let Some(extents) = &self.tile_extents else {
            return vec![0; 2 * self.dim_num];
        };
        let mut out = Vec::with_capacity(2 * self.dim_num);
        for d in 0..self.dim_num {
            let lo = subarray[2 * d].tile_idx(self.domain[2 * d], extents[d]);
            let hi = subarray[2 * d + 1].tile_idx(self.domain[2 * d], extents[d]);
            out.push(lo);
            out.push(hi.min(self.tiles_per_dim[d] - 1));
        }
        out
    }

    /// Odometer increment over tile indexes in tile order. Returns `false`
    /// when `coords` rolls past the end of `tile_domain`.
    pub fn next_tile_coords(&self, tile_domain: &[u64], coords: &mut [u64]) -> bool {
        odometer_increment_u64(self.tile_order, tile_domain, coords)
    }

    /// Odometer decrement over tile indexes, for reverse-order traversal.
    pub fn prev_tile_coords(&self, tile_domain: &[u64], coords: &mut [u64]) -> bool {
        let dim_num = coords.len();
        let walk = dim_walk(self.tile_order, dim_num);
        for (i, &d) in walk.iter().enumerate() {
            if coords[d] > tile_domain[2 * d] {
                coords[d] -= 1;
                return true;
            }
            coords[d] = tile_domain[2 * d + 1];
            if i + 1 == walk.len() {
                return false;
            }
        }
        false
    }

    /// Odometer increment over cell coordinates in cell order within an
    /// interleaved subarray. Integer domains only.
    pub fn next_cell_coords(&self, subarray: &[T], coords: &mut [T]) -> bool {
        let order = dim_walk(self.cell_order, self.dim_num);
        for (i, &d) in order.iter().enumerate() {
            if coords[d].bits_lt(&subarray[2 * d + 1]) {
                coords[d] = coords[d] + T::one();
                return true;
            }
            coords[d] = subarray[2 * d];
            if i + 1 == order.len() {
                return false;
            }
        }
        false
    }

    /// Odometer decrement, the inverse of [Self::next_cell_coords].
    pub fn previous_cell_coords(&self, subarray: &[T], coords: &mut [T]) -> bool {
        let order = dim_walk(self.cell_order, self.dim_num);
        for (i, &d) in order.iter().enumerate() {
            if coords[d].bits_gt(&subarray[2 * d]) {
                coords[d] = coords[d] - T::one();
                return true;
            }
            coords[d] = subarray[2 * d + 1];
            if i + 1 == order.len() {
                return false;
            }
        }
        false
    }

    /// Position of a tile (by per-dimension index) within a tile-index box,
    /// in tile order.
    pub fn tile_pos_in(&self, tile_domain: &[u64], tile_coords: &[u64]) -> u64 {
        let counts: Vec<u64> = (0..self.dim_num)
            .map(|d| tile_domain[2 * d + 1] - tile_domain[2 * d] + 1)
            .collect();
        let (row, col) = strides(&counts);
        let strides = match self.tile_order {
            Layout::RowMajor => row,
            Layout::ColumnMajor => col,
        };
        (0..self.dim_num)
            .map(|d| (tile_coords[d] - tile_domain[2 * d]) * strides[d])
            .sum()
    }

    /// Number of tiles in a tile-index box.
    pub fn tile_num_in(&self, tile_domain: &[u64]) -> u64 {
        (0..self.dim_num)
            .map(|d| tile_domain[2 * d + 1] - tile_domain[2 * d] + 1)
            .product()
    }
}

/// Dimension visit order from fastest-varying to slowest.
fn dim_walk(order: Layout, dim_num: usize) -> Vec<usize> {
    match order {
        Layout::RowMajor => (0..dim_num).rev().collect(),
        Layout::ColumnMajor => (0..dim_num).collect(),
    }
}

fn odometer_increment_u64(order: Layout, domain: &[u64], coords: &mut [u64]) -> bool {
    let dim_num = coords.len();
    let walk = dim_walk(order, dim_num);
    for (i, &d) in walk.iter().enumerate() {
        if coords[d] < domain[2 * d + 1] {
            coords[d] += 1;
            return true;
        }
        coords[d] = domain[2 * d];
        if i + 1 == walk.len() {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::array::dimension::Dimension;

    fn domain_4x4() -> Domain {
        Domain::new(
            vec![
                Dimension::new("r", ([1i32, 4], 2)).unwrap(),
                Dimension::new("c", ([1i32, 4], 2)).unwrap(),
            ],
            Layout::RowMajor,
            Layout::RowMajor,
        )
        .unwrap()
    }

    fn view_with(tile_order: Layout, cell_order: Layout) -> DomainView<i32> {
        Domain::new(
            vec![
                Dimension::new("r", ([1i32, 4], 2)).unwrap(),
                Dimension::new("c", ([1i32, 4], 2)).unwrap(),
            ],
            tile_order,
            cell_order,
        )
        .unwrap()
        .view::<i32>()
        .unwrap()
    }

    const ORDERS: [Layout; 2] = [Layout::RowMajor, Layout::ColumnMajor];

    #[test]
    fn tile_ids_row_major() {
        let view = domain_4x4().view::<i32>().unwrap();
        assert_eq!(0, view.tile_id(&[1, 1]));
        assert_eq!(0, view.tile_id(&[2, 2]));
        assert_eq!(1, view.tile_id(&[1, 3]));
        assert_eq!(2, view.tile_id(&[3, 1]));
        assert_eq!(3, view.tile_id(&[4, 4]));
        assert_eq!(4, view.cell_num_per_tile());
    }

    #[test]
    fn cell_pos_in_tile_row_major() {
        let view = domain_4x4().view::<i32>().unwrap();
        assert_eq!(0, view.cell_pos_in_tile(&[1, 1]));
        assert_eq!(1, view.cell_pos_in_tile(&[1, 2]));
        assert_eq!(2, view.cell_pos_in_tile(&[2, 1]));
        assert_eq!(3, view.cell_pos_in_tile(&[2, 2]));
        // same positions inside the (1,1) tile
        assert_eq!(0, view.cell_pos_in_tile(&[3, 3]));
        assert_eq!(3, view.cell_pos_in_tile(&[4, 4]));
    }

    #[test]
    fn global_order_cmp() {
        let view = domain_4x4().view::<i32>().unwrap();
        // (2,2) is in tile 0, (1,3) in tile 1
        assert_eq!(Ordering::Less, view.tile_cell_order_cmp(&[2, 2], &[1, 3]));
        assert_eq!(Ordering::Less, view.cell_order_cmp(&[1, 3], &[2, 2]));
        assert_eq!(Ordering::Equal, view.cell_order_cmp(&[2, 2], &[2, 2]));
    }

    #[test]
    fn overlap_kinds() {
        let view = domain_4x4().view::<i32>().unwrap();
        let tile = view.tile_subarray(&[0, 0]);
        assert_eq!(vec![1, 2, 1, 2], tile);

        let (o, kind) = view.subarray_overlap(&[1, 4, 1, 4], &tile);
        assert_eq!(Overlap::Full, kind);
        assert_eq!(tile, o);

        // one full row of the tile is contiguous in row-major
        let (o, kind) = view.subarray_overlap(&[2, 2, 1, 4], &tile);
        assert_eq!(Overlap::PartialContiguous, kind);
        assert_eq!(vec![2, 2, 1, 2], o);

        // one full column is not
        let (_, kind) = view.subarray_overlap(&[1, 4, 2, 2], &tile);
        assert_eq!(Overlap::PartialNonContiguous, kind);

        let (_, kind) = view.subarray_overlap(&[3, 4, 3, 4], &tile);
        assert_eq!(Overlap::None, kind);
    }

    #[test]
    fn expand_to_tiles() {
        let view = domain_4x4().view::<i32>().unwrap();
        let mut subarray = vec![2, 3, 1, 2];
        view.expand_to_tiles(&mut subarray);
        assert_eq!(vec![1, 4, 1, 2], subarray);
    }

    #[test]
    fn tile_odometer() {
        let view = domain_4x4().view::<i32>().unwrap();
        let tile_domain = view.subarray_tile_domain(&[1, 4, 1, 4]);
        assert_eq!(vec![0, 1, 0, 1], tile_domain);

        let mut coords = vec![0u64, 0];
        let mut visited = vec![coords.clone()];
        while view.next_tile_coords(&tile_domain, &mut coords) {
            visited.push(coords.clone());
        }
        assert_eq!(
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]],
            visited
        );
    }

    #[test]
    fn cell_odometer_roundtrip() {
        let view = domain_4x4().view::<i32>().unwrap();
        let subarray = vec![2, 3, 2, 3];
        let mut coords = vec![2, 2];
        let mut forward = vec![coords.clone()];
        while view.next_cell_coords(&subarray, &mut coords) {
            forward.push(coords.clone());
        }
        assert_eq!(
            vec![vec![2, 2], vec![2, 3], vec![3, 2], vec![3, 3]],
            forward
        );

        let mut coords = vec![3, 3];
        let mut backward = vec![coords.clone()];
        while view.previous_cell_coords(&subarray, &mut coords) {
            backward.push(coords.clone());
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    proptest! {
        // the comparators define total orders: comparing in either
        // direction agrees, and only identical tuples compare equal
        #[test]
        fn comparators_are_total_orders(
            a in proptest::collection::vec(1i32..=4, 2),
            b in proptest::collection::vec(1i32..=4, 2),
        ) {
            for tile_order in ORDERS {
                for cell_order in ORDERS {
                    let view = view_with(tile_order, cell_order);

                    let cell = view.cell_order_cmp(&a, &b);
                    prop_assert_eq!(cell, view.cell_order_cmp(&b, &a).reverse());
                    prop_assert_eq!(cell == Ordering::Equal, a == b);
                    prop_assert_eq!(Ordering::Equal, view.cell_order_cmp(&a, &a));

                    let global = view.tile_cell_order_cmp(&a, &b);
                    prop_assert_eq!(
                        global,
                        view.tile_cell_order_cmp(&b, &a).reverse()
                    );
                    prop_assert_eq!(global == Ordering::Equal, a == b);
                }
            }
        }

        // walking coordinates in global order never decreases the tile ID
        #[test]
        fn tile_ids_monotone_along_global_order(
            a in proptest::collection::vec(1i32..=4, 2),
            b in proptest::collection::vec(1i32..=4, 2),
        ) {
            for tile_order in ORDERS {
                for cell_order in ORDERS {
                    let view = view_with(tile_order, cell_order);
                    if matches!(view.tile_cell_order_cmp(&a, &b), Ordering::Less) {
                        prop_assert!(view.tile_id(&a) <= view.tile_id(&b));
                    }
                }
            }
        }

        // the in-tile position respects the cell order within a tile
        #[test]
        fn cell_positions_follow_cell_order(
            a in proptest::collection::vec(1i32..=2, 2),
            b in proptest::collection::vec(1i32..=2, 2),
        ) {
            for cell_order in ORDERS {
                let view = view_with(Layout::RowMajor, cell_order);
                // both tuples lie in the first tile
                match view.cell_order_cmp(&a, &b) {
                    Ordering::Less => prop_assert!(
                        view.cell_pos_in_tile(&a) < view.cell_pos_in_tile(&b)
                    ),
                    Ordering::Greater => prop_assert!(
                        view.cell_pos_in_tile(&a) > view.cell_pos_in_tile(&b)
                    ),
                    Ordering::Equal => prop_assert_eq!(
                        view.cell_pos_in_tile(&a),
                        view.cell_pos_in_tile(&b)
                    ),
                }
            }
        }
    }

    #[test]
    fn sparse_without_extents_is_one_tile() {
        let domain = Domain::new(
            vec![Dimension::new("d", [1i64, 1000]).unwrap()],
            Layout::RowMajor,
            Layout::RowMajor,
        )
        .unwrap();
        let view = domain.view::<i64>().unwrap();
        assert_eq!(0, view.tile_id(&[1]));
        assert_eq!(0, view.tile_id(&[1000]));
        assert_eq!(0, view.cell_num_per_tile());
    }
}
