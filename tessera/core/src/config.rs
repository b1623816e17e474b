use serde::{Deserialize, Serialize};

fn default_write_buffer_size() -> u64 {
    64 * 1024 * 1024
}

fn default_segment_size() -> u64 {
    10 * 1024 * 1024
}

fn default_read_memory_budget() -> u64 {
    256 * 1024 * 1024
}

fn default_ratio_coords() -> f64 {
    0.5
}

fn default_ratio_tile_ranges() -> f64 {
    0.25
}

fn default_ratio_array_data() -> f64 {
    0.25
}

fn default_buffer_cache_size() -> u64 {
    tessera_storage::cache::DEFAULT_BUFFER_SIZE
}

fn default_dedup_sparse() -> bool {
    true
}

/// Engine tuning knobs. Every field has a default so a `Config` can be
/// deserialized from a partial document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// In-memory run budget of the external-sort write pipeline. When a run
    /// reaches this size it is sorted and spilled.
    pub write_buffer_size: u64,
    /// Approximate bytes fetched per tile-load I/O.
    pub segment_size: u64,
    /// Total in-memory budget of one read iteration.
    pub read_memory_budget: u64,
    /// Fraction of the read budget reserved for coordinate tiles.
    pub ratio_coords: f64,
    /// Fraction of the read budget reserved for queued unvisited tile ranges.
    pub ratio_tile_ranges: f64,
    /// Fraction of the read budget reserved for tile-offset metadata.
    pub ratio_array_data: f64,
    /// Threshold at which the write buffer cache hands a chunk to storage.
    pub buffer_cache_size: u64,
    /// Whether sparse reads suppress duplicate coordinates, keeping only the
    /// newest fragment's cell.
    pub dedup_sparse: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            write_buffer_size: default_write_buffer_size(),
            segment_size: default_segment_size(),
            read_memory_budget: default_read_memory_budget(),
            ratio_coords: default_ratio_coords(),
            ratio_tile_ranges: default_ratio_tile_ranges(),
            ratio_array_data: default_ratio_array_data(),
            buffer_cache_size: default_buffer_cache_size(),
            dedup_sparse: default_dedup_sparse(),
        }
    }
}

impl Config {
    pub fn coords_budget(&self) -> u64 {
        (self.read_memory_budget as f64 * self.ratio_coords) as u64
    }

    pub fn tile_ranges_budget(&self) -> u64 {
        (self.read_memory_budget as f64 * self.ratio_tile_ranges) as u64
    }

    pub fn array_data_budget(&self) -> u64 {
        (self.read_memory_budget as f64 * self.ratio_array_data) as u64
    }
}
