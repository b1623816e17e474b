use thiserror::Error;

use tessera_storage::buffer::BufferError;
use tessera_storage::StorageError;

pub use crate::array::schema::SchemaError;
pub use crate::filter::FilterError;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Coordinates lie outside the array domain at cell {cell}")]
    CoordinatesOutOfDomain { cell: u64 },
    #[error("Write buffers disagree on cell count: expected {expected}, field '{field}' has {actual}")]
    CellCountMismatch {
        field: String,
        expected: u64,
        actual: u64,
    },
    #[error("Field '{field}' requires {expected} buffers (offsets: {offsets}, validity: {validity})")]
    BufferShapeMismatch {
        field: String,
        expected: &'static str,
        offsets: bool,
        validity: bool,
    },
    #[error("A dense fragment must cover whole tiles: wrote {written} cells, tile-aligned bounding domain holds {expected}")]
    IncompleteDenseWrite { written: u64, expected: u64 },
    #[error("Cannot finalize a fragment with no cells")]
    EmptyFragment,
    #[error("Fragment was already finalized")]
    AlreadyFinalized,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Unknown field '{0}'")]
    UnknownField(String),
    #[error("Subarray has {actual} bytes, expected {expected}")]
    SubarrayShape { expected: u64, actual: u64 },
    #[error(
        "Memory budget of {budget} bytes cannot hold the minimum working set ({required} bytes)"
    )]
    OutOfMemory { budget: u64, required: u64 },
    #[error("Layout {0:?} is not supported for this query")]
    UnsupportedLayout(crate::query::ReadLayout),
    #[error("Dense fragments store no coordinates; remove '{}' from the field list", tessera_common::array::COORDS_NAME)]
    CoordinatesOnDenseRead,
    #[error("Condition error: {0}")]
    Condition(#[from] crate::query::condition::ConditionError),
    #[error("Output buffer for '{field}' must hold the full result ({required} bytes) in a sorted-layout read")]
    SortedLayoutBufferTooSmall { field: String, required: u64 },
    #[error("Output buffers for field '{field}' do not match its shape (var-sized needs offsets, nullable needs validity)")]
    OutputShape { field: String },
    #[error("Expected {expected} output buffer sets, found {actual}")]
    OutputCount { expected: usize, actual: usize },
    #[error("Query was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Datatype error: {0}")]
    Datatype(#[from] tessera_common::datatype::Error),
    #[error("Invalid layout: {0}")]
    Layout(#[from] tessera_common::array::LayoutError),
    #[error("Write error: {0}")]
    Write(#[from] WriteError),
    #[error("Read error: {0}")]
    Read(#[from] ReadError),
    #[error("Tile filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Metadata corrupt: {0}")]
    MetadataCorrupt(String),
    #[error("An array already exists at '{0}'")]
    ArrayExists(String),
}

impl From<BufferError> for Error {
    fn from(e: BufferError) -> Self {
        Error::MetadataCorrupt(e.to_string())
    }
}
