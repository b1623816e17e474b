pub mod condition;
pub mod pq;
pub mod read_state;

pub use condition::QueryCondition;
pub use read_state::ReadQuery;

use crate::error::WriteError;
use crate::array::schema::ArraySchema;

/// Result layout of a read.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadLayout {
    /// Tile order, then cell order within each tile; the array's native
    /// layout and the only one that supports streaming incomplete reads.
    #[default]
    Global,
    /// Like [ReadLayout::Global] but traversing space tiles back to front.
    /// Dense fixed-size reads only.
    GlobalReverse,
    /// Row-major over the query subarray. Dense reads only; the output
    /// buffers must hold the entire result.
    RowMajor,
    /// Column-major over the query subarray, same restrictions as
    /// [ReadLayout::RowMajor].
    ColumnMajor,
}

/// Completion state of a read. `Incomplete` is not an error: the caller
/// drains the buffers and submits again to make progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadStatus {
    Complete,
    Incomplete,
}

/// One field's input buffers for a write.
#[derive(Clone, Copy, Debug)]
pub struct FieldBuffers<'a> {
    /// Fixed-size cell values back to back, or the var-sized values.
    pub data: &'a [u8],
    /// Var-sized only: per-cell start offsets into `data`.
    pub offsets: Option<&'a [u64]>,
    /// Nullable only: one byte per cell, nonzero = valid.
    pub validity: Option<&'a [u8]>,
}

impl<'a> FieldBuffers<'a> {
    pub fn fixed(data: &'a [u8]) -> Self {
        FieldBuffers {
            data,
            offsets: None,
            validity: None,
        }
    }

    pub fn var(offsets: &'a [u64], data: &'a [u8]) -> Self {
        FieldBuffers {
            data,
            offsets: Some(offsets),
            validity: None,
        }
    }

    pub fn with_validity(mut self, validity: &'a [u8]) -> Self {
        self.validity = Some(validity);
        self
    }

    /// The value bytes of cell `i`, for var-sized input.
    pub fn var_cell(&self, i: usize) -> &'a [u8] {
        let offsets = self.offsets.expect("var_cell on fixed-size buffers");
        let start = offsets[i] as usize;
        let end = offsets
            .get(i + 1)
            .map(|o| *o as usize)
            .unwrap_or(self.data.len());
        &self.data[start..end]
    }
}

/// A batch of cells presented to a write: parallel coordinate and attribute
/// buffers, attribute order matching the schema.
#[derive(Clone, Debug)]
pub struct WriteBuffers<'a> {
    pub coords: &'a [u8],
    pub fields: Vec<FieldBuffers<'a>>,
}

impl WriteBuffers<'_> {
    /// Validates buffer shapes against the schema and returns the cell count.
    pub fn cell_num(&self, schema: &ArraySchema) -> Result<u64, WriteError> {
        let coords_size = schema.coords_size();
        let cell_num = self.coords.len() as u64 / coords_size;
        if cell_num * coords_size != self.coords.len() as u64 {
            return Err(WriteError::CellCountMismatch {
                field: tessera_common::array::COORDS_NAME.to_owned(),
                expected: cell_num,
                actual: self.coords.len() as u64 / coords_size + 1,
            });
        }
        if self.fields.len() != schema.attribute_num() {
            return Err(WriteError::CellCountMismatch {
                field: "<attribute buffers>".to_owned(),
                expected: schema.attribute_num() as u64,
                actual: self.fields.len() as u64,
            });
        }

        for (id, field) in self.fields.iter().enumerate() {
            let attr = schema.attribute(id);
            if attr.is_var_sized() != field.offsets.is_some()
                || attr.is_nullable() != field.validity.is_some()
            {
                return Err(WriteError::BufferShapeMismatch {
                    field: attr.name().to_owned(),
                    expected: if attr.is_var_sized() {
                        "var-sized"
                    } else {
                        "fixed-size"
                    },
                    offsets: attr.is_var_sized(),
                    validity: attr.is_nullable(),
                });
            }
            let actual = match field.offsets {
                Some(offsets) => offsets.len() as u64,
                None => field.data.len() as u64 / attr.cell_size(),
            };
            if actual != cell_num
                || (field.offsets.is_none()
                    && field.data.len() as u64 != cell_num * attr.cell_size())
            {
                return Err(WriteError::CellCountMismatch {
                    field: attr.name().to_owned(),
                    expected: cell_num,
                    actual,
                });
            }
            if let Some(validity) = field.validity {
                if validity.len() as u64 != cell_num {
                    return Err(WriteError::CellCountMismatch {
                        field: attr.name().to_owned(),
                        expected: cell_num,
                        actual: validity.len() as u64,
                    });
                }
            }
        }
        Ok(cell_num)
    }
}

/// One field's output buffers for a read, following the result-buffer
/// contract: the engine fills the largest prefix of results that fits and
/// reports used sizes separately.
#[derive(Debug)]
pub struct OutputBuffers<'a> {
    /// Receives fixed-size values, or the var-sized values.
    pub data: &'a mut [u8],
    /// Var-sized only: receives per-cell byte offsets into `data`.
    pub offsets: Option<&'a mut [u64]>,
    /// Nullable only: receives one validity byte per cell.
    pub validity: Option<&'a mut [u8]>,
}

/// Bytes and entries used in an [OutputBuffers] after a read call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutputSizes {
    pub data_bytes: u64,
    pub offsets_count: u64,
    pub validity_bytes: u64,
}

impl OutputSizes {
    /// Cells contained in the output, given the field's shape.
    pub fn cell_count(&self, var: bool, cell_size: u64) -> u64 {
        if var {
            self.offsets_count
        } else {
            self.data_bytes / cell_size
        }
    }
}
