//! Columnar cell containers for staging writes and checking read results in
//! integration tests.

use std::collections::HashMap;

use tessera_common::datatype::PhysicalType;

/// One field's column of cell values.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldData {
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    /// Var-sized cells as raw byte strings.
    VecUInt8(Vec<Vec<u8>>),
}

/// Applies an action to the typed vector inside a [FieldData], binding the
/// element type as `$DT`.
#[macro_export]
macro_rules! typed_field_data_go {
    ($field:expr, $DT:ident, $data:pat, $fixed:expr, $var:expr) => {{
        use $crate::FieldData;
        match $field {
            FieldData::UInt8($data) => {
                type $DT = u8;
                $fixed
            }
            FieldData::UInt16($data) => {
                type $DT = u16;
                $fixed
            }
            FieldData::UInt32($data) => {
                type $DT = u32;
                $fixed
            }
            FieldData::UInt64($data) => {
                type $DT = u64;
                $fixed
            }
            FieldData::Int8($data) => {
                type $DT = i8;
                $fixed
            }
            FieldData::Int16($data) => {
                type $DT = i16;
                $fixed
            }
            FieldData::Int32($data) => {
                type $DT = i32;
                $fixed
            }
            FieldData::Int64($data) => {
                type $DT = i64;
                $fixed
            }
            FieldData::Float32($data) => {
                type $DT = f32;
                $fixed
            }
            FieldData::Float64($data) => {
                type $DT = f64;
                $fixed
            }
            FieldData::VecUInt8($data) => {
                type $DT = u8;
                $var
            }
        }
    }};
}

impl FieldData {
    pub fn len(&self) -> usize {
        typed_field_data_go!(self, _DT, data, data.len(), data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The column as packed little-endian bytes (fixed-size fields) or the
    /// concatenated values (var-sized fields).
    pub fn to_bytes(&self) -> Vec<u8> {
        typed_field_data_go!(
            self,
            _DT,
            data,
            {
                let mut out = Vec::new();
                for v in data {
                    v.write_le(&mut out);
                }
                out
            },
            data.iter().flatten().copied().collect()
        )
    }

    /// Per-cell start offsets into [FieldData::to_bytes], for var fields.
    pub fn offsets(&self) -> Option<Vec<u64>> {
        if let FieldData::VecUInt8(data) = self {
            let mut offsets = Vec::with_capacity(data.len());
            let mut at = 0u64;
            for v in data {
                offsets.push(at);
                at += v.len() as u64;
            }
            Some(offsets)
        } else {
            None
        }
    }

    /// Decodes a fixed-size column back from packed little-endian bytes.
    pub fn from_le_bytes<T>(bytes: &[u8]) -> Vec<T>
    where
        T: PhysicalType,
    {
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(T::read_le)
            .collect()
    }

    /// Rebuilds var-sized cells from an offsets/values buffer pair.
    pub fn from_var_bytes(offsets: &[u64], values: &[u8]) -> Vec<Vec<u8>> {
        (0..offsets.len())
            .map(|i| {
                let start = offsets[i] as usize;
                let end = offsets
                    .get(i + 1)
                    .map(|o| *o as usize)
                    .unwrap_or(values.len());
                values[start..end].to_vec()
            })
            .collect()
    }
}

macro_rules! field_data_from_impls {
    ($($V:ident : $U:ty),+) => {
        $(
            impl From<Vec<$U>> for FieldData {
                fn from(value: Vec<$U>) -> Self {
                    FieldData::$V(value)
                }
            }
        )+
    }
}

field_data_from_impls!(UInt8: u8, UInt16: u16, UInt32: u32, UInt64: u64);
field_data_from_impls!(Int8: i8, Int16: i16, Int32: i32, Int64: i64);
field_data_from_impls!(Float32: f32, Float64: f64, VecUInt8: Vec<u8>);

impl From<Vec<&str>> for FieldData {
    fn from(value: Vec<&str>) -> Self {
        FieldData::VecUInt8(value.into_iter().map(|s| s.as_bytes().to_vec()).collect())
    }
}

/// A batch of cells keyed by field name.
///
/// # Panics
///
/// `new` panics if the fields do not all have the same number of cells.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cells {
    fields: HashMap<String, FieldData>,
}

impl Cells {
    pub fn new(fields: HashMap<String, FieldData>) -> Self {
        let mut expect_len: Option<usize> = None;
        for d in fields.values() {
            if let Some(expect_len) = expect_len {
                assert_eq!(d.len(), expect_len);
            } else {
                expect_len = Some(d.len())
            }
        }
        Cells { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields
            .values()
            .next()
            .map(FieldData::is_empty)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.fields.values().next().map(FieldData::len).unwrap_or(0)
    }

    pub fn fields(&self) -> &HashMap<String, FieldData> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> &FieldData {
        &self.fields[name]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_bytes_roundtrip() {
        let data = FieldData::from(vec![1i32, -2, 3]);
        let bytes = data.to_bytes();
        assert_eq!(12, bytes.len());
        assert_eq!(vec![1i32, -2, 3], FieldData::from_le_bytes::<i32>(&bytes));
    }

    #[test]
    fn var_bytes_roundtrip() {
        let data = FieldData::from(vec!["a", "", "ccc"]);
        let bytes = data.to_bytes();
        let offsets = data.offsets().unwrap();
        assert_eq!(vec![0u64, 1, 1], offsets);
        assert_eq!(
            vec![b"a".to_vec(), b"".to_vec(), b"ccc".to_vec()],
            FieldData::from_var_bytes(&offsets, &bytes)
        );
    }

    #[test]
    #[should_panic]
    fn mismatched_lengths_panic() {
        let mut fields = HashMap::new();
        fields.insert("a".to_owned(), FieldData::from(vec![1i32]));
        fields.insert("b".to_owned(), FieldData::from(vec![1i32, 2]));
        Cells::new(fields);
    }
}
