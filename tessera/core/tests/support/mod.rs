#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use cells::FieldData;
use tessera_core::query::{
    FieldBuffers, OutputBuffers, QueryCondition, ReadLayout, ReadStatus, WriteBuffers,
};
use tessera_core::storage_manager::OpenArray;
use tessera_core::{Config, StorageManager};
use tessera_storage::Uri;

/// A scratch engine over a temporary directory.
pub struct TestContext {
    pub sm: StorageManager,
    pub dir: tempfile::TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        TestContext {
            sm: StorageManager::new(config),
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn uri(&self, name: &str) -> Uri {
        Uri::from(self.dir.path()).join(name)
    }
}

/// Writes one fragment from columnar data: coordinates plus one column per
/// attribute in schema order.
pub fn write_fragment(
    sm: &StorageManager,
    array: &Arc<OpenArray>,
    coords: &FieldData,
    fields: &[&FieldData],
) -> Result<()> {
    let coords_bytes = coords.to_bytes();
    let field_bytes: Vec<(Vec<u8>, Option<Vec<u64>>)> = fields
        .iter()
        .map(|f| (f.to_bytes(), f.offsets()))
        .collect();
    let buffers = WriteBuffers {
        coords: &coords_bytes,
        fields: field_bytes
            .iter()
            .map(|(data, offsets)| match offsets {
                Some(offsets) => FieldBuffers::var(offsets, data),
                None => FieldBuffers::fixed(data),
            })
            .collect(),
    };
    sm.write(array, &buffers)?;
    Ok(())
}

/// Output capacities of one requested field for a chunked read.
pub struct FieldSpec {
    pub name: &'static str,
    pub data_capacity: usize,
    pub offsets_capacity: Option<usize>,
}

impl FieldSpec {
    pub fn fixed(name: &'static str, data_capacity: usize) -> Self {
        FieldSpec {
            name,
            data_capacity,
            offsets_capacity: None,
        }
    }

    pub fn var(name: &'static str, offsets_capacity: usize, data_capacity: usize) -> Self {
        FieldSpec {
            name,
            data_capacity,
            offsets_capacity: Some(offsets_capacity),
        }
    }
}

/// One field's accumulated result across read iterations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldResult {
    pub data: Vec<u8>,
    pub offsets: Option<Vec<u64>>,
}

/// Reads to completion, draining the query through buffers of the given
/// capacities and concatenating the chunks. Returns the results and the
/// number of submit calls it took.
pub fn read_to_end(
    sm: &StorageManager,
    array: &Arc<OpenArray>,
    layout: ReadLayout,
    subarray: &FieldData,
    specs: &[FieldSpec],
    condition: Option<QueryCondition>,
) -> Result<(Vec<FieldResult>, usize)> {
    let subarray_bytes = subarray.to_bytes();
    let names: Vec<&str> = specs.iter().map(|s| s.name).collect();
    let mut query = sm.read_begin(array, layout, &subarray_bytes, &names, condition)?;

    let mut results: Vec<FieldResult> = specs
        .iter()
        .map(|s| FieldResult {
            data: Vec::new(),
            offsets: s.offsets_capacity.map(|_| Vec::new()),
        })
        .collect();

    let mut rounds = 0usize;
    loop {
        rounds += 1;
        assert!(rounds < 10_000, "read is not making progress");

        let mut data: Vec<Vec<u8>> = specs.iter().map(|s| vec![0u8; s.data_capacity]).collect();
        let mut offsets: Vec<Option<Vec<u64>>> = specs
            .iter()
            .map(|s| s.offsets_capacity.map(|n| vec![0u64; n]))
            .collect();

        let mut outputs: Vec<OutputBuffers<'_>> = data
            .iter_mut()
            .zip(offsets.iter_mut())
            .map(|(data, offsets)| OutputBuffers {
                data: data.as_mut_slice(),
                offsets: offsets.as_mut().map(|o| o.as_mut_slice()),
                validity: None,
            })
            .collect();

        let (sizes, status) = query.submit(&mut outputs)?;
        drop(outputs);

        for (i, size) in sizes.iter().enumerate() {
            let base = results[i].data.len() as u64;
            results[i]
                .data
                .extend_from_slice(&data[i][..size.data_bytes as usize]);
            if let (Some(acc), Some(chunk)) = (&mut results[i].offsets, &offsets[i]) {
                acc.extend(chunk[..size.offsets_count as usize].iter().map(|o| o + base));
            }
        }

        if status == ReadStatus::Complete {
            return Ok((results, rounds));
        }
    }
}
