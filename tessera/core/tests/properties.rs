//! Law-style checks: idempotence, ordering, coverage, recency under
//! spills/compression, layouts, conditions, and fragment visibility.

mod support;

use anyhow::Result;
use cells::FieldData;

use tessera_common::array::{ArrayType, Layout, COORDS_NAME};
use tessera_common::datatype::Datatype;
use tessera_core::array::{ArraySchema, Attribute, Dimension, Domain};
use tessera_core::filter::Compressor;
use tessera_core::query::condition::EqualityOp;
use tessera_core::query::{QueryCondition, ReadLayout};
use tessera_core::Config;

use support::{read_to_end, write_fragment, FieldSpec, TestContext};

fn dense_6x6_schema(uri: &str) -> ArraySchema {
    let domain = Domain::new(
        vec![
            Dimension::new("row", ([0i64, 5], 3)).unwrap(),
            Dimension::new("col", ([0i64, 5], 2)).unwrap(),
        ],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    ArraySchema::new(
        uri,
        ArrayType::Dense,
        domain,
        vec![Attribute::new("a", Datatype::Int64).unwrap()],
        100,
    )
    .unwrap()
}

fn dense_6x6_cells() -> (Vec<i64>, Vec<i64>) {
    let mut coords = Vec::new();
    let mut a = Vec::new();
    for row in 0i64..6 {
        for col in 0i64..6 {
            coords.extend([row, col]);
            a.push(row * 6 + col);
        }
    }
    (coords, a)
}

#[test]
fn idempotent_reads() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("idempotent");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;
    let (coords, a) = dense_6x6_cells();
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a)],
    )?;

    let subarray = FieldData::from(vec![1i64, 4, 0, 5]);
    let spec = || vec![FieldSpec::fixed("a", 4096)];
    let first = read_to_end(&ctx.sm, &array, ReadLayout::Global, &subarray, &spec(), None)?.0;
    let second = read_to_end(&ctx.sm, &array, ReadLayout::Global, &subarray, &spec(), None)?.0;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn dense_coverage_and_global_order() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("coverage");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;
    let (coords, a) = dense_6x6_cells();
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a)],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![0i64, 5, 0, 5]),
        &[FieldSpec::fixed("a", 4096)],
        None,
    )?;
    let got = FieldData::from_le_bytes::<i64>(&results[0].data);
    assert_eq!(36, got.len());

    // the global order over 3x2 tiles of a row-major 6x6 array
    let mut expected = Vec::new();
    for tile_row in 0i64..2 {
        for tile_col in 0i64..3 {
            for row in tile_row * 3..tile_row * 3 + 3 {
                for col in tile_col * 2..tile_col * 2 + 2 {
                    expected.push(row * 6 + col);
                }
            }
        }
    }
    assert_eq!(expected, got);
    Ok(())
}

#[test]
fn unwritten_dense_cells_read_as_fill() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("fill");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;

    // only the top-left tile is written
    let mut coords = Vec::new();
    let mut a = Vec::new();
    for row in 0i64..3 {
        for col in 0i64..2 {
            coords.extend([row, col]);
            a.push(row * 6 + col);
        }
    }
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a)],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![0i64, 5, 0, 5]),
        &[FieldSpec::fixed("a", 4096)],
        None,
    )?;
    let got = FieldData::from_le_bytes::<i64>(&results[0].data);
    assert_eq!(36, got.len());
    assert_eq!(&[0i64, 1, 6, 7, 12, 13], &got[..6]);
    assert!(got[6..].iter().all(|v| *v == i64::MIN));
    Ok(())
}

#[test]
fn spilled_runs_merge_with_recency() -> Result<()> {
    // a tiny run budget forces several spills inside one fragment
    let mut config = Config::default();
    config.write_buffer_size = 256;
    let ctx = TestContext::with_config(config);
    let uri = ctx.uri("spills");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;

    // every cell is written twice within one fragment; the second write
    // carries value + 1000 and lands in newer runs, so it must win
    let (coords, a) = dense_6x6_cells();
    let mut all_coords = coords.clone();
    all_coords.extend_from_slice(&coords);
    let mut all_a = a.clone();
    all_a.extend(a.iter().map(|v| v + 1000));

    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(all_coords),
        &[&FieldData::from(all_a)],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![0i64, 5, 0, 5]),
        &[FieldSpec::fixed("a", 4096)],
        None,
    )?;
    let got = FieldData::from_le_bytes::<i64>(&results[0].data);
    assert_eq!(36, got.len());
    assert!(got.iter().all(|v| *v >= 1000), "older duplicates leaked");
    Ok(())
}

#[test]
fn compressed_attributes_roundtrip() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("compressed");
    let domain = Domain::new(
        vec![Dimension::new("d", ([1i64, 64], 8)).unwrap()],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    let schema = ArraySchema::new(
        uri.as_str(),
        ArrayType::Dense,
        domain,
        vec![
            Attribute::new("g", Datatype::Int64)
                .unwrap()
                .with_compressor(Compressor::Gzip, 6),
            Attribute::new("dd", Datatype::Int64)
                .unwrap()
                .with_compressor(Compressor::DoubleDelta, -1),
        ],
        100,
    )
    .unwrap();
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;

    let coords: Vec<i64> = (1..=64).collect();
    let values: Vec<i64> = (0..64).map(|i| i * 3).collect();
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(values.clone()), &FieldData::from(values.clone())],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 64]),
        &[FieldSpec::fixed("g", 4096), FieldSpec::fixed("dd", 4096)],
        None,
    )?;
    assert_eq!(values, FieldData::from_le_bytes::<i64>(&results[0].data));
    assert_eq!(values, FieldData::from_le_bytes::<i64>(&results[1].data));
    Ok(())
}

#[test]
fn row_major_layout_scatters() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("row_major");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;
    let (coords, a) = dense_6x6_cells();
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a.clone())],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::RowMajor,
        &FieldData::from(vec![0i64, 5, 0, 5]),
        &[FieldSpec::fixed("a", 36 * 8)],
        None,
    )?;
    // row-major over the subarray is exactly the write sweep
    assert_eq!(a, FieldData::from_le_bytes::<i64>(&results[0].data));

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::ColumnMajor,
        &FieldData::from(vec![0i64, 5, 0, 5]),
        &[FieldSpec::fixed("a", 36 * 8)],
        None,
    )?;
    let got = FieldData::from_le_bytes::<i64>(&results[0].data);
    let mut expected = Vec::new();
    for col in 0i64..6 {
        for row in 0i64..6 {
            expected.push(row * 6 + col);
        }
    }
    assert_eq!(expected, got);
    Ok(())
}

#[test]
fn reverse_global_order() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("reverse");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;
    let (coords, a) = dense_6x6_cells();
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a)],
    )?;

    let subarray = FieldData::from(vec![0i64, 5, 0, 5]);
    let forward = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &subarray,
        &[FieldSpec::fixed("a", 4096)],
        None,
    )?
    .0;
    let backward = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::GlobalReverse,
        &subarray,
        &[FieldSpec::fixed("a", 4096)],
        None,
    )?
    .0;

    let mut forward_values = FieldData::from_le_bytes::<i64>(&forward[0].data);
    let backward_values = FieldData::from_le_bytes::<i64>(&backward[0].data);
    forward_values.reverse();
    assert_eq!(forward_values, backward_values);
    Ok(())
}

#[test]
fn condition_filters_sparse_cells() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("condition");
    let domain = Domain::new(
        vec![Dimension::new("d", [1i64, 100]).unwrap()],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    let schema = ArraySchema::new(
        uri.as_str(),
        ArrayType::Sparse,
        domain,
        vec![Attribute::new("v", Datatype::Int64).unwrap()],
        100,
    )
    .unwrap();
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;

    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![1i64, 2, 3, 4, 5]),
        &[&FieldData::from(vec![10i64, 25, 30, 45, 50])],
    )?;

    let condition = QueryCondition::value("v", EqualityOp::Greater, 20i64)
        & QueryCondition::value("v", EqualityOp::Less, 50i64);
    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 100]),
        &[FieldSpec::fixed(COORDS_NAME, 1024), FieldSpec::fixed("v", 1024)],
        Some(condition),
    )?;

    assert_eq!(
        vec![2i64, 3, 4],
        FieldData::from_le_bytes::<i64>(&results[0].data)
    );
    assert_eq!(
        vec![25i64, 30, 45],
        FieldData::from_le_bytes::<i64>(&results[1].data)
    );
    Ok(())
}

#[test]
fn uncommitted_fragments_are_invisible_and_swept() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("uncommitted");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;

    // a write that is started but never finalized
    let (coords, a) = dense_6x6_cells();
    let coords_bytes = FieldData::from(coords).to_bytes();
    let a_bytes = FieldData::from(a).to_bytes();
    let mut query = ctx.sm.write_begin(&array)?;
    query.write(&tessera_core::query::WriteBuffers {
        coords: &coords_bytes,
        fields: vec![tessera_core::query::FieldBuffers::fixed(&a_bytes)],
    })?;
    drop(query);

    // reopening sees no fragments
    ctx.sm.array_close(&uri);
    let array = ctx.sm.array_open(&uri)?;
    assert!(array.fragments().is_empty());

    ctx.sm.cleanup(&uri)?;
    ctx.sm.array_close(&uri);
    let array = ctx.sm.array_open(&uri)?;
    assert!(array.fragments().is_empty());
    Ok(())
}

#[test]
fn non_empty_domain_unions_fragments() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("ned");
    let domain = Domain::new(
        vec![Dimension::new("d", [1i64, 100]).unwrap()],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    let schema = ArraySchema::new(
        uri.as_str(),
        ArrayType::Sparse,
        domain,
        vec![Attribute::new("v", Datatype::Int64).unwrap()],
        100,
    )
    .unwrap();
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;
    assert!(ctx.sm.non_empty_domain(&array).is_none());

    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![10i64, 20]),
        &[&FieldData::from(vec![1i64, 2])],
    )?;
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![5i64, 15]),
        &[&FieldData::from(vec![3i64, 4])],
    )?;

    let ned = ctx.sm.non_empty_domain(&array).unwrap();
    assert_eq!(vec![5i64, 20], FieldData::from_le_bytes::<i64>(&ned));
    Ok(())
}

#[test]
fn writes_outside_domain_are_rejected() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("out_of_domain");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;

    let coords_bytes = FieldData::from(vec![7i64, 0]).to_bytes();
    let a_bytes = FieldData::from(vec![1i64]).to_bytes();
    let mut query = ctx.sm.write_begin(&array)?;
    let err = query.write(&tessera_core::query::WriteBuffers {
        coords: &coords_bytes,
        fields: vec![tessera_core::query::FieldBuffers::fixed(&a_bytes)],
    });
    assert!(err.is_err());
    query.abort();
    Ok(())
}

#[test]
fn partial_tile_dense_write_is_rejected() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("partial_tile");
    ctx.sm.array_create(&uri, &dense_6x6_schema(uri.as_str()))?;
    let array = ctx.sm.array_open(&uri)?;

    // two cells cannot cover the 3x2 tile their bounding box expands to
    let coords_bytes = FieldData::from(vec![0i64, 0, 0, 1]).to_bytes();
    let a_bytes = FieldData::from(vec![1i64, 2]).to_bytes();
    let mut query = ctx.sm.write_begin(&array)?;
    query.write(&tessera_core::query::WriteBuffers {
        coords: &coords_bytes,
        fields: vec![tessera_core::query::FieldBuffers::fixed(&a_bytes)],
    })?;
    assert!(query.finalize().is_err());

    // the aborted fragment directory is gone
    ctx.sm.array_close(&uri);
    let array = ctx.sm.array_open(&uri)?;
    assert!(array.fragments().is_empty());
    Ok(())
}
