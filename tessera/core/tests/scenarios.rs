//! End-to-end write/read scenarios over both array types.

mod support;

use anyhow::Result;
use cells::FieldData;

use tessera_common::array::{ArrayType, Layout, COORDS_NAME};
use tessera_common::datatype::Datatype;
use tessera_core::array::{ArraySchema, Attribute, Dimension, Domain};
use tessera_core::query::ReadLayout;
use tessera_core::Config;

use support::{read_to_end, write_fragment, FieldSpec, TestContext};

/// 4x4 dense array of 2x2 tiles with two int32 attributes.
fn dense_4x4_schema(uri: &str) -> ArraySchema {
    let domain = Domain::new(
        vec![
            Dimension::new("row", ([1i32, 4], 2)).unwrap(),
            Dimension::new("col", ([1i32, 4], 2)).unwrap(),
        ],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    ArraySchema::new(
        uri,
        ArrayType::Dense,
        domain,
        vec![
            Attribute::new("a", Datatype::Int32).unwrap(),
            Attribute::new("b", Datatype::Int32).unwrap(),
        ],
        100,
    )
    .unwrap()
}

/// Coordinates and values of a full row-major sweep over a box.
fn dense_cells(rows: std::ops::RangeInclusive<i32>, cols: std::ops::RangeInclusive<i32>) -> (Vec<i32>, Vec<i32>, Vec<i32>) {
    let mut coords = Vec::new();
    let mut a = Vec::new();
    let mut b = Vec::new();
    for row in rows {
        for col in cols.clone() {
            coords.extend([row, col]);
            a.push(row * 10 + col);
            b.push(row * 100 + col);
        }
    }
    (coords, a, b)
}

#[test]
fn dense_two_attribute_subarray() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("dense_two_attr");
    let schema = dense_4x4_schema(uri.as_str());
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;

    let (coords, a, b) = dense_cells(1..=4, 1..=4);
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(a), &FieldData::from(b)],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![2i32, 3, 2, 3]),
        &[FieldSpec::fixed("a", 1024), FieldSpec::fixed("b", 1024)],
        None,
    )?;

    assert_eq!(
        vec![22i32, 23, 32, 33],
        FieldData::from_le_bytes::<i32>(&results[0].data)
    );
    assert_eq!(
        vec![202i32, 203, 302, 303],
        FieldData::from_le_bytes::<i32>(&results[1].data)
    );
    Ok(())
}

#[test]
fn dense_fragment_recency() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("dense_recency");
    let schema = dense_4x4_schema(uri.as_str());
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;

    // fragment 1: a = 0 everywhere
    let (coords, _, b) = dense_cells(1..=4, 1..=4);
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(vec![0i32; 16]), &FieldData::from(b)],
    )?;

    // fragment 2: a = 9 over rows 1..=2
    let (coords, _, b) = dense_cells(1..=2, 1..=4);
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(coords),
        &[&FieldData::from(vec![9i32; 8]), &FieldData::from(b)],
    )?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i32, 4, 1, 4]),
        &[FieldSpec::fixed("a", 1024)],
        None,
    )?;

    let a = FieldData::from_le_bytes::<i32>(&results[0].data);
    assert_eq!(16, a.len());
    // global order: tiles (rows 1-2) first, then tiles (rows 3-4)
    assert!(a[..8].iter().all(|v| *v == 9));
    assert!(a[8..].iter().all(|v| *v == 0));
    Ok(())
}

fn sparse_1d_schema(uri: &str) -> ArraySchema {
    let domain = Domain::new(
        vec![Dimension::new("d", [1i64, 1000]).unwrap()],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    ArraySchema::new(
        uri,
        ArrayType::Sparse,
        domain,
        vec![Attribute::new("v", Datatype::Int64).unwrap()],
        1000,
    )
    .unwrap()
}

fn write_sparse_pair(ctx: &TestContext, uri: &tessera_storage::Uri) -> Result<std::sync::Arc<tessera_core::storage_manager::OpenArray>> {
    let schema = sparse_1d_schema(uri.as_str());
    ctx.sm.array_create(uri, &schema)?;
    let array = ctx.sm.array_open(uri)?;

    // fragment A then fragment B, overlapping at coordinate 5
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![3i64, 5]),
        &[&FieldData::from(vec![10i64, 20])],
    )?;
    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![5i64, 7]),
        &[&FieldData::from(vec![99i64, 30])],
    )?;
    Ok(array)
}

#[test]
fn sparse_dedup_keeps_newest() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("sparse_dedup");
    let array = write_sparse_pair(&ctx, &uri)?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 10]),
        &[FieldSpec::fixed(COORDS_NAME, 1024), FieldSpec::fixed("v", 1024)],
        None,
    )?;

    assert_eq!(
        vec![3i64, 5, 7],
        FieldData::from_le_bytes::<i64>(&results[0].data)
    );
    assert_eq!(
        vec![10i64, 99, 30],
        FieldData::from_le_bytes::<i64>(&results[1].data)
    );
    Ok(())
}

#[test]
fn sparse_duplicates_in_write_order() -> Result<()> {
    let mut config = Config::default();
    config.dedup_sparse = false;
    let ctx = TestContext::with_config(config);
    let uri = ctx.uri("sparse_dups");
    let array = write_sparse_pair(&ctx, &uri)?;

    let (results, _) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 10]),
        &[FieldSpec::fixed(COORDS_NAME, 1024), FieldSpec::fixed("v", 1024)],
        None,
    )?;

    assert_eq!(
        vec![3i64, 5, 5, 7],
        FieldData::from_le_bytes::<i64>(&results[0].data)
    );
    assert_eq!(
        vec![10i64, 20, 99, 30],
        FieldData::from_le_bytes::<i64>(&results[1].data)
    );
    Ok(())
}

#[test]
fn incomplete_reassembly_matches_one_shot() -> Result<()> {
    let mut config = Config::default();
    config.dedup_sparse = false;
    let ctx = TestContext::with_config(config);
    let uri = ctx.uri("sparse_chunks");
    let array = write_sparse_pair(&ctx, &uri)?;

    let one_shot = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 10]),
        &[FieldSpec::fixed(COORDS_NAME, 1024), FieldSpec::fixed("v", 1024)],
        None,
    )?
    .0;

    // buffers sized for exactly two cells per call
    let (chunked, calls) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i64, 10]),
        &[FieldSpec::fixed(COORDS_NAME, 16), FieldSpec::fixed("v", 16)],
        None,
    )?;

    assert!(calls > 1);
    assert_eq!(one_shot, chunked);
    Ok(())
}

#[test]
fn var_sized_roundtrip_and_truncation() -> Result<()> {
    let ctx = TestContext::new();
    let uri = ctx.uri("var_roundtrip");
    let domain = Domain::new(
        vec![Dimension::new("d", [1i32, 5]).unwrap()],
        Layout::RowMajor,
        Layout::RowMajor,
    )
    .unwrap();
    let schema = ArraySchema::new(
        uri.as_str(),
        ArrayType::Sparse,
        domain,
        vec![Attribute::new("v", Datatype::Char).unwrap().var_sized()],
        100,
    )
    .unwrap();
    ctx.sm.array_create(&uri, &schema)?;
    let array = ctx.sm.array_open(&uri)?;

    write_fragment(
        &ctx.sm,
        &array,
        &FieldData::from(vec![1i32, 2, 3, 4, 5]),
        &[&FieldData::from(vec!["a", "bb", "", "dddd", "ee"])],
    )?;

    let (results, calls) = read_to_end(
        &ctx.sm,
        &array,
        ReadLayout::Global,
        &FieldData::from(vec![1i32, 5]),
        &[FieldSpec::var("v", 64, 1024)],
        None,
    )?;
    assert_eq!(1, calls);
    assert_eq!(Some(vec![0u64, 1, 3, 3, 7]), results[0].offsets);
    assert_eq!(b"abbddddee".to_vec(), results[0].data);

    // an offsets buffer for three entries truncates to the first three cells
    let subarray = FieldData::from(vec![1i32, 5]).to_bytes();
    let mut query = ctx
        .sm
        .read_begin(&array, ReadLayout::Global, &subarray, &["v"], None)?;
    let mut data = vec![0u8; 1024];
    let mut offsets = vec![0u64; 3];
    let (sizes, status) = query.submit(&mut [tessera_core::query::OutputBuffers {
        data: &mut data,
        offsets: Some(&mut offsets),
        validity: None,
    }])?;
    assert_eq!(tessera_core::query::ReadStatus::Incomplete, status);
    assert_eq!(3, sizes[0].offsets_count);
    assert_eq!(vec![0u64, 1, 3], offsets);
    assert_eq!(b"abb".to_vec(), data[..sizes[0].data_bytes as usize].to_vec());
    Ok(())
}
