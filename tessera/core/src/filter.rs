use std::io::{Read, Write};
use std::ops::Range;

use thiserror::Error;
use varint_rs::{VarintReader, VarintWriter};

use tessera_common::datatype::Datatype;
use tessera_common::physical_type_go;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid discriminant for {}: {0}", std::any::type_name::<Compressor>())]
    InvalidDiscriminant(u64),
    #[error("Compressor {0:?} cannot encode datatype {1}")]
    IncompatibleDatatype(Compressor, Datatype),
    #[error("Tile payload corrupt: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for FilterError {
    fn from(e: std::io::Error) -> Self {
        FilterError::Corrupt(e.to_string())
    }
}

/// The compressor applied to tile payloads of one attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[repr(u8)]
pub enum Compressor {
    #[default]
    None = 0,
    Gzip = 1,
    /// Delta-of-delta coding of integral values, zig-zag varint encoded.
    /// Schema validation rejects it for real-typed attributes and coordinates.
    DoubleDelta = 2,
}

impl From<Compressor> for u8 {
    fn from(value: Compressor) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Compressor {
    type Error = FilterError;
    fn try_from(value: u8) -> Result<Self, FilterError> {
        match value {
            0 => Ok(Compressor::None),
            1 => Ok(Compressor::Gzip),
            2 => Ok(Compressor::DoubleDelta),
            _ => Err(FilterError::InvalidDiscriminant(value as u64)),
        }
    }
}

/// One attribute's filter pipeline. Tile bytes enter and leave as opaque
/// buffers; the engine never interprets filtered bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterPipeline {
    pub compressor: Compressor,
    pub level: i32,
}

impl FilterPipeline {
    pub fn new(compressor: Compressor, level: i32) -> Self {
        FilterPipeline { compressor, level }
    }

    /// Filters an unfiltered tile payload for disk.
    pub fn filter(&self, datatype: Datatype, bytes: &[u8]) -> Result<Vec<u8>, FilterError> {
        match self.compressor {
            Compressor::None => Ok(bytes.to_vec()),
            Compressor::Gzip => {
                let level = if (0..=9).contains(&self.level) {
                    flate2::Compression::new(self.level as u32)
                } else {
                    flate2::Compression::default()
                };
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
                encoder.write_all(bytes)?;
                Ok(encoder.finish()?)
            }
            Compressor::DoubleDelta => double_delta_encode(datatype, bytes),
        }
    }

    /// Restores a tile payload read from disk.
    ///
    /// `byte_ranges` names the spans of the unfiltered payload the caller
    /// will touch (the tile loader maps cell slabs to bytes). A codec that
    /// can seek skips the rest and leaves it zeroed; gzip and double-delta
    /// cannot seek and decode fully. Callers must not cache a tile restored
    /// with a partial hint through a seekable codec — see
    /// [FilterPipeline::is_selective].
    pub fn unfilter(
        &self,
        datatype: Datatype,
        bytes: &[u8],
        byte_ranges: Option<&[Range<u64>]>,
    ) -> Result<Vec<u8>, FilterError> {
        match self.compressor {
            Compressor::None => match byte_ranges {
                None => Ok(bytes.to_vec()),
                Some(ranges) => {
                    let mut out = vec![0u8; bytes.len()];
                    for r in ranges {
                        let start = (r.start as usize).min(bytes.len());
                        let end = (r.end as usize).min(bytes.len());
                        out[start..end].copy_from_slice(&bytes[start..end]);
                    }
                    Ok(out)
                }
            },
            Compressor::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(bytes);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            Compressor::DoubleDelta => double_delta_decode(datatype, bytes),
        }
    }

    /// Whether [FilterPipeline::unfilter] honors a partial `byte_ranges`
    /// hint by skipping the rest of the payload. Tiles restored this way
    /// are only valid within the hinted spans.
    pub fn is_selective(&self) -> bool {
        matches!(self.compressor, Compressor::None)
    }
}

fn check_integral(datatype: Datatype) -> Result<(), FilterError> {
    if !datatype.is_integral_type() && datatype != Datatype::Char {
        return Err(FilterError::IncompatibleDatatype(
            Compressor::DoubleDelta,
            datatype,
        ));
    }
    Ok(())
}

// The value stream is reinterpreted as i64 (bit-lossless for every integral
// width), then encoded as: varint count, zig-zag first value, zig-zag first
// delta, zig-zag deltas-of-deltas. All arithmetic wraps.
fn double_delta_encode(datatype: Datatype, bytes: &[u8]) -> Result<Vec<u8>, FilterError> {
    check_integral(datatype)?;
    let values = physical_type_go!(datatype, DT, {
        let size = std::mem::size_of::<DT>();
        if bytes.len() % size != 0 {
            return Err(FilterError::Corrupt(format!(
                "tile of {} bytes is not a whole number of {datatype} values",
                bytes.len()
            )));
        }
        bytes
            .chunks_exact(size)
            .map(|c| widen_le(c))
            .collect::<Vec<i64>>()
    });

    let mut out = Vec::with_capacity(values.len() + 8);
    out.write_u64_varint(values.len() as u64)?;
    if let Some(&first) = values.first() {
        out.write_i64_varint(first)?;
    }
    if values.len() > 1 {
        let mut prev_delta = values[1].wrapping_sub(values[0]);
        out.write_i64_varint(prev_delta)?;
        for w in values.windows(2).skip(1) {
            let delta = w[1].wrapping_sub(w[0]);
            out.write_i64_varint(delta.wrapping_sub(prev_delta))?;
            prev_delta = delta;
        }
    }
    Ok(out)
}

fn double_delta_decode(datatype: Datatype, bytes: &[u8]) -> Result<Vec<u8>, FilterError> {
    check_integral(datatype)?;
    let mut reader = std::io::Cursor::new(bytes);
    let count = reader.read_u64_varint()? as usize;

    let mut values = Vec::with_capacity(count);
    if count > 0 {
        values.push(reader.read_i64_varint()?);
    }
    if count > 1 {
        let mut delta = reader.read_i64_varint()?;
        values.push(values[0].wrapping_add(delta));
        for _ in 2..count {
            delta = delta.wrapping_add(reader.read_i64_varint()?);
            let prev = *values.last().unwrap();
            values.push(prev.wrapping_add(delta));
        }
    }

    Ok(physical_type_go!(datatype, DT, {
        let mut out = Vec::with_capacity(count * std::mem::size_of::<DT>());
        for v in values {
            narrow_le::<DT>(v, &mut out);
        }
        out
    }))
}

fn widen_le(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn narrow_le<T>(v: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes()[..std::mem::size_of::<T>()]);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn double_delta_rejects_floats() {
        let p = FilterPipeline::new(Compressor::DoubleDelta, -1);
        assert!(matches!(
            p.filter(Datatype::Float64, &[0u8; 8]),
            Err(FilterError::IncompatibleDatatype(_, _))
        ));
    }

    #[test]
    fn selective_unfilter_skips_outside_ranges() {
        let p = FilterPipeline::new(Compressor::None, -1);
        let bytes: Vec<u8> = (1..=16).collect();
        let out = p
            .unfilter(Datatype::UInt8, &bytes, Some(&[4..8, 12..16]))
            .unwrap();
        assert_eq!(bytes.len(), out.len());
        assert_eq!(&bytes[4..8], &out[4..8]);
        assert_eq!(&bytes[12..16], &out[12..16]);
        assert!(out[..4].iter().all(|b| *b == 0));
        assert!(out[8..12].iter().all(|b| *b == 0));
    }

    #[test]
    fn non_seekable_codecs_decode_fully_under_a_hint() {
        let values: Vec<i64> = (0..32).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let gz = FilterPipeline::new(Compressor::Gzip, 6);
        assert!(!gz.is_selective());
        let filtered = gz.filter(Datatype::Int64, &bytes).unwrap();
        assert_eq!(
            bytes,
            gz.unfilter(Datatype::Int64, &filtered, Some(&[0..8])).unwrap()
        );

        let dd = FilterPipeline::new(Compressor::DoubleDelta, -1);
        assert!(!dd.is_selective());
        let filtered = dd.filter(Datatype::Int64, &bytes).unwrap();
        assert_eq!(
            bytes,
            dd.unfilter(Datatype::Int64, &filtered, Some(&[0..8])).unwrap()
        );
    }

    #[test]
    fn double_delta_shrinks_arithmetic_sequences() {
        let values: Vec<i64> = (0..1000).map(|i| 7 * i + 3).collect();
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let p = FilterPipeline::new(Compressor::DoubleDelta, -1);
        let filtered = p.filter(Datatype::Int64, &bytes).unwrap();
        assert!(filtered.len() < bytes.len() / 4);
        assert_eq!(bytes, p.unfilter(Datatype::Int64, &filtered, None).unwrap());
    }

    proptest! {
        #[test]
        fn gzip_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let p = FilterPipeline::new(Compressor::Gzip, 6);
            let filtered = p.filter(Datatype::UInt8, &bytes).unwrap();
            prop_assert_eq!(bytes, p.unfilter(Datatype::UInt8, &filtered, None).unwrap());
        }

        #[test]
        fn double_delta_roundtrip_u16(values in proptest::collection::vec(any::<u16>(), 0..512)) {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let p = FilterPipeline::new(Compressor::DoubleDelta, -1);
            let filtered = p.filter(Datatype::UInt16, &bytes).unwrap();
            prop_assert_eq!(bytes, p.unfilter(Datatype::UInt16, &filtered, None).unwrap());
        }

        #[test]
        fn double_delta_roundtrip_i64(values in proptest::collection::vec(any::<i64>(), 0..512)) {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            let p = FilterPipeline::new(Compressor::DoubleDelta, -1);
            let filtered = p.filter(Datatype::Int64, &bytes).unwrap();
            prop_assert_eq!(bytes, p.unfilter(Datatype::Int64, &filtered, None).unwrap());
        }
    }
}
