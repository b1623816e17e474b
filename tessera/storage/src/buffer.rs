use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum BufferError {
    #[error("Buffer underflow: requested {requested} bytes at offset {offset} of {len}")]
    Underflow {
        requested: usize,
        offset: usize,
        len: usize,
    },
}

/// An append-only byte buffer with little-endian scalar writers.
/// All metadata serialization in the engine goes through this type so the
/// on-disk layout is fixed in exactly one place.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v)
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer { data }
    }
}

/// A cursored reader over a byte slice, the inverse of [Buffer].
pub struct ConstBuffer<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ConstBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ConstBuffer { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BufferError> {
        if self.remaining() < len {
            return Err(BufferError::Underflow {
                requested: len,
                offset: self.offset,
                len: self.data.len(),
            });
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferError> {
        Ok(i32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn scalar_roundtrip(a in any::<u32>(), b in any::<u64>(), c in any::<i32>(), d in any::<u8>()) {
            let mut w = Buffer::new();
            w.write_u32(a);
            w.write_u64(b);
            w.write_i32(c);
            w.write_u8(d);

            let mut r = ConstBuffer::new(w.as_slice());
            prop_assert_eq!(a, r.read_u32().unwrap());
            prop_assert_eq!(b, r.read_u64().unwrap());
            prop_assert_eq!(c, r.read_i32().unwrap());
            prop_assert_eq!(d, r.read_u8().unwrap());
            prop_assert_eq!(0, r.remaining());
        }
    }

    #[test]
    fn underflow() {
        let w = Buffer::from(vec![1u8, 2]);
        let mut r = ConstBuffer::new(w.as_slice());
        assert!(r.read_u32().is_err());
    }
}
