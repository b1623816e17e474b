use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::storage::{Storage, StorageError};
use crate::uri::Uri;

/// Default flush threshold, sized for object-store multipart chunks.
pub const DEFAULT_BUFFER_SIZE: u64 = 5 * 1024 * 1024;

/// Coalesces small writes into multipart-sized chunks per URI.
///
/// Writes accumulate in a per-URI buffer; once the buffer reaches the
/// threshold, the first `buffer_size` bytes are handed to the backing storage
/// and the remainder is carried over in full. `flush_file` writes whatever
/// remains and drops the entry, so the concatenation of chunks always equals
/// the concatenation of writes.
pub struct BufferCache {
    buffer_size: u64,
    file_buffers: Mutex<HashMap<Uri, Vec<u8>>>,
}

impl BufferCache {
    pub fn new(buffer_size: u64) -> Self {
        assert!(buffer_size > 0);
        BufferCache {
            buffer_size,
            file_buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn write_to_file(
        &self,
        storage: &dyn Storage,
        uri: &Uri,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let mut buffers = self.file_buffers.lock().expect("buffer cache poisoned");
        let buffer = buffers.entry(uri.clone()).or_default();
        buffer.extend_from_slice(bytes);

        let threshold = self.buffer_size as usize;
        while buffer.len() >= threshold {
            debug!("flushing {threshold} byte chunk to {uri}");
            storage.write(uri, &buffer[..threshold])?;
            buffer.drain(..threshold);
        }
        Ok(())
    }

    pub fn flush_file(
        &self,
        storage: &dyn Storage,
        uri: &Uri,
    ) -> Result<(), StorageError> {
        let remainder = {
            let mut buffers = self.file_buffers.lock().expect("buffer cache poisoned");
            buffers.remove(uri)
        };
        match remainder {
            Some(bytes) if !bytes.is_empty() => storage.write(uri, &bytes),
            Some(_) => Ok(()),
            None => Ok(()),
        }
    }

    /// Drops any buffered bytes for `uri` without writing them.
    pub fn discard(&self, uri: &Uri) {
        let mut buffers = self.file_buffers.lock().expect("buffer cache poisoned");
        buffers.remove(uri);
    }

    /// Bytes accepted for `uri` but not yet written to storage.
    pub fn pending(&self, uri: &Uri) -> u64 {
        let buffers = self.file_buffers.lock().expect("buffer cache poisoned");
        buffers.get(uri).map(|b| b.len() as u64).unwrap_or(0)
    }
}
