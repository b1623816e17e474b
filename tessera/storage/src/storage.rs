use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};

use log::warn;
use thiserror::Error;

use crate::uri::Uri;

/// Transient I/O failures are retried this many times before surfacing.
const IO_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(Uri),
    #[error("I/O error on '{uri}': {source}")]
    Io {
        uri: Uri,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(uri: &Uri, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(uri.clone())
        } else {
            StorageError::Io {
                uri: uri.clone(),
                source,
            }
        }
    }
}

/// The filesystem abstraction the engine calls into. Implementations must be
/// safe for concurrent use on distinct URIs; the engine serializes access to
/// any single URI it writes.
pub trait Storage: Send + Sync {
    /// Reads `len` bytes starting at `offset`. Short reads are errors.
    fn read(&self, uri: &Uri, offset: u64, len: u64) -> Result<Vec<u8>, StorageError>;

    /// Appends `bytes` to the object at `uri`, creating it if absent.
    fn write(&self, uri: &Uri, bytes: &[u8]) -> Result<(), StorageError>;

    /// Lists the immediate children of a directory.
    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError>;

    fn size(&self, uri: &Uri) -> Result<u64, StorageError>;

    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError>;

    /// Removes a file or directory tree.
    fn remove(&self, uri: &Uri) -> Result<(), StorageError>;

    fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError>;

    fn is_dir(&self, uri: &Uri) -> bool;

    fn is_file(&self, uri: &Uri) -> bool;

    /// Reads the entire object.
    fn read_all(&self, uri: &Uri) -> Result<Vec<u8>, StorageError> {
        let size = self.size(uri)?;
        self.read(uri, 0, size)
    }
}

/// Local filesystem backend over `std::fs`.
#[derive(Debug, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        LocalStorage
    }

    fn with_retry<T>(
        uri: &Uri,
        mut op: impl FnMut() -> std::io::Result<T>,
    ) -> Result<T, StorageError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted && attempt < IO_RETRIES => {
                    attempt += 1;
                    warn!("retrying interrupted I/O on {uri} (attempt {attempt})");
                }
                Err(e) => return Err(StorageError::io(uri, e)),
            }
        }
    }
}

impl Storage for LocalStorage {
    fn read(&self, uri: &Uri, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
        Self::with_retry(uri, || {
            let mut f = fs::File::open(uri.to_path())?;
            f.seek(SeekFrom::Start(offset))?;
            let mut out = vec![0u8; len as usize];
            f.read_exact(&mut out)?;
            Ok(out)
        })
    }

    fn write(&self, uri: &Uri, bytes: &[u8]) -> Result<(), StorageError> {
        Self::with_retry(uri, || {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(uri.to_path())?;
            f.write_all(bytes)
        })
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>, StorageError> {
        let entries = Self::with_retry(uri, || {
            fs::read_dir(uri.to_path())?.collect::<std::io::Result<Vec<_>>>()
        })?;
        let mut uris = entries
            .into_iter()
            .map(|e| Uri::from(e.path().as_path()))
            .collect::<Vec<_>>();
        uris.sort();
        Ok(uris)
    }

    fn size(&self, uri: &Uri) -> Result<u64, StorageError> {
        Self::with_retry(uri, || Ok(fs::metadata(uri.to_path())?.len()))
    }

    fn create_dir(&self, uri: &Uri) -> Result<(), StorageError> {
        Self::with_retry(uri, || fs::create_dir_all(uri.to_path()))
    }

    fn remove(&self, uri: &Uri) -> Result<(), StorageError> {
        Self::with_retry(uri, || {
            let path = uri.to_path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
        })
    }

    fn move_path(&self, from: &Uri, to: &Uri) -> Result<(), StorageError> {
        Self::with_retry(from, || fs::rename(from.to_path(), to.to_path()))
    }

    fn is_dir(&self, uri: &Uri) -> bool {
        uri.to_path().is_dir()
    }

    fn is_file(&self, uri: &Uri) -> bool {
        uri.to_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let base = Uri::from(dir.path());

        let sub = base.join("frag");
        storage.create_dir(&sub).unwrap();
        assert!(storage.is_dir(&sub));

        let file = sub.join("a.tdb");
        storage.write(&file, b"hello ").unwrap();
        storage.write(&file, b"tiles").unwrap();
        assert!(storage.is_file(&file));
        assert_eq!(11, storage.size(&file).unwrap());
        assert_eq!(b"hello tiles".to_vec(), storage.read_all(&file).unwrap());
        assert_eq!(b"tiles".to_vec(), storage.read(&file, 6, 5).unwrap());

        let listing = storage.ls(&sub).unwrap();
        assert_eq!(1, listing.len());
        assert_eq!("a.tdb", listing[0].file_name());

        let moved = sub.join("b.tdb");
        storage.move_path(&file, &moved).unwrap();
        assert!(!storage.is_file(&file));
        assert!(storage.is_file(&moved));

        storage.remove(&sub).unwrap();
        assert!(!storage.is_dir(&sub));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let uri = Uri::from(dir.path()).join("nope");
        assert!(matches!(
            storage.size(&uri),
            Err(StorageError::NotFound(_))
        ));
    }
}
