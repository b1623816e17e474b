use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use tessera_common::coord_type_go;
use tessera_common::datatype::physical::BitsOrd;
use tessera_storage::buffer::Buffer;
use tessera_storage::{BufferCache, LocalStorage, Storage, Uri};

use crate::array::schema::ArraySchema;
use crate::config::Config;
use crate::fragment::metadata::{coords_from_bytes, coords_to_bytes, FragmentMetadata};
use crate::fragment::write_state::{new_write_driver, WriteDriver};
use crate::fragment::{COMMIT_FILE, FRAGMENT_METADATA_FILE};
use crate::query::read_state::{new_read_query, ReadQuery};
use crate::query::{QueryCondition, ReadLayout, WriteBuffers};
use crate::{Error, Result};

const ARRAY_METADATA_FILE: &str = "__array_metadata.tdb";

/// One fragment of an open array, newest last.
#[derive(Clone)]
pub struct FragmentEntry {
    pub name: String,
    pub uri: Uri,
    pub metadata: Arc<FragmentMetadata>,
}

/// A registered array: its schema and the committed fragments visible to
/// readers. Shared between every query on the array.
pub struct OpenArray {
    uri: Uri,
    schema: Arc<ArraySchema>,
    fragments: Mutex<Vec<FragmentEntry>>,
}

impl OpenArray {
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub fn fragments(&self) -> Vec<FragmentEntry> {
        self.fragments.lock().expect("open array poisoned").clone()
    }

    fn push_fragment(&self, entry: FragmentEntry) {
        let mut fragments = self.fragments.lock().expect("open array poisoned");
        fragments.push(entry);
        fragments.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// The engine context: owns the storage driver, the write buffer cache, and
/// the open-array registry. All state is explicit; there are no process-wide
/// globals.
pub struct StorageManager {
    config: Config,
    storage: Arc<dyn Storage>,
    cache: Arc<BufferCache>,
    open_arrays: Mutex<HashMap<String, Arc<OpenArray>>>,
    fragment_seq: AtomicU64,
    cancelled: Arc<AtomicBool>,
}

impl StorageManager {
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(BufferCache::new(config.buffer_cache_size));
        StorageManager {
            config,
            storage: Arc::new(LocalStorage::new()),
            cache,
            open_arrays: Mutex::new(HashMap::new()),
            fragment_seq: AtomicU64::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Self {
        let cache = Arc::new(BufferCache::new(config.buffer_cache_size));
        StorageManager {
            config,
            storage,
            cache,
            open_arrays: Mutex::new(HashMap::new()),
            fragment_seq: AtomicU64::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Requests cancellation of every in-flight query created from this
    /// context. Queries observe the flag between merge iterations.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }

    pub fn reset_cancellation(&self) {
        self.cancelled.store(false, AtomicOrdering::Relaxed);
    }

    /* ---------------- array lifecycle ---------------- */

    pub fn array_create(&self, uri: &Uri, schema: &ArraySchema) -> Result<()> {
        schema.check()?;
        if self.storage.is_dir(uri) {
            return Err(Error::ArrayExists(uri.to_string()));
        }
        self.storage.create_dir(uri)?;
        let mut buffer = Buffer::new();
        schema.serialize(&mut buffer);
        self.storage
            .write(&uri.join(ARRAY_METADATA_FILE), buffer.as_slice())?;
        debug!("created array at {uri}");
        Ok(())
    }

    /// Opens an array, caching it in the registry. The fragment list is the
    /// set of committed fragments at open time, newest last by name.
    pub fn array_open(&self, uri: &Uri) -> Result<Arc<OpenArray>> {
        {
            let registry = self.open_arrays.lock().expect("registry poisoned");
            if let Some(array) = registry.get(uri.as_str()) {
                return Ok(Arc::clone(array));
            }
        }

        let schema_bytes = self.storage.read_all(&uri.join(ARRAY_METADATA_FILE))?;
        let schema = Arc::new(ArraySchema::deserialize(&schema_bytes)?);

        let mut fragments = Vec::new();
        for child in self.storage.ls(uri)? {
            if !self.storage.is_dir(&child) {
                continue;
            }
            if !self.storage.is_file(&child.join(COMMIT_FILE)) {
                debug!("skipping uncommitted fragment {child}");
                continue;
            }
            let meta_bytes = self.storage.read_all(&child.join(FRAGMENT_METADATA_FILE))?;
            let metadata = Arc::new(FragmentMetadata::deserialize(
                &meta_bytes,
                &schema,
                schema.is_dense(),
            )?);
            fragments.push(FragmentEntry {
                name: child.file_name().to_owned(),
                uri: child,
                metadata,
            });
        }
        fragments.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("opened array {uri} with {} fragments", fragments.len());

        let array = Arc::new(OpenArray {
            uri: uri.clone(),
            schema,
            fragments: Mutex::new(fragments),
        });
        let mut registry = self.open_arrays.lock().expect("registry poisoned");
        Ok(Arc::clone(
            registry
                .entry(uri.as_str().to_owned())
                .or_insert(array),
        ))
    }

    /// Drops an array from the registry; queries holding it keep working.
    pub fn array_close(&self, uri: &Uri) {
        let mut registry = self.open_arrays.lock().expect("registry poisoned");
        registry.remove(uri.as_str());
    }

    /// Removes uncommitted fragment directories left behind by interrupted
    /// writes.
    pub fn cleanup(&self, uri: &Uri) -> Result<()> {
        for child in self.storage.ls(uri)? {
            if self.storage.is_dir(&child) && !self.storage.is_file(&child.join(COMMIT_FILE)) {
                warn!("sweeping uncommitted fragment {child}");
                self.storage.remove(&child)?;
            }
        }
        Ok(())
    }

    /// The union of the fragments' non-empty domains, as interleaved raw
    /// coordinate bytes, or `None` for an array with no fragments.
    pub fn non_empty_domain(&self, array: &OpenArray) -> Option<Vec<u8>> {
        let fragments = array.fragments();
        if fragments.is_empty() {
            return None;
        }
        coord_type_go!(
            array.schema().domain().datatype(),
            DT,
            {
                let mut union: Option<Vec<DT>> = None;
                for f in &fragments {
                    let domain = coords_from_bytes::<DT>(f.metadata.non_empty_domain());
                    union = Some(match union {
                        None => domain,
                        Some(mut u) => {
                            for d in 0..domain.len() / 2 {
                                if domain[2 * d].bits_lt(&u[2 * d]) {
                                    u[2 * d] = domain[2 * d];
                                }
                                if domain[2 * d + 1].bits_gt(&u[2 * d + 1]) {
                                    u[2 * d + 1] = domain[2 * d + 1];
                                }
                            }
                            u
                        }
                    });
                }
                union.map(|u| coords_to_bytes(&u))
            },
            None
        )
    }

    /* ---------------- queries ---------------- */

    fn next_fragment_name(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = self.fragment_seq.fetch_add(1, AtomicOrdering::Relaxed);
        format!("__{millis:013}_{seq:06}")
    }

    /// Starts a write, creating a new fragment directory.
    pub fn write_begin(&self, array: &Arc<OpenArray>) -> Result<WriteQuery> {
        let name = self.next_fragment_name();
        let fragment_uri = array.uri().join(&name);
        let driver = new_write_driver(
            Arc::clone(&self.storage),
            Arc::clone(&self.cache),
            Arc::clone(array.schema()),
            self.config.clone(),
            fragment_uri.clone(),
        )?;
        Ok(WriteQuery {
            array: Arc::clone(array),
            driver,
            name,
            fragment_uri,
            finalized: false,
        })
    }

    /// Convenience single-shot write.
    pub fn write(&self, array: &Arc<OpenArray>, buffers: &WriteBuffers<'_>) -> Result<()> {
        let mut query = self.write_begin(array)?;
        query.write(buffers)?;
        query.finalize()
    }

    /// Starts a read over the array's committed fragments.
    pub fn read_begin(
        &self,
        array: &Arc<OpenArray>,
        layout: ReadLayout,
        subarray: &[u8],
        fields: &[&str],
        condition: Option<QueryCondition>,
    ) -> Result<ReadQuery> {
        let fragments = array
            .fragments()
            .into_iter()
            .map(|f| (f.uri, f.metadata))
            .collect();
        new_read_query(
            Arc::clone(array.schema()),
            Arc::clone(&self.storage),
            self.config.clone(),
            layout,
            subarray,
            fields,
            condition,
            fragments,
            Arc::clone(&self.cancelled),
        )
    }
}

/// An in-progress write of one fragment. Stream cells with [WriteQuery::write]
/// and commit with [WriteQuery::finalize]; dropping without finalizing leaves
/// an uncommitted directory which [StorageManager::cleanup] sweeps.
pub struct WriteQuery {
    array: Arc<OpenArray>,
    driver: Box<dyn WriteDriver>,
    name: String,
    fragment_uri: Uri,
    finalized: bool,
}

impl WriteQuery {
    pub fn fragment_name(&self) -> &str {
        &self.name
    }

    pub fn write(&mut self, buffers: &WriteBuffers<'_>) -> Result<()> {
        self.driver.write(buffers)
    }

    /// Sorts, merges, and commits the fragment, making it visible to
    /// subsequent reads.
    pub fn finalize(mut self) -> Result<()> {
        let metadata = self.driver.finalize()?;
        self.finalized = true;
        self.array.push_fragment(FragmentEntry {
            name: std::mem::take(&mut self.name),
            uri: self.fragment_uri.clone(),
            metadata: Arc::new(metadata),
        });
        Ok(())
    }

    /// Abandons the write and removes the fragment directory.
    pub fn abort(mut self) {
        self.driver.abort();
        self.finalized = true;
    }
}

impl Drop for WriteQuery {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                "write of fragment {} dropped without finalize; directory left uncommitted",
                self.fragment_uri
            );
        }
    }
}
