pub mod buffer;
pub mod cache;
pub mod storage;
pub mod uri;

pub use buffer::{Buffer, ConstBuffer};
pub use cache::BufferCache;
pub use storage::{LocalStorage, Storage, StorageError};
pub use uri::Uri;
