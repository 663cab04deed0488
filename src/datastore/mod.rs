//! File metadata registry and prefix cache.

mod prefix_cache;
pub use prefix_cache::PrefixCache;

mod registry;
pub use registry::{check_filename, DataStore, FileEntry, FileInfo};
