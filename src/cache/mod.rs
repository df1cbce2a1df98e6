//! On-disk index cache.
//!
//! Built indexes are persisted under the cache directory, one file per
//! reference set fingerprint, so repeated runs skip both index construction
//! and the geocoding that produced the reference coordinates.

mod index_cache;
mod store;

pub use index_cache::{CacheEntry, IndexCache, FORMAT_VERSION};
pub use store::ArtifactStore;
