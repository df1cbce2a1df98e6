//! Landmark Distance - nearest city-center and landmark distances for listings
//!
//! Builds ball-tree indexes over reference coordinates, caches them on disk by
//! content fingerprint, and enriches dataset rows with great-circle distances.

pub mod balltree;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod error;
pub mod geocode;
pub mod models;

pub use balltree::{query_batch, QueryResult, SpatialIndex};
pub use cache::IndexCache;
pub use config::Config;
pub use enrich::{Enricher, Enrichment};
pub use error::{GeoError, LookupError, Result};
pub use models::{EnrichedListing, GeoPoint, Listing, ReferenceSet, Scope};
