//! Ball-tree spatial index over the haversine metric.
//!
//! Builds immutable nearest-neighbor indexes from reference sets and answers
//! batched queries in miles.

mod builder;
pub mod haversine;
mod index;
mod query;

pub use builder::{BallTreeBuilder, IndexBuilder};
pub use haversine::{great_circle_miles, EARTH_RADIUS_MILES};
pub use index::{BuildParams, Neighbor, SpatialIndex};
pub use query::{query_batch, QueryResult};
