//! Lookups for reference points.
//!
//! City centers come from a [`Geocoder`], landmarks from a
//! [`LandmarkSource`]. Results are persisted in a [`CoordinateStore`] and a
//! [`LandmarkStore`] so later runs skip the network.

mod landmarks;
mod nominatim;
mod overpass;
mod persist;
mod store;

use std::future::Future;

use crate::error::LookupError;
use crate::models::Coordinates;

pub use landmarks::{FetchReport, Landmark, LandmarkStore};
pub use nominatim::NominatimGeocoder;
pub use overpass::OverpassClient;
pub use store::{CoordinateStore, ResolveReport};

/// Resolves a place name (e.g. `"Austin, TX"`) to coordinates.
pub trait Geocoder: Send + Sync {
    fn resolve(&self, query: &str) -> impl Future<Output = Result<Coordinates, LookupError>> + Send;
}

/// Lists the landmarks inside one city.
pub trait LandmarkSource: Send + Sync {
    fn landmarks(
        &self,
        city: &str,
        state: &str,
    ) -> impl Future<Output = Result<Vec<Landmark>, LookupError>> + Send;
}
