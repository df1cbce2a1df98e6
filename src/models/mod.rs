//! Core data models for distance enrichment.

pub mod listing;
pub mod point;
pub mod reference;

pub use listing::{EnrichedListing, Listing};
pub use point::{Coordinates, GeoPoint};
pub use reference::{Fingerprint, ReferenceSet, Scope};
