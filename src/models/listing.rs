//! Dataset rows consumed and produced by the enrichment driver.

use serde::{Deserialize, Serialize};

use super::{GeoPoint, Scope};
use crate::error::Result;

/// One apartment listing as supplied by the dataset loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub cityname: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl Listing {
    pub fn new(id: impl Into<String>, cityname: &str, state: &str, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            cityname: cityname.to_string(),
            state: state.to_string(),
            latitude: Some(lat),
            longitude: Some(lon),
            price: None,
            date: None,
        }
    }

    /// Key of the landmark scope this row belongs to
    pub fn city_key(&self) -> String {
        Scope::city_key(&self.cityname, &self.state)
    }

    /// The row's own location as a query point.
    pub fn query_point(&self) -> Result<GeoPoint> {
        GeoPoint::new(
            self.id.clone(),
            self.latitude.unwrap_or(f64::NAN),
            self.longitude.unwrap_or(f64::NAN),
        )
    }
}

/// A listing with the distance columns appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedListing {
    #[serde(flatten)]
    pub listing: Listing,
    pub dist_to_city_center: Option<f64>,
    pub dist_to_landmark: Option<f64>,
    pub nearest_landmark: Option<String>,
}

impl EnrichedListing {
    pub fn unenriched(listing: Listing) -> Self {
        Self {
            listing,
            dist_to_city_center: None,
            dist_to_landmark: None,
            nearest_landmark: None,
        }
    }

    /// True when both distances are present and strictly below `max_miles`.
    pub fn within_range(&self, max_miles: f64) -> bool {
        match (self.dist_to_city_center, self.dist_to_landmark) {
            (Some(center), Some(landmark)) => center < max_miles && landmark < max_miles,
            _ => false,
        }
    }
}
