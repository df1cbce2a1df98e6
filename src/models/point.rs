//! Validated geographic coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GeoError, Result};

/// A latitude/longitude pair in degrees, checked on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinates")]
pub struct Coordinates {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
struct RawCoordinates {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawCoordinates> for Coordinates {
    type Error = String;

    fn try_from(raw: RawCoordinates) -> std::result::Result<Self, Self::Error> {
        Coordinates::try_new(raw.lat, raw.lon)
            .ok_or_else(|| format!("invalid coordinate: lat={}, lon={}", raw.lat, raw.lon))
    }
}

impl Coordinates {
    /// Returns `None` for NaN, infinite or out-of-range values.
    pub fn try_new(lat: f64, lon: f64) -> Option<Self> {
        if is_valid(lat, lon) {
            Some(Self { lat, lon })
        } else {
            None
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// (lat, lon) in radians
    pub fn to_radians(&self) -> [f64; 2] {
        [self.lat.to_radians(), self.lon.to_radians()]
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

fn is_valid(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Named point used both as a reference (city center, landmark) and as a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeoPoint", into = "RawGeoPoint")]
pub struct GeoPoint {
    id: String,
    coords: Coordinates,
}

#[derive(Serialize, Deserialize)]
struct RawGeoPoint {
    id: String,
    lat: f64,
    lon: f64,
}

impl TryFrom<RawGeoPoint> for GeoPoint {
    type Error = GeoError;

    fn try_from(raw: RawGeoPoint) -> Result<Self> {
        GeoPoint::new(raw.id, raw.lat, raw.lon)
    }
}

impl From<GeoPoint> for RawGeoPoint {
    fn from(point: GeoPoint) -> Self {
        RawGeoPoint {
            id: point.id,
            lat: point.coords.lat,
            lon: point.coords.lon,
        }
    }
}

impl GeoPoint {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Result<Self> {
        let id = id.into();
        match Coordinates::try_new(lat, lon) {
            Some(coords) => Ok(Self { id, coords }),
            None => Err(GeoError::InvalidCoordinate { id, lat, lon }),
        }
    }

    pub fn from_coordinates(id: impl Into<String>, coords: Coordinates) -> Self {
        Self {
            id: id.into(),
            coords,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coordinates(&self) -> Coordinates {
        self.coords
    }

    pub fn latitude(&self) -> f64 {
        self.coords.lat
    }

    pub fn longitude(&self) -> f64 {
        self.coords.lon
    }
}
