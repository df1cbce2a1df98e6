//! Great-circle distance helpers.
//!
//! The tree works on angular distances between (lat, lon) pairs in radians;
//! conversion to miles happens only when results leave the index.

use geo::{Distance, HaversineMeasure, Point};

use crate::models::Coordinates;

/// Mean Earth radius in miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Central angle between two (lat, lon) radian pairs.
#[inline]
pub fn angular_distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dlat = b[0] - a[0];
    let dlon = b[1] - a[1];
    let h = (dlat / 2.0).sin().powi(2) + a[0].cos() * b[0].cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.clamp(0.0, 1.0).sqrt().asin()
}

/// Great-circle distance in miles between two degree coordinates.
pub fn great_circle_miles(a: Coordinates, b: Coordinates, earth_radius_miles: f64) -> f64 {
    HaversineMeasure::new(earth_radius_miles).distance(
        Point::new(a.lon(), a.lat()),
        Point::new(b.lon(), b.lat()),
    )
}

/// Unit vector on the sphere for a radian (lat, lon) pair.
pub(crate) fn to_unit_vector(p: [f64; 2]) -> [f64; 3] {
    let (lat, lon) = (p[0], p[1]);
    [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
}

/// Inverse of [`to_unit_vector`]; the input need not be normalized.
pub(crate) fn from_vector(v: [f64; 3]) -> Option<[f64; 2]> {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm < 1e-12 {
        return None;
    }
    let lat = (v[2] / norm).clamp(-1.0, 1.0).asin();
    let lon = v[1].atan2(v[0]);
    Some([lat, lon])
}
