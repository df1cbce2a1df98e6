//! Reference point sets and their content fingerprints.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh64::Xxh64;

use super::GeoPoint;

const GLOBAL_SCOPE_KEY: &str = "city_centers";

/// Which part of the dataset a reference set applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One set for the whole dataset (city centers)
    Global,
    /// One set per city (landmarks), keyed by `"City, ST"`
    City(String),
}

impl Scope {
    /// Build the `"City, ST"` key used to group landmarks.
    pub fn city_key(city: &str, state: &str) -> String {
        format!("{}, {}", city.trim(), state.trim())
    }

    pub fn city(city: &str, state: &str) -> Self {
        Scope::City(Self::city_key(city, state))
    }

    pub fn key(&self) -> &str {
        match self {
            Scope::Global => GLOBAL_SCOPE_KEY,
            Scope::City(key) => key,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Stable 64-bit content hash of a reference set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(Fingerprint)
    }

    /// Hash the scope key and the points sorted by (id, lat, lon).
    pub fn compute(scope: &Scope, points: &[GeoPoint]) -> Self {
        let mut sorted: Vec<(&str, u64, u64)> = points
            .iter()
            .map(|p| {
                (
                    p.id(),
                    canonical_bits(p.latitude()),
                    canonical_bits(p.longitude()),
                )
            })
            .collect();
        sorted.sort_unstable();

        let mut hasher = Xxh64::new(0);
        let key = scope.key().as_bytes();
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key);
        for (id, lat, lon) in sorted {
            hasher.update(&(id.len() as u64).to_le_bytes());
            hasher.update(id.as_bytes());
            hasher.update(&lat.to_le_bytes());
            hasher.update(&lon.to_le_bytes());
        }
        Fingerprint(hasher.digest())
    }
}

// -0.0 and 0.0 are the same coordinate
fn canonical_bits(value: f64) -> u64 {
    (value + 0.0).to_bits()
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Fingerprint::from_hex(&value).ok_or_else(|| format!("invalid fingerprint '{}'", value))
    }
}

/// Immutable collection of reference points for one scope.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    scope: Scope,
    points: Vec<GeoPoint>,
    fingerprint: Fingerprint,
}

impl ReferenceSet {
    pub fn new(scope: Scope, points: Vec<GeoPoint>) -> Self {
        let fingerprint = Fingerprint::compute(&scope, &points);
        Self {
            scope,
            points,
            fingerprint,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
