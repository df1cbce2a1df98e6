//! Landmark store: `"City, ST"` → landmarks fetched for that city.
//!
//! Persisted as a JSON object of `{"name", "lat", "lon"}` lists. A city whose
//! fetch failed is stored with an empty list and not asked for again.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::persist::{load_json, save_json};
use super::LandmarkSource;
use crate::error::{LookupError, Result};
use crate::models::{GeoPoint, ReferenceSet, Scope};

/// One point of interest; OSM nodes without a `name` tag keep `name: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl Landmark {
    /// Reference point for this landmark, `None` for invalid coordinates.
    ///
    /// Unnamed landmarks are identified by their coordinates.
    pub fn point(&self) -> Option<GeoPoint> {
        let id = match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("unnamed ({:.5}, {:.5})", self.lat, self.lon),
        };
        GeoPoint::new(id, self.lat, self.lon).ok()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LandmarkStore {
    entries: BTreeMap<String, Vec<Landmark>>,
}

/// Outcome of one [`LandmarkStore::fetch_all`] pass.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Cities fetched from the source
    pub fetched: usize,
    pub cached: usize,
    pub failures: Vec<LookupError>,
}

impl LandmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted store; a missing file yields an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let Some(entries) = load_json::<BTreeMap<String, Vec<Landmark>>>(path)? else {
            info!("No landmark cache at {}, starting empty", path.display());
            return Ok(Self::new());
        };
        let total: usize = entries.values().map(Vec::len).sum();
        info!("Landmark cache loaded: {} cities, {} landmarks", entries.len(), total);
        Ok(Self { entries })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        save_json(path, &self.entries)?;
        debug!("Saved landmarks for {} cities to {}", self.entries.len(), path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&[Landmark]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, landmarks: Vec<Landmark>) {
        self.entries.insert(key.into(), landmarks);
    }

    /// Drop cities with no landmarks so the next fetch asks again.
    pub fn forget_empty(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, landmarks| !landmarks.is_empty());
        before - self.entries.len()
    }

    /// Fetch every `(city, state)` pair not already known.
    pub async fn fetch_all<S, I>(&mut self, source: &S, cities: I) -> FetchReport
    where
        S: LandmarkSource,
        I: IntoIterator<Item = (String, String)>,
    {
        let mut report = FetchReport::default();
        for (city, state) in cities {
            let key = Scope::city_key(&city, &state);
            if self.contains(&key) {
                report.cached += 1;
                continue;
            }
            match source.landmarks(&city, &state).await {
                Ok(landmarks) => {
                    debug!("Fetched {} landmarks for {}", landmarks.len(), key);
                    self.insert(key, landmarks);
                    report.fetched += 1;
                }
                Err(e) => {
                    warn!("Landmark fetch failed for {}: {}", key, e);
                    self.insert(key, Vec::new());
                    report.failures.push(e);
                }
            }
        }
        report
    }

    /// One reference set per city, skipping landmarks with invalid coordinates.
    pub fn reference_sets(&self) -> HashMap<String, ReferenceSet> {
        let mut sets = HashMap::with_capacity(self.entries.len());
        let mut dropped = 0;
        for (key, landmarks) in &self.entries {
            let points: Vec<GeoPoint> = landmarks.iter().filter_map(Landmark::point).collect();
            dropped += landmarks.len() - points.len();
            sets.insert(key.clone(), ReferenceSet::new(Scope::City(key.clone()), points));
        }
        if dropped > 0 {
            warn!("Dropped {} landmarks with invalid coordinates", dropped);
        }
        sets
    }
}
