//! Coordinate store: reference key → resolved coordinates.
//!
//! Failed lookups are remembered as `None` so later runs do not ask the
//! geocoder again; the map is persisted as a JSON object keyed by
//! `"City, ST"`.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use super::persist::{load_json, save_json};
use super::Geocoder;
use crate::error::{GeoError, LookupError, Result};
use crate::models::{Coordinates, GeoPoint, ReferenceSet, Scope};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CoordinateStore {
    entries: BTreeMap<String, Option<Coordinates>>,
}

/// Outcome of one [`CoordinateStore::resolve_all`] pass.
#[derive(Debug, Default)]
pub struct ResolveReport {
    /// Newly resolved by the geocoder
    pub resolved: usize,
    /// Already known (resolved or previously failed)
    pub cached: usize,
    pub failures: Vec<LookupError>,
}

impl CoordinateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted store; a missing file yields an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let Some(entries) = load_json::<BTreeMap<String, Option<Coordinates>>>(path)? else {
            info!("No coordinate cache at {}, starting empty", path.display());
            return Ok(Self::new());
        };
        let valid = entries.values().filter(|c| c.is_some()).count();
        info!(
            "Coordinate cache loaded: {} entries ({} valid)",
            entries.len(),
            valid
        );
        Ok(Self { entries })
    }

    /// Persist the store, replacing `path` atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        save_json(path, &self.entries)?;
        debug!("Saved {} coordinates to {}", self.entries.len(), path.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Coordinates> {
        self.entries.get(key).copied().flatten()
    }

    /// True if `key` was looked up before, successfully or not.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, coords: Coordinates) {
        self.entries.insert(key.into(), Some(coords));
    }

    pub fn record_failure(&mut self, key: impl Into<String>) {
        self.entries.insert(key.into(), None);
    }

    /// Drop remembered failures so the next pass retries them.
    pub fn forget_failures(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, coords| coords.is_some());
        before - self.entries.len()
    }

    /// Look up every key not already known.
    pub async fn resolve_all<G, I>(&mut self, geocoder: &G, keys: I) -> ResolveReport
    where
        G: Geocoder,
        I: IntoIterator<Item = String>,
    {
        let mut report = ResolveReport::default();
        for key in keys {
            if self.contains(&key) {
                report.cached += 1;
                continue;
            }
            match geocoder.resolve(&key).await {
                Ok(coords) => {
                    debug!("Resolved {} -> {}", key, coords);
                    self.insert(key, coords);
                    report.resolved += 1;
                }
                Err(e) => {
                    warn!("Lookup failed for {}: {}", key, e);
                    self.record_failure(key);
                    report.failures.push(e);
                }
            }
        }
        report
    }

    /// Build a reference set from the resolved subset of `keys`.
    ///
    /// Returns the set and the keys that had no coordinates. Fails with
    /// [`GeoError::NoReferences`] when nothing resolved.
    pub fn reference_set<'a, I>(&self, scope: Scope, keys: I) -> Result<(ReferenceSet, Vec<String>)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut points = Vec::new();
        let mut unresolved = Vec::new();
        for key in keys {
            match self.get(key) {
                Some(coords) => points.push(GeoPoint::from_coordinates(key, coords)),
                None => unresolved.push(key.to_string()),
            }
        }
        if points.is_empty() {
            return Err(GeoError::NoReferences);
        }
        Ok((ReferenceSet::new(scope, points), unresolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGeocoder {
        known: HashMap<String, Coordinates>,
        calls: AtomicUsize,
    }

    impl FakeGeocoder {
        fn new() -> Self {
            let mut known = HashMap::new();
            known.insert("Austin, TX".to_string(), Coordinates::try_new(30.2672, -97.7431).unwrap());
            known.insert("Dallas, TX".to_string(), Coordinates::try_new(32.7767, -96.7970).unwrap());
            Self {
                known,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Geocoder for FakeGeocoder {
        async fn resolve(&self, query: &str) -> std::result::Result<Coordinates, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.known
                .get(query)
                .copied()
                .ok_or_else(|| LookupError::NotFound(query.to_string()))
        }
    }

    fn keys() -> Vec<String> {
        vec![
            "Austin, TX".to_string(),
            "Dallas, TX".to_string(),
            "Atlantis, XX".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_failures_are_remembered() {
        let geocoder = FakeGeocoder::new();
        let mut store = CoordinateStore::new();

        let report = store.resolve_all(&geocoder, keys()).await;
        assert_eq!(report.resolved, 2);
        assert_eq!(report.failures, vec![LookupError::NotFound("Atlantis, XX".to_string())]);
        assert!(store.contains("Atlantis, XX"));
        assert!(store.get("Atlantis, XX").is_none());

        let report = store.resolve_all(&geocoder, keys()).await;
        assert_eq!(report.cached, 3);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);

        assert_eq!(store.forget_failures(), 1);
        assert!(!store.contains("Atlantis, XX"));
    }

    #[tokio::test]
    async fn test_second_run_reuses_saved_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("city_centers_cache.json");
        let geocoder = FakeGeocoder::new();

        let mut first = CoordinateStore::load(&path).unwrap();
        first.resolve_all(&geocoder, keys()).await;
        first.save(&path).unwrap();
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);

        let mut second = CoordinateStore::load(&path).unwrap();
        let report = second.resolve_all(&geocoder, keys()).await;
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.cached, 3);
        assert_eq!(report.resolved, 0);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_reference_set_skips_unresolved() {
        let geocoder = FakeGeocoder::new();
        let mut store = CoordinateStore::new();
        store.resolve_all(&geocoder, keys()).await;

        let names = keys();
        let (set, unresolved) = store
            .reference_set(Scope::Global, names.iter().map(String::as_str))
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(unresolved, vec!["Atlantis, XX".to_string()]);
    }

    #[test]
    fn test_nothing_resolved_is_fatal() {
        let mut store = CoordinateStore::new();
        store.record_failure("Atlantis, XX");
        let err = store.reference_set(Scope::Global, ["Atlantis, XX"]).unwrap_err();
        assert!(matches!(err, GeoError::NoReferences));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("city_centers.json");

        let mut store = CoordinateStore::new();
        store.insert("Austin, TX", Coordinates::try_new(30.2672, -97.7431).unwrap());
        store.record_failure("Atlantis, XX");
        store.save(&path).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(raw["Atlantis, XX"].is_null());
        assert_eq!(raw["Austin, TX"]["lat"], 30.2672);

        assert_eq!(CoordinateStore::load(&path).unwrap(), store);
        assert!(CoordinateStore::load(dir.path().join("missing.json")).unwrap().is_empty());
    }
}
