//! Build-or-load cache for spatial indexes keyed by reference set fingerprint.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ArtifactStore;
use crate::balltree::{IndexBuilder, SpatialIndex};
use crate::error::{GeoError, Result};
use crate::models::{Fingerprint, ReferenceSet, Scope};

/// Bumped whenever the on-disk layout of [`CacheEntry`] or the index changes.
pub const FORMAT_VERSION: u32 = 1;

const ENTRY_EXTENSION: &str = ".json";

/// One persisted index.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub format_version: u32,
    pub fingerprint: Fingerprint,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub index: SpatialIndex,
}

#[derive(Deserialize)]
struct EntryHeader {
    format_version: u32,
}

pub struct IndexCache {
    store: Option<ArtifactStore>,
    /// Indexes already loaded or built by this process
    memo: Mutex<HashMap<Fingerprint, Arc<SpatialIndex>>>,
    /// Serializes builds per fingerprint; an entry lives only while a
    /// caller holds or waits on it
    locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl IndexCache {
    /// Cache persisting entries under `cache_dir`.
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let store = ArtifactStore::open(cache_dir)?;
        info!("Index cache at {}", store.root().display());
        Ok(Self::with_store(Some(store)))
    }

    /// Cache that only memoizes in memory.
    pub fn disabled() -> Self {
        Self::with_store(None)
    }

    fn with_store(store: Option<ArtifactStore>) -> Self {
        Self {
            store,
            memo: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// File an entry for `reference_set` is stored in, if persistent.
    pub fn entry_path(&self, reference_set: &ReferenceSet) -> Option<PathBuf> {
        self.store
            .as_ref()
            .map(|store| store.path_for(&entry_name(reference_set.scope(), reference_set.fingerprint())))
    }

    /// Return the index for `reference_set`, building it only when no valid
    /// entry exists for its fingerprint.
    pub fn get_or_build(
        &self,
        reference_set: &ReferenceSet,
        builder: &dyn IndexBuilder,
    ) -> Result<Arc<SpatialIndex>> {
        let fingerprint = reference_set.fingerprint();
        if let Some(index) = self.memoized(fingerprint, builder) {
            return Ok(index);
        }

        let lock = Arc::clone(self.locks.lock().entry(fingerprint).or_default());
        let result = {
            let _guard = lock.lock();
            self.load_or_build(reference_set, builder)
        };
        self.release_lock(fingerprint, lock);
        result
    }

    fn load_or_build(&self, reference_set: &ReferenceSet, builder: &dyn IndexBuilder) -> Result<Arc<SpatialIndex>> {
        let fingerprint = reference_set.fingerprint();

        // another caller may have finished while we waited
        if let Some(index) = self.memoized(fingerprint, builder) {
            return Ok(index);
        }

        let name = entry_name(reference_set.scope(), fingerprint);
        if let Some(store) = &self.store {
            if let Some(index) = self.load_entry(store, &name, reference_set, builder) {
                debug!("Cache hit for {} ({})", reference_set.scope(), fingerprint);
                return Ok(self.remember(fingerprint, index));
            }
        }

        info!(
            "Building index for {} ({} points, fingerprint {})",
            reference_set.scope(),
            reference_set.len(),
            fingerprint
        );
        let index = builder.build(reference_set)?;

        if let Some(store) = &self.store {
            let entry = CacheEntry {
                format_version: FORMAT_VERSION,
                fingerprint,
                scope: reference_set.scope().clone(),
                created_at: Utc::now(),
                index,
            };
            match serde_json::to_vec(&entry)
                .map_err(GeoError::from)
                .and_then(|bytes| store.publish(&name, &bytes))
            {
                Ok(path) => debug!("Cached index at {}", path.display()),
                Err(e) => warn!("Failed to persist index for {}: {}", reference_set.scope(), e),
            }
            return Ok(self.remember(fingerprint, entry.index));
        }

        Ok(self.remember(fingerprint, index))
    }

    /// Delete entries whose fingerprint is not in `keep`, plus leftover
    /// temporary files. Files not named like an entry are left alone.
    /// Returns the number of entries removed.
    pub fn prune(&self, keep: &HashSet<Fingerprint>) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let temps = store.remove_stale_temps()?;
        if temps > 0 {
            debug!("Removed {} interrupted cache writes", temps);
        }

        let mut removed = 0;
        for name in store.entries()? {
            let Some(fingerprint) = fingerprint_from_name(&name) else {
                continue;
            };
            if !keep.contains(&fingerprint) && store.remove(&name)? {
                debug!("Pruned cache entry {}", name);
                removed += 1;
            }
        }
        info!("Pruned {} stale index cache entries", removed);
        Ok(removed)
    }

    /// Drop the map entry once no other caller holds a handle to it.
    fn release_lock(&self, fingerprint: Fingerprint, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(&fingerprint)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(&fingerprint);
        }
    }

    fn memoized(&self, fingerprint: Fingerprint, builder: &dyn IndexBuilder) -> Option<Arc<SpatialIndex>> {
        self.memo
            .lock()
            .get(&fingerprint)
            .filter(|index| *index.params() == builder.params())
            .cloned()
    }

    fn remember(&self, fingerprint: Fingerprint, index: SpatialIndex) -> Arc<SpatialIndex> {
        let index = Arc::new(index);
        self.memo.lock().insert(fingerprint, Arc::clone(&index));
        index
    }

    /// Any failure here means "absent": the caller rebuilds.
    fn load_entry(
        &self,
        store: &ArtifactStore,
        name: &str,
        reference_set: &ReferenceSet,
        builder: &dyn IndexBuilder,
    ) -> Option<SpatialIndex> {
        let bytes = match store.load(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not read cache entry {}: {}", name, e);
                return None;
            }
        };

        let header: EntryHeader = match serde_json::from_slice(&bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!("Discarding corrupt cache entry {}: {}", name, e);
                return None;
            }
        };
        if header.format_version != FORMAT_VERSION {
            warn!(
                "Discarding cache entry {} with format version {} (expected {})",
                name, header.format_version, FORMAT_VERSION
            );
            return None;
        }

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding corrupt cache entry {}: {}", name, e);
                return None;
            }
        };

        let fingerprint = reference_set.fingerprint();
        let consistent = entry.fingerprint == fingerprint
            && entry.index.fingerprint() == fingerprint
            && entry.scope == *reference_set.scope()
            && entry.index.len() == reference_set.len()
            && entry.index.is_well_formed();
        if !consistent {
            warn!("Discarding inconsistent cache entry {}", name);
            return None;
        }
        if *entry.index.params() != builder.params() {
            debug!("Cache entry {} was built with different parameters", name);
            return None;
        }

        Some(entry.index)
    }
}

fn safe_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\w\-]").expect("valid regex"))
}

/// `"{scope}-{fingerprint}.json"` with unsafe scope characters replaced.
fn entry_name(scope: &Scope, fingerprint: Fingerprint) -> String {
    let safe = safe_key_pattern().replace_all(scope.key(), "_");
    format!("{}-{}{}", safe, fingerprint, ENTRY_EXTENSION)
}

fn fingerprint_from_name(name: &str) -> Option<Fingerprint> {
    let stem = name.strip_suffix(ENTRY_EXTENSION)?;
    let (_, hex) = stem.rsplit_once('-')?;
    Fingerprint::from_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balltree::{query_batch, BallTreeBuilder, BuildParams};
    use crate::models::GeoPoint;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBuilder {
        inner: BallTreeBuilder,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingBuilder {
        fn new() -> Self {
            Self {
                inner: BallTreeBuilder::default(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IndexBuilder for CountingBuilder {
        fn params(&self) -> BuildParams {
            self.inner.params()
        }

        fn build(&self, reference_set: &ReferenceSet) -> Result<SpatialIndex> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.build(reference_set)
        }
    }

    fn point(id: &str, lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(id, lat, lon).unwrap()
    }

    fn austin() -> ReferenceSet {
        ReferenceSet::new(
            Scope::city("Austin", "TX"),
            vec![
                point("Capitol", 30.2747, -97.7404),
                point("Zilker Park", 30.2669, -97.7729),
                point("UT Tower", 30.2862, -97.7394),
            ],
        )
    }

    #[test]
    fn test_second_call_is_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path()).unwrap();
        let builder = CountingBuilder::new();

        cache.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);
        cache.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);
    }

    #[test]
    fn test_entry_survives_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder::new();

        let first = IndexCache::new(dir.path()).unwrap();
        first.get_or_build(&austin(), &builder).unwrap();
        assert!(first.entry_path(&austin()).unwrap().exists());

        let second = IndexCache::new(dir.path()).unwrap();
        second.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);
    }

    #[test]
    fn test_reordered_set_hits_same_entry() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder::new();
        let cache = IndexCache::new(dir.path()).unwrap();
        cache.get_or_build(&austin(), &builder).unwrap();

        let mut points = austin().points().to_vec();
        points.reverse();
        let reordered = ReferenceSet::new(Scope::city("Austin", "TX"), points);
        IndexCache::new(dir.path())
            .unwrap()
            .get_or_build(&reordered, &builder)
            .unwrap();
        assert_eq!(builder.calls(), 1);
    }

    #[test]
    fn test_changed_content_builds_new_entry() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder::new();
        let cache = IndexCache::new(dir.path()).unwrap();
        cache.get_or_build(&austin(), &builder).unwrap();

        let mut points = austin().points().to_vec();
        points.push(point("Barton Springs", 30.2640, -97.7713));
        let changed = ReferenceSet::new(Scope::city("Austin", "TX"), points);
        cache.get_or_build(&changed, &builder).unwrap();
        assert_eq!(builder.calls(), 2);
        assert_ne!(cache.entry_path(&austin()), cache.entry_path(&changed));
    }

    #[test]
    fn test_round_trip_answers_identically() {
        let dir = tempfile::tempdir().unwrap();
        let builder = BallTreeBuilder::default();
        let original = SpatialIndex::build(&austin()).unwrap();
        IndexCache::new(dir.path())
            .unwrap()
            .get_or_build(&austin(), &builder)
            .unwrap();

        let loaded = IndexCache::new(dir.path())
            .unwrap()
            .get_or_build(&austin(), &builder)
            .unwrap();

        let queries = vec![
            point("a", 30.2700, -97.7500),
            point("b", 30.2900, -97.7300),
            point("c", 30.2600, -97.7800),
        ];
        let expected = query_batch(&original, &queries);
        let actual = query_batch(&loaded, &queries);
        for (e, a) in expected.iter().zip(&actual) {
            assert_eq!(e.nearest_ref_id, a.nearest_ref_id);
            assert!((e.distance_miles - a.distance_miles).abs() < 1e-6);
        }
    }

    #[test]
    fn test_corrupt_entry_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder::new();
        let cache = IndexCache::new(dir.path()).unwrap();
        let path = cache.entry_path(&austin()).unwrap();
        fs::write(&path, b"{\"format_version\": 1, \"index\": [trunc").unwrap();

        cache.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);

        // the rebuilt entry replaced the corrupt one
        let fresh = IndexCache::new(dir.path()).unwrap();
        fresh.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);
    }

    #[test]
    fn test_version_mismatch_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder::new();
        IndexCache::new(dir.path())
            .unwrap()
            .get_or_build(&austin(), &builder)
            .unwrap();

        let cache = IndexCache::new(dir.path()).unwrap();
        let path = cache.entry_path(&austin()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        value["format_version"] = serde_json::json!(FORMAT_VERSION + 1);
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        cache.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 2);
    }

    #[test]
    fn test_concurrent_callers_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path()).unwrap();
        let builder = CountingBuilder {
            delay: Duration::from_millis(50),
            ..CountingBuilder::new()
        };
        let set = austin();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| cache.get_or_build(&set, &builder).unwrap());
            }
        });
        assert_eq!(builder.calls(), 1);
        assert!(cache.locks.lock().is_empty());
    }

    #[test]
    fn test_build_locks_are_released() {
        let cache = IndexCache::disabled();
        let builder = CountingBuilder::new();
        cache.get_or_build(&austin(), &builder).unwrap();

        let empty = ReferenceSet::new(Scope::city("Nowhere", "NV"), vec![]);
        assert!(cache.get_or_build(&empty, &builder).is_err());
        assert!(cache.locks.lock().is_empty());
    }

    #[test]
    fn test_disabled_cache_memoizes_only() {
        let cache = IndexCache::disabled();
        let builder = CountingBuilder::new();
        assert!(cache.entry_path(&austin()).is_none());
        cache.get_or_build(&austin(), &builder).unwrap();
        cache.get_or_build(&austin(), &builder).unwrap();
        assert_eq!(builder.calls(), 1);
    }

    #[test]
    fn test_empty_set_error_is_propagated_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path()).unwrap();
        let empty = ReferenceSet::new(Scope::city("Nowhere", "NV"), vec![]);
        assert!(cache.get_or_build(&empty, &BallTreeBuilder::default()).is_err());
        assert!(!cache.entry_path(&empty).unwrap().exists());
    }

    #[test]
    fn test_prune_keeps_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path()).unwrap();
        let builder = BallTreeBuilder::default();
        let live = austin();
        let stale = ReferenceSet::new(Scope::Global, vec![point("Austin, TX", 30.2672, -97.7431)]);
        cache.get_or_build(&live, &builder).unwrap();
        cache.get_or_build(&stale, &builder).unwrap();

        let keep: HashSet<Fingerprint> = [live.fingerprint()].into_iter().collect();
        assert_eq!(cache.prune(&keep).unwrap(), 1);
        assert!(cache.entry_path(&live).unwrap().exists());
        assert!(!cache.entry_path(&stale).unwrap().exists());
    }

    #[test]
    fn test_prune_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path()).unwrap();
        let lookups = dir.path().join("city_centers_cache.json");
        let spoofed = dir.path().join("x-+fffffffffffffff.json");
        fs::write(&lookups, b"{}").unwrap();
        fs::write(&spoofed, b"{}").unwrap();

        assert_eq!(cache.prune(&HashSet::new()).unwrap(), 0);
        assert!(lookups.exists());
        assert!(spoofed.exists());
    }

    #[test]
    fn test_entry_name_is_sanitized() {
        let fp = austin().fingerprint();
        let name = entry_name(&Scope::city("St. Louis", "MO"), fp);
        assert_eq!(name, format!("St__Louis__MO-{}.json", fp));
        assert_eq!(fingerprint_from_name(&name), Some(fp));
        assert_eq!(fingerprint_from_name("notes.txt"), None);
    }
}
