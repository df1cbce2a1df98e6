//! Enrichment driver: appends nearest city-center and landmark distances.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use super::{CancelToken, EnrichmentReport, RowError, ScopeError};
use crate::balltree::{query_batch, BallTreeBuilder, IndexBuilder};
use crate::cache::IndexCache;
use crate::config::Config;
use crate::error::{GeoError, Result};
use crate::models::{EnrichedListing, GeoPoint, Listing, ReferenceSet, Scope};

/// Reference data for one enrichment run.
pub struct References<'a> {
    pub city_centers: &'a ReferenceSet,
    /// Landmark sets keyed by `"City, ST"`
    pub landmarks_by_city: &'a HashMap<String, ReferenceSet>,
    /// Cities whose own center could not be geocoded. Cities absent from
    /// `city_centers` are treated the same way without being listed here.
    pub unresolved_cities: &'a HashSet<String>,
}

/// Enriched rows in input order plus the error report.
#[derive(Debug)]
pub struct Enrichment {
    pub rows: Vec<EnrichedListing>,
    pub report: EnrichmentReport,
}

impl Enrichment {
    /// Rows with both distances present and below `max_miles`.
    pub fn within_range(&self, max_miles: f64) -> impl Iterator<Item = &EnrichedListing> {
        self.rows.iter().filter(move |row| row.within_range(max_miles))
    }
}

pub struct Enricher {
    cache: Arc<IndexCache>,
    builder: Arc<dyn IndexBuilder>,
}

enum GroupOutcome {
    Done {
        city: String,
        hits: Vec<(usize, f64, String)>,
    },
    Missing {
        city: String,
        rows: Vec<usize>,
    },
    Failed {
        city: String,
        rows: usize,
        error: GeoError,
    },
    Cancelled {
        city: String,
    },
}

impl Enricher {
    pub fn new(config: &Config) -> Result<Self> {
        let cache = match &config.cache_dir {
            Some(dir) => IndexCache::new(dir)?,
            None => IndexCache::disabled(),
        };
        Ok(Self::with_cache(
            Arc::new(cache),
            Arc::new(BallTreeBuilder::new(config.build_params())),
        ))
    }

    pub fn with_cache(cache: Arc<IndexCache>, builder: Arc<dyn IndexBuilder>) -> Self {
        Self { cache, builder }
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    pub fn enrich(
        &self,
        rows: &[Listing],
        city_centers: &ReferenceSet,
        landmarks_by_city: &HashMap<String, ReferenceSet>,
    ) -> Enrichment {
        let unresolved = HashSet::new();
        let refs = References {
            city_centers,
            landmarks_by_city,
            unresolved_cities: &unresolved,
        };
        self.enrich_with(rows, &refs, &CancelToken::new())
    }

    pub fn enrich_with(&self, rows: &[Listing], refs: &References<'_>, cancel: &CancelToken) -> Enrichment {
        let mut report = EnrichmentReport {
            rows: rows.len(),
            ..EnrichmentReport::default()
        };

        let mut points: Vec<Option<GeoPoint>> = Vec::with_capacity(rows.len());
        for (row, listing) in rows.iter().enumerate() {
            match listing.query_point() {
                Ok(point) => points.push(Some(point)),
                Err(error) => {
                    points.push(None);
                    report.row_errors.push(RowError {
                        row,
                        listing_id: listing.id.clone(),
                        error,
                    });
                }
            }
        }

        let mut output: Vec<EnrichedListing> = rows.iter().cloned().map(EnrichedListing::unenriched).collect();

        self.enrich_city_centers(rows, &points, refs, cancel, &mut output, &mut report);
        self.enrich_landmarks(rows, &points, refs, cancel, &mut output, &mut report);

        report.row_errors.sort_by_key(|e| e.row);
        Enrichment { rows: output, report }
    }

    fn enrich_city_centers(
        &self,
        rows: &[Listing],
        points: &[Option<GeoPoint>],
        refs: &References<'_>,
        cancel: &CancelToken,
        output: &mut [EnrichedListing],
        report: &mut EnrichmentReport,
    ) {
        if cancel.is_cancelled() {
            report.cancelled_scopes.push(Scope::Global);
            return;
        }

        let index = match self.cache.get_or_build(refs.city_centers, self.builder.as_ref()) {
            Ok(index) => index,
            Err(error) => {
                report.scope_errors.push(ScopeError {
                    scope: Scope::Global,
                    rows: rows.len(),
                    error,
                });
                return;
            }
        };

        let known: HashSet<&str> = refs.city_centers.points().iter().map(|p| p.id()).collect();

        let mut targets = Vec::new();
        let mut queries = Vec::new();
        for (row, point) in points.iter().enumerate() {
            let Some(point) = point else { continue };
            let city = rows[row].city_key();
            if refs.unresolved_cities.contains(&city) || !known.contains(city.as_str()) {
                report.row_errors.push(RowError {
                    row,
                    listing_id: rows[row].id.clone(),
                    error: GeoError::MissingScope { city },
                });
                continue;
            }
            targets.push(row);
            queries.push(point.clone());
        }

        let results = query_batch(&index, &queries);
        if cancel.is_cancelled() {
            report.cancelled_scopes.push(Scope::Global);
            return;
        }
        for (row, result) in targets.into_iter().zip(results) {
            output[row].dist_to_city_center = Some(result.distance_miles);
            report.city_center_enriched += 1;
        }
    }

    fn enrich_landmarks(
        &self,
        rows: &[Listing],
        points: &[Option<GeoPoint>],
        refs: &References<'_>,
        cancel: &CancelToken,
        output: &mut [EnrichedListing],
        report: &mut EnrichmentReport,
    ) {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (row, listing) in rows.iter().enumerate() {
            groups.entry(listing.city_key()).or_default().push(row);
        }
        let groups: Vec<(String, Vec<usize>)> = groups.into_iter().collect();
        info!("Computing landmark distances for {} cities", groups.len());

        let outcomes: Vec<GroupOutcome> = groups
            .into_par_iter()
            .map(|(city, members)| self.enrich_group(city, members, points, refs, cancel))
            .collect();

        for outcome in outcomes {
            match outcome {
                GroupOutcome::Done { city, hits } => {
                    debug!("{}: {} rows enriched", city, hits.len());
                    for (row, distance, landmark) in hits {
                        output[row].dist_to_landmark = Some(distance);
                        output[row].nearest_landmark = Some(landmark);
                        report.landmark_enriched += 1;
                    }
                }
                GroupOutcome::Missing { city, rows: members } => {
                    for row in members {
                        report.row_errors.push(RowError {
                            row,
                            listing_id: rows[row].id.clone(),
                            error: GeoError::MissingScope { city: city.clone() },
                        });
                    }
                }
                GroupOutcome::Failed { city, rows, error } => {
                    report.scope_errors.push(ScopeError {
                        scope: Scope::City(city),
                        rows,
                        error,
                    });
                }
                GroupOutcome::Cancelled { city } => {
                    report.cancelled_scopes.push(Scope::City(city));
                }
            }
        }
    }

    /// Runs on a rayon worker; touches nothing shared except the index cache.
    fn enrich_group(
        &self,
        city: String,
        members: Vec<usize>,
        points: &[Option<GeoPoint>],
        refs: &References<'_>,
        cancel: &CancelToken,
    ) -> GroupOutcome {
        if cancel.is_cancelled() {
            return GroupOutcome::Cancelled { city };
        }

        let Some(landmarks) = refs.landmarks_by_city.get(&city) else {
            return GroupOutcome::Missing { city, rows: members };
        };

        let index = match self.cache.get_or_build(landmarks, self.builder.as_ref()) {
            Ok(index) => index,
            Err(error) => {
                return GroupOutcome::Failed {
                    city,
                    rows: members.len(),
                    error,
                }
            }
        };

        let (targets, queries): (Vec<usize>, Vec<GeoPoint>) = members
            .iter()
            .filter_map(|&row| points[row].clone().map(|p| (row, p)))
            .unzip();
        let results = query_batch(&index, &queries);

        // a group either lands whole or not at all
        if cancel.is_cancelled() {
            return GroupOutcome::Cancelled { city };
        }

        let hits = targets
            .into_iter()
            .zip(results)
            .map(|(row, r)| (row, r.distance_miles, r.nearest_ref_id))
            .collect();
        GroupOutcome::Done { city, hits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balltree::{BuildParams, SpatialIndex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn point(id: &str, lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(id, lat, lon).unwrap()
    }

    fn city_centers() -> ReferenceSet {
        ReferenceSet::new(
            Scope::Global,
            vec![
                point("Austin, TX", 30.2672, -97.7431),
                point("Dallas, TX", 32.7767, -96.7970),
                point("Houston, TX", 29.7604, -95.3698),
            ],
        )
    }

    fn landmarks() -> HashMap<String, ReferenceSet> {
        let mut map = HashMap::new();
        map.insert(
            "Austin, TX".to_string(),
            ReferenceSet::new(
                Scope::city("Austin", "TX"),
                vec![
                    point("Capitol", 30.2747, -97.7404),
                    point("Zilker Park", 30.2669, -97.7729),
                ],
            ),
        );
        map.insert(
            "Dallas, TX".to_string(),
            ReferenceSet::new(
                Scope::city("Dallas", "TX"),
                vec![
                    point("Reunion Tower", 32.7755, -96.8089),
                    point("Fair Park", 32.7792, -96.7600),
                ],
            ),
        );
        map
    }

    fn listings() -> Vec<Listing> {
        vec![
            Listing::new("a1", "Austin", "TX", 30.2747, -97.7404),
            Listing::new("h1", "Houston", "TX", 29.7600, -95.3700),
            Listing::new("d1", "Dallas", "TX", 32.7790, -96.7610),
            Listing::new("a2", "Austin", "TX", 30.2670, -97.7730),
        ]
    }

    fn enricher(dir: &std::path::Path) -> Enricher {
        let config = Config {
            cache_dir: Some(dir.to_path_buf()),
            ..Config::default()
        };
        Enricher::new(&config).unwrap()
    }

    #[test]
    fn test_enrich_preserves_rows_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let result = enricher(dir.path()).enrich(&listings(), &city_centers(), &landmarks());

        let ids: Vec<&str> = result.rows.iter().map(|r| r.listing.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "h1", "d1", "a2"]);

        let a1 = &result.rows[0];
        assert_eq!(a1.dist_to_landmark, Some(0.0));
        assert_eq!(a1.nearest_landmark.as_deref(), Some("Capitol"));
        assert!(a1.dist_to_city_center.unwrap() > 0.0);

        assert_eq!(result.rows[2].nearest_landmark.as_deref(), Some("Fair Park"));
        assert_eq!(result.rows[3].nearest_landmark.as_deref(), Some("Zilker Park"));
        assert_eq!(result.report.city_center_enriched, 4);
        assert_eq!(result.report.landmark_enriched, 3);
    }

    #[test]
    fn test_missing_landmark_scope_is_collected_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let result = enricher(dir.path()).enrich(&listings(), &city_centers(), &landmarks());

        let houston = &result.rows[1];
        assert_eq!(houston.dist_to_landmark, None);
        assert!(houston.dist_to_city_center.is_some());

        assert_eq!(result.report.row_errors.len(), 1);
        let error = &result.report.row_errors[0];
        assert_eq!(error.row, 1);
        assert_eq!(error.listing_id, "h1");
        assert!(matches!(&error.error, GeoError::MissingScope { city } if city == "Houston, TX"));
        assert_eq!(result.report.missing_scopes().into_iter().collect::<Vec<_>>(), vec!["Houston, TX"]);
    }

    #[test]
    fn test_empty_landmark_set_only_affects_its_city() {
        let dir = tempfile::tempdir().unwrap();
        let mut refs = landmarks();
        refs.insert(
            "Dallas, TX".to_string(),
            ReferenceSet::new(Scope::city("Dallas", "TX"), vec![]),
        );

        let result = enricher(dir.path()).enrich(&listings(), &city_centers(), &refs);
        assert_eq!(result.rows[2].dist_to_landmark, None);
        assert!(result.rows[0].dist_to_landmark.is_some());
        assert_eq!(result.report.scope_errors.len(), 1);
        assert!(matches!(
            result.report.scope_errors[0].error,
            GeoError::EmptyReferenceSet { .. }
        ));
    }

    #[test]
    fn test_invalid_row_coordinates_keep_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = listings();
        rows[0].latitude = Some(123.0);

        let result = enricher(dir.path()).enrich(&rows, &city_centers(), &landmarks());
        assert_eq!(result.rows.len(), 4);
        assert_eq!(result.rows[0].dist_to_city_center, None);
        assert_eq!(result.rows[0].dist_to_landmark, None);
        assert!(result.rows[3].dist_to_landmark.is_some());
        assert!(matches!(
            result.report.row_errors[0].error,
            GeoError::InvalidCoordinate { .. }
        ));
    }

    #[test]
    fn test_unresolved_city_center_is_reported() {
        let enricher = Enricher::with_cache(
            Arc::new(IndexCache::disabled()),
            Arc::new(BallTreeBuilder::default()),
        );
        let lm = landmarks();
        let unresolved: HashSet<String> = ["Houston, TX".to_string()].into_iter().collect();
        let refs = References {
            city_centers: &city_centers(),
            landmarks_by_city: &lm,
            unresolved_cities: &unresolved,
        };
        let result = enricher.enrich_with(&listings(), &refs, &CancelToken::new());
        assert_eq!(result.rows[1].dist_to_city_center, None);
        assert_eq!(result.report.city_center_enriched, 3);
    }

    #[test]
    fn test_city_missing_from_centers_gets_no_center_distance() {
        let enricher = Enricher::with_cache(
            Arc::new(IndexCache::disabled()),
            Arc::new(BallTreeBuilder::default()),
        );
        let centers = ReferenceSet::new(Scope::Global, vec![point("Austin, TX", 30.2672, -97.7431)]);
        let rows = vec![
            Listing::new("a1", "Austin", "TX", 30.2747, -97.7404),
            Listing::new("h1", "Houston", "TX", 29.7600, -95.3700),
        ];

        let result = enricher.enrich(&rows, &centers, &landmarks());
        assert!(result.rows[0].dist_to_city_center.is_some());
        assert_eq!(result.rows[1].dist_to_city_center, None);
        assert_eq!(result.report.city_center_enriched, 1);

        let houston: Vec<&RowError> = result.report.row_errors.iter().filter(|e| e.row == 1).collect();
        assert!(!houston.is_empty());
        assert!(houston
            .iter()
            .all(|e| matches!(&e.error, GeoError::MissingScope { city } if city == "Houston, TX")));
    }

    #[test]
    fn test_cancel_before_start_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let lm = landmarks();
        let unresolved = HashSet::new();
        let refs = References {
            city_centers: &city_centers(),
            landmarks_by_city: &lm,
            unresolved_cities: &unresolved,
        };
        let result = enricher(dir.path()).enrich_with(&listings(), &refs, &cancel);
        assert_eq!(result.rows.len(), 4);
        assert!(result
            .rows
            .iter()
            .all(|r| r.dist_to_city_center.is_none() && r.dist_to_landmark.is_none()));
        assert!(result.report.was_cancelled());
        assert!(result.report.cancelled_scopes.contains(&Scope::Global));
    }

    struct CancellingBuilder {
        inner: BallTreeBuilder,
        trigger: Scope,
        cancel: CancelToken,
    }

    impl IndexBuilder for CancellingBuilder {
        fn params(&self) -> BuildParams {
            self.inner.params()
        }

        fn build(&self, reference_set: &ReferenceSet) -> Result<SpatialIndex> {
            if *reference_set.scope() == self.trigger {
                self.cancel.cancel();
            }
            self.inner.build(reference_set)
        }
    }

    #[test]
    fn test_cancel_mid_run_never_merges_partial_city() {
        let cancel = CancelToken::new();
        let enricher = Enricher::with_cache(
            Arc::new(IndexCache::disabled()),
            Arc::new(CancellingBuilder {
                inner: BallTreeBuilder::default(),
                trigger: Scope::city("Dallas", "TX"),
                cancel: cancel.clone(),
            }),
        );
        let lm = landmarks();
        let unresolved = HashSet::new();
        let refs = References {
            city_centers: &city_centers(),
            landmarks_by_city: &lm,
            unresolved_cities: &unresolved,
        };

        let result = enricher.enrich_with(&listings(), &refs, &cancel);
        let report = &result.report;
        assert!(report.cancelled_scopes.contains(&Scope::city("Dallas", "TX")));
        assert_eq!(result.rows[2].dist_to_landmark, None);

        // every city is either merged whole or listed as cancelled
        let austin_cancelled = report.cancelled_scopes.contains(&Scope::city("Austin", "TX"));
        let austin_merged = [0, 3].iter().filter(|&&i| result.rows[i].dist_to_landmark.is_some()).count();
        assert_eq!(austin_merged, if austin_cancelled { 0 } else { 2 });

        let merged = result.rows.iter().filter(|r| r.dist_to_landmark.is_some()).count();
        assert_eq!(report.landmark_enriched, merged);
        assert_eq!(report.landmark_enriched, austin_merged);
        assert!(result.rows.iter().all(|r| r.dist_to_landmark.is_some() == r.nearest_landmark.is_some()));
    }

    #[test]
    fn test_repeated_runs_build_each_index_once() {
        struct Counting(AtomicUsize);
        impl IndexBuilder for Counting {
            fn params(&self) -> BuildParams {
                BuildParams::default()
            }
            fn build(&self, reference_set: &ReferenceSet) -> Result<SpatialIndex> {
                self.0.fetch_add(1, Ordering::SeqCst);
                SpatialIndex::build(reference_set)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(Counting(AtomicUsize::new(0)));
        for _ in 0..2 {
            let enricher = Enricher::with_cache(
                Arc::new(IndexCache::new(dir.path()).unwrap()),
                builder.clone(),
            );
            enricher.enrich(&listings(), &city_centers(), &landmarks());
        }
        // global + Austin + Dallas, built on the first run only
        assert_eq!(builder.0.load(Ordering::SeqCst), 3);
    }
}
