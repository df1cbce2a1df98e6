//! Batched nearest-neighbor queries.

use serde::{Deserialize, Serialize};

use super::SpatialIndex;
use crate::models::GeoPoint;

/// Nearest reference point for one query point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub nearest_ref_id: String,
    pub distance_miles: f64,
}

/// Answer a batch of k=1 queries, one result per input point in input order.
///
/// An index always holds at least one point, so every query yields a result.
pub fn query_batch(index: &SpatialIndex, points: &[GeoPoint]) -> Vec<QueryResult> {
    let results: Vec<QueryResult> = points
        .iter()
        .filter_map(|point| {
            let hit = index.nearest(point)?;
            Some(QueryResult {
                query_id: point.id().to_string(),
                nearest_ref_id: hit.id.to_string(),
                distance_miles: hit.distance_miles,
            })
        })
        .collect();
    debug_assert_eq!(results.len(), points.len());
    results
}
