//! Ball-tree over the haversine metric.
//!
//! Reference coordinates are converted to radians once, at build time, and
//! stored in leaf order so every leaf covers a contiguous slice. Each node keeps
//! a spherical centroid and the largest angular distance from it to any member;
//! since great-circle distance obeys the triangle inequality,
//! `dist(q, center) - radius` bounds every point under the node from below.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use super::haversine::{angular_distance, from_vector, to_unit_vector, EARTH_RADIUS_MILES};
use crate::error::{GeoError, Result};
use crate::models::{Fingerprint, GeoPoint, ReferenceSet, Scope};

/// Slack for floating point error in the pruning bound.
const PRUNE_EPSILON: f64 = 1e-12;

/// Parameters that shape a built index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Maximum number of points in a leaf
    pub leaf_size: usize,
    /// Radius used to turn angular distances into miles
    pub earth_radius_miles: f64,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            leaf_size: 16,
            earth_radius_miles: EARTH_RADIUS_MILES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    center: [f64; 2],
    radius: f64,
    kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NodeKind {
    Leaf { start: usize, end: usize },
    Internal { left: usize, right: usize },
}

/// A reference point found by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor<'a> {
    pub id: &'a str,
    /// Central angle in radians
    pub angle: f64,
    /// Great-circle distance in miles
    pub distance_miles: f64,
}

/// Immutable nearest-neighbor index built from one reference set snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialIndex {
    scope: Scope,
    fingerprint: Fingerprint,
    params: BuildParams,
    ids: Vec<String>,
    /// (lat, lon) in radians, leaf order
    coords: Vec<[f64; 2]>,
    /// Root is node 0
    nodes: Vec<Node>,
}

impl SpatialIndex {
    /// Build an index with default parameters.
    pub fn build(reference_set: &ReferenceSet) -> Result<Self> {
        Self::build_with(reference_set, BuildParams::default())
    }

    pub fn build_with(reference_set: &ReferenceSet, params: BuildParams) -> Result<Self> {
        if reference_set.is_empty() {
            return Err(GeoError::EmptyReferenceSet {
                scope: reference_set.scope().to_string(),
            });
        }

        let points = reference_set.points();
        let radians: Vec<[f64; 2]> = points
            .iter()
            .map(|p| p.coordinates().to_radians())
            .collect();

        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::new();
        build_node(&radians, &mut order, 0, params.leaf_size.max(1), &mut nodes);

        let ids = order.iter().map(|&i| points[i].id().to_string()).collect();
        let coords = order.iter().map(|&i| radians[i]).collect();

        debug!(
            "Built ball-tree for {} ({} points, {} nodes)",
            reference_set.scope(),
            points.len(),
            nodes.len()
        );

        Ok(Self {
            scope: reference_set.scope().clone(),
            fingerprint: reference_set.fingerprint(),
            params,
            ids,
            coords,
            nodes,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Nearest reference point to `point`.
    pub fn nearest(&self, point: &GeoPoint) -> Option<Neighbor<'_>> {
        self.nearest_k(point, 1).into_iter().next()
    }

    /// Up to `k` nearest reference points, closest first.
    ///
    /// Ties on distance go to the lexicographically smaller id.
    pub fn nearest_k(&self, point: &GeoPoint, k: usize) -> Vec<Neighbor<'_>> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }

        let query = point.coordinates().to_radians();
        let mut best: Vec<(f64, usize)> = Vec::with_capacity(k + 1);
        self.search(0, query, k, &mut best);

        best.into_iter()
            .map(|(angle, i)| Neighbor {
                id: &self.ids[i],
                angle,
                distance_miles: angle * self.params.earth_radius_miles,
            })
            .collect()
    }

    fn search(&self, node_idx: usize, query: [f64; 2], k: usize, best: &mut Vec<(f64, usize)>) {
        let node = &self.nodes[node_idx];
        if best.len() == k {
            let worst = best[k - 1].0;
            if lower_bound(node, query) > worst + PRUNE_EPSILON {
                return;
            }
        }

        match node.kind {
            NodeKind::Leaf { start, end } => {
                for i in start..end {
                    let candidate = (angular_distance(query, self.coords[i]), i);
                    if best.len() < k {
                        best.push(candidate);
                        best.sort_by(|a, b| self.compare(*a, *b));
                    } else if self.compare(candidate, best[k - 1]) == Ordering::Less {
                        best[k - 1] = candidate;
                        best.sort_by(|a, b| self.compare(*a, *b));
                    }
                }
            }
            NodeKind::Internal { left, right } => {
                let left_bound = lower_bound(&self.nodes[left], query);
                let right_bound = lower_bound(&self.nodes[right], query);
                if left_bound <= right_bound {
                    self.search(left, query, k, best);
                    self.search(right, query, k, best);
                } else {
                    self.search(right, query, k, best);
                    self.search(left, query, k, best);
                }
            }
        }
    }

    fn compare(&self, a: (f64, usize), b: (f64, usize)) -> Ordering {
        a.0.total_cmp(&b.0)
            .then_with(|| self.ids[a.1].cmp(&self.ids[b.1]))
            .then_with(|| a.1.cmp(&b.1))
    }

    /// Structural sanity check for indexes read back from disk.
    pub fn is_well_formed(&self) -> bool {
        if self.ids.is_empty() || self.ids.len() != self.coords.len() || self.nodes.is_empty() {
            return false;
        }
        if self.params.leaf_size == 0
            || !(self.params.earth_radius_miles.is_finite() && self.params.earth_radius_miles > 0.0)
        {
            return false;
        }

        let mut covered = 0;
        for node in &self.nodes {
            if !node.radius.is_finite() || node.radius < 0.0 {
                return false;
            }
            match node.kind {
                NodeKind::Leaf { start, end } => {
                    if start >= end || end > self.coords.len() {
                        return false;
                    }
                    covered += end - start;
                }
                NodeKind::Internal { left, right } => {
                    if left >= self.nodes.len() || right >= self.nodes.len() {
                        return false;
                    }
                }
            }
        }
        covered == self.coords.len()
    }
}

fn lower_bound(node: &Node, query: [f64; 2]) -> f64 {
    (angular_distance(query, node.center) - node.radius).max(0.0)
}

/// Recursively partition `order` and append nodes; returns the new node's index.
fn build_node(
    coords: &[[f64; 2]],
    order: &mut [usize],
    offset: usize,
    leaf_size: usize,
    nodes: &mut Vec<Node>,
) -> usize {
    let center = centroid(coords, order);
    let radius = order
        .iter()
        .map(|&i| angular_distance(center, coords[i]))
        .fold(0.0, f64::max);

    let node_idx = nodes.len();
    nodes.push(Node {
        center,
        radius,
        kind: NodeKind::Leaf {
            start: offset,
            end: offset + order.len(),
        },
    });

    if order.len() <= leaf_size || radius == 0.0 {
        return node_idx;
    }

    let split = match partition(coords, order, center) {
        Some(split) => split,
        None => return node_idx,
    };

    let (left_order, right_order) = order.split_at_mut(split);
    let left = build_node(coords, left_order, offset, leaf_size, nodes);
    let right = build_node(coords, right_order, offset + split, leaf_size, nodes);
    nodes[node_idx].kind = NodeKind::Internal { left, right };
    node_idx
}

/// Split around two far-apart seeds; `None` when every point coincides.
fn partition(coords: &[[f64; 2]], order: &mut [usize], center: [f64; 2]) -> Option<usize> {
    let farthest_from = |origin: [f64; 2], order: &[usize]| {
        order
            .iter()
            .copied()
            .max_by(|&a, &b| {
                angular_distance(origin, coords[a]).total_cmp(&angular_distance(origin, coords[b]))
            })
            .unwrap_or(order[0])
    };

    let seed_a = coords[farthest_from(center, order)];
    let seed_b = coords[farthest_from(seed_a, order)];
    if angular_distance(seed_a, seed_b) == 0.0 {
        return None;
    }

    // closer to seed_a first
    order.sort_by(|&x, &y| {
        let dx = angular_distance(coords[x], seed_a) - angular_distance(coords[x], seed_b);
        let dy = angular_distance(coords[y], seed_a) - angular_distance(coords[y], seed_b);
        dx.total_cmp(&dy).then_with(|| x.cmp(&y))
    });

    let split = order
        .iter()
        .position(|&i| angular_distance(coords[i], seed_a) > angular_distance(coords[i], seed_b))
        .unwrap_or(order.len());

    // keep the tree balanced when one seed attracts nearly everything
    let split = if split == 0 || split == order.len() {
        order.len() / 2
    } else {
        split
    };
    Some(split)
}

fn centroid(coords: &[[f64; 2]], order: &[usize]) -> [f64; 2] {
    let mut sum = [0.0; 3];
    for &i in order {
        let v = to_unit_vector(coords[i]);
        sum[0] += v[0];
        sum[1] += v[1];
        sum[2] += v[2];
    }
    from_vector(sum).unwrap_or(coords[order[0]])
}
