//! Summary of rows and scopes that could not be enriched.

use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::error::GeoError;
use crate::models::Scope;

/// A failure attached to one dataset row.
#[derive(Debug)]
pub struct RowError {
    /// Position in the input dataset
    pub row: usize,
    pub listing_id: String,
    pub error: GeoError,
}

/// A failure affecting every row of one reference scope.
#[derive(Debug)]
pub struct ScopeError {
    pub scope: Scope,
    pub rows: usize,
    pub error: GeoError,
}

#[derive(Debug, Default)]
pub struct EnrichmentReport {
    pub rows: usize,
    pub city_center_enriched: usize,
    pub landmark_enriched: usize,
    pub row_errors: Vec<RowError>,
    pub scope_errors: Vec<ScopeError>,
    /// Scopes skipped or discarded because of cancellation
    pub cancelled_scopes: Vec<Scope>,
}

impl EnrichmentReport {
    pub fn is_clean(&self) -> bool {
        self.row_errors.is_empty() && self.scope_errors.is_empty() && self.cancelled_scopes.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        !self.cancelled_scopes.is_empty()
    }

    /// Cities that rows referenced but no landmark set exists for.
    pub fn missing_scopes(&self) -> BTreeSet<&str> {
        self.row_errors
            .iter()
            .filter_map(|e| match &e.error {
                GeoError::MissingScope { city } => Some(city.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn log_summary(&self) {
        info!(
            "Enriched {} rows: {} with city-center distance, {} with landmark distance",
            self.rows, self.city_center_enriched, self.landmark_enriched
        );

        if !self.row_errors.is_empty() {
            warn!("{} row errors", self.row_errors.len());
            let missing = self.missing_scopes();
            if !missing.is_empty() {
                warn!("  no landmark set for {} cities", missing.len());
                for city in missing.iter().take(10) {
                    warn!("    {}", city);
                }
            }
        }
        for scope_error in &self.scope_errors {
            warn!(
                "  scope {} ({} rows): {}",
                scope_error.scope, scope_error.rows, scope_error.error
            );
        }
        if self.was_cancelled() {
            warn!(
                "Cancelled before {} scopes completed; their rows were left empty",
                self.cancelled_scopes.len()
            );
        }
    }
}
