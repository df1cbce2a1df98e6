//! Error taxonomy shared by the index, cache and enrichment layers.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeoError>;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid coordinate for '{id}': lat={lat}, lon={lon}")]
    InvalidCoordinate { id: String, lat: f64, lon: f64 },

    #[error("reference set for scope '{scope}' is empty")]
    EmptyReferenceSet { scope: String },

    #[error("no reference data for city '{city}'")]
    MissingScope { city: String },

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("no reference coordinates could be resolved")]
    NoReferences,

    #[error("cache directory {path:?} is unusable: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("enrichment cancelled")]
    Cancelled,
}

/// Failure reported by a geocoding collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error("no result for '{0}'")]
    NotFound(String),

    #[error("request for '{query}' failed: {message}")]
    Request { query: String, message: String },

    #[error("malformed response for '{query}': {message}")]
    Malformed { query: String, message: String },
}

impl LookupError {
    pub fn query(&self) -> &str {
        match self {
            LookupError::NotFound(query) => query,
            LookupError::Request { query, .. } | LookupError::Malformed { query, .. } => query,
        }
    }
}
