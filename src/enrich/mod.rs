//! Dataset enrichment with nearest city-center and landmark distances.
//!
//! City centers use one global index; landmarks use one index per city,
//! fanned out across cities with rayon and merged back in row order.

mod cancel;
mod driver;
mod report;

pub use cancel::CancelToken;
pub use driver::{Enricher, Enrichment, References};
pub use report::{EnrichmentReport, RowError, ScopeError};
