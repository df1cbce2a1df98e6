//! Builder seam between the index cache and index construction.

use super::{BuildParams, SpatialIndex};
use crate::error::Result;
use crate::models::ReferenceSet;

/// Something that turns a reference set into a spatial index.
pub trait IndexBuilder: Send + Sync {
    /// Parameters every index produced by this builder carries.
    fn params(&self) -> BuildParams;

    fn build(&self, reference_set: &ReferenceSet) -> Result<SpatialIndex>;
}

/// The default ball-tree builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct BallTreeBuilder {
    params: BuildParams,
}

impl BallTreeBuilder {
    pub fn new(params: BuildParams) -> Self {
        Self { params }
    }
}

impl IndexBuilder for BallTreeBuilder {
    fn params(&self) -> BuildParams {
        self.params
    }

    fn build(&self, reference_set: &ReferenceSet) -> Result<SpatialIndex> {
        SpatialIndex::build_with(reference_set, self.params)
    }
}
