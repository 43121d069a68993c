//! The spatial flavor of the region cache.

use geojson::FeatureCollection;

use crate::features::{self, FeatureId, FEATURE_ID_PROPERTY};
use crate::spatial_index::SpatialIndex;
use crate::Result;

use super::{RegionCache, RegionIndexer};

/// Builds point-in-region indices: an R-tree over region geometries,
/// valued by feature id.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpatialIndexer;

impl RegionIndexer for SpatialIndexer {
    type Index = SpatialIndex<FeatureId>;

    const KIND: &'static str = "spatial";

    fn build_from_features(
        &self,
        collection: &FeatureCollection,
        _column: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index> {
        // Features supplied in memory still carry their id in the
        // conventional property; the column only matters for lookups by
        // attribute, which is the other cache's job.
        let entries =
            features::to_spatial_entries(collection, FEATURE_ID_PROPERTY, pace);
        SpatialIndex::build(entries)
    }

    fn build_from_feature_json(
        &self,
        collection: &FeatureCollection,
        _resource: &str,
        _key_attr: &str,
        value_attr: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index> {
        let entries = features::to_spatial_entries(collection, value_attr, pace);
        SpatialIndex::build(entries)
    }

    fn size_of(index: &Self::Index) -> usize {
        index.num_coordinates()
    }
}

/// A region cache of spatial indices, sized by coordinate count.
pub type SpatialRegionCache = RegionCache<SpatialIndexer>;
