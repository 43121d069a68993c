//! Mapping points and attribute values to region feature ids.

use std::sync::Arc;

use geo_types::{Geometry, Point};

use crate::cache::{
    Envelope, HashMapRegionCache, RegionCacheKey, SpatialRegionCache,
};
use crate::features::{FeatureId, FEATURE_ID_PROPERTY};
use crate::soda::RemoteDataset;
use crate::Result;

/// Codes geographic points and attribute strings to region ids, populating
/// the region caches from the remote dataset on demand.
pub struct RegionCoder {
    remote: Arc<dyn RemoteDataset>,
    spatial: SpatialRegionCache,
    hashmap: HashMapRegionCache,
}

impl RegionCoder {
    pub fn new(
        remote: Arc<dyn RemoteDataset>,
        spatial: SpatialRegionCache,
        hashmap: HashMapRegionCache,
    ) -> RegionCoder {
        RegionCoder {
            remote,
            spatial,
            hashmap,
        }
    }

    /// Map each point to the region containing it, if any. Results are in
    /// input order.
    ///
    /// The cache entry is narrowed to the points' bounding envelope, so
    /// coding a city block doesn't pull a whole national dataset into
    /// memory.
    pub async fn code_points(
        &self,
        resource: &str,
        geometry_column: &str,
        points: &[Point<f64>],
    ) -> Result<Vec<Option<FeatureId>>> {
        let Some(envelope) = Envelope::covering(points) else {
            return Ok(Vec::new());
        };
        let key =
            RegionCacheKey::with_envelope(resource, geometry_column, envelope);
        let index = self
            .spatial
            .get_from_soda(Arc::clone(&self.remote), &key, FEATURE_ID_PROPERTY)
            .await?;
        Ok(points
            .iter()
            .map(|point| {
                index
                    .first_contains(&Geometry::Point(*point))
                    .map(|entry| entry.value)
            })
            .collect())
    }

    /// Map each attribute value to its region id via `column`. Results are
    /// in input order; unknown values come back as `None`.
    pub async fn code_strings(
        &self,
        resource: &str,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Option<FeatureId>>> {
        let key = RegionCacheKey::new(resource, column);
        let index = self
            .hashmap
            .get_from_soda(Arc::clone(&self.remote), &key, FEATURE_ID_PROPERTY)
            .await?;
        Ok(values
            .iter()
            .map(|value| index.get(value).copied())
            .collect())
    }

    /// The spatial cache backing point coding.
    pub fn spatial_cache(&self) -> &SpatialRegionCache {
        &self.spatial
    }

    /// The attribute cache backing string coding.
    pub fn hashmap_cache(&self) -> &HashMapRegionCache {
        &self.hashmap
    }
}
