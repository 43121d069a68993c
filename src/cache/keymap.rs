//! The attribute-lookup flavor of the region cache.

use std::collections::HashMap;

use geojson::FeatureCollection;

use crate::features::{self, FeatureId, FEATURE_ID_PROPERTY};
use crate::Result;

use super::{RegionCache, RegionIndexer};

/// The index held by a [`HashMapRegionCache`]: configured key attribute →
/// feature id.
pub type HashMapIndex = HashMap<String, FeatureId>;

/// Builds attribute-to-id lookup tables from region features.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyMapIndexer;

impl RegionIndexer for KeyMapIndexer {
    type Index = HashMapIndex;

    const KIND: &'static str = "hashmap";

    fn build_from_features(
        &self,
        collection: &FeatureCollection,
        column: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index> {
        // The key's column doubles as the key attribute when features are
        // handed to us directly.
        Ok(features::to_key_map(
            collection,
            column,
            FEATURE_ID_PROPERTY,
            pace,
        ))
    }

    fn build_from_feature_json(
        &self,
        collection: &FeatureCollection,
        _resource: &str,
        key_attr: &str,
        value_attr: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index> {
        Ok(features::to_key_map(collection, key_attr, value_attr, pace))
    }

    fn size_of(index: &Self::Index) -> usize {
        index.len()
    }
}

/// A region cache of attribute lookup tables, sized by entry count.
pub type HashMapRegionCache = RegionCache<KeyMapIndexer>;
