//! Decoding GeoJSON feature collections into cache-ready entries.

use std::collections::HashMap;

use geo_types::Geometry;
use geojson::{Feature, FeatureCollection};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::spatial_index::SpatialEntry;

/// The property curated region datasets use to carry a region's numeric id.
pub const FEATURE_ID_PROPERTY: &str = "_feature_id";

/// A region's numeric id, as parsed from [`FEATURE_ID_PROPERTY`].
pub type FeatureId = i64;

/// How many features we decode between cooperative pacing calls. Large
/// datasets are decoded in one long loop, so this is where memory
/// reclamation gets a chance to interleave.
const PACE_EVERY: usize = 1_000;

/// Turn a feature collection into spatial entries valued by feature id.
///
/// Features lacking a usable id or geometry are dropped with a warning;
/// they never fail the build. `pace` is invoked once per [`PACE_EVERY`]
/// features processed.
pub fn to_spatial_entries(
    collection: &FeatureCollection,
    feature_id_attr: &str,
    pace: &mut dyn FnMut(),
) -> Vec<SpatialEntry<FeatureId>> {
    let mut entries = Vec::with_capacity(collection.features.len());
    for (i, feature) in collection.features.iter().enumerate() {
        if let Some(entry) = spatial_entry_for(feature, feature_id_attr) {
            entries.push(entry);
        }
        if (i + 1) % PACE_EVERY == 0 {
            pace();
        }
    }
    entries
}

/// Turn a feature collection into a key-attribute → feature-id map.
///
/// Features missing either attribute are skipped. When two features share
/// a key, the later one wins.
pub fn to_key_map(
    collection: &FeatureCollection,
    key_attr: &str,
    feature_id_attr: &str,
    pace: &mut dyn FnMut(),
) -> HashMap<String, FeatureId> {
    let mut map = HashMap::new();
    for (i, feature) in collection.features.iter().enumerate() {
        if let Some(key) = string_property(feature, key_attr) {
            if let Some(id) = feature_id(feature, feature_id_attr) {
                map.insert(key, id);
            }
        }
        if (i + 1) % PACE_EVERY == 0 {
            pace();
        }
    }
    map
}

fn spatial_entry_for(
    feature: &Feature,
    feature_id_attr: &str,
) -> Option<SpatialEntry<FeatureId>> {
    let id = feature_id(feature, feature_id_attr)?;
    let Some(geometry) = feature.geometry.as_ref() else {
        warn!("dropping feature {}: no geometry", id);
        return None;
    };
    match Geometry::try_from(&geometry.value) {
        Ok(geom) => Some(SpatialEntry::new(geom, id)),
        Err(err) => {
            warn!("dropping feature {}: unsupported geometry: {}", id, err);
            None
        }
    }
}

/// Parse a feature's numeric id. The conventional encoding is a JSON
/// string of digits, but we accept a bare JSON integer too.
fn feature_id(feature: &Feature, attr: &str) -> Option<FeatureId> {
    match feature.property(attr) {
        Some(JsonValue::String(s)) => match s.parse::<FeatureId>() {
            Ok(id) if id > 0 => Some(id),
            _ => {
                warn!("dropping feature: {:?} is not a positive integer id", s);
                None
            }
        },
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(id) if id > 0 => Some(id),
            _ => {
                warn!("dropping feature: {} is not a positive integer id", n);
                None
            }
        },
        _ => {
            warn!("dropping feature: missing {} property", attr);
            None
        }
    }
}

fn string_property(feature: &Feature, attr: &str) -> Option<String> {
    match feature.property(attr) {
        Some(JsonValue::String(s)) => Some(s.to_owned()),
        _ => None,
    }
}
