//! Talking to the tabular-data backend that serves curated region
//! datasets.
//!
//! The actual HTTP client lives with the host; the cache only needs a way
//! to run a query and a contract for interpreting what comes back.

use async_trait::async_trait;
use geojson::{FeatureCollection, GeoJson};
use serde_json::Value as JsonValue;
use wkt::ToWkt;

use crate::cache::Envelope;
use crate::{CacheError, Result};

/// The response format we always request for region datasets.
pub const GEOJSON_FORMAT: &str = "geojson";

/// Row cap on region queries. Curated region datasets are expected to stay
/// far below this; the cap just keeps a misconfigured resource from
/// streaming forever.
const MAX_ROWS: u64 = 10_000_000;

/// The raw outcome of one query against the tabular backend.
#[derive(Debug)]
pub enum SodaResult {
    /// The backend answered. `body` is `None` when the payload was empty
    /// or not JSON.
    Response {
        status: u16,
        body: Option<JsonValue>,
    },
    /// The request itself never produced a response.
    Failed(anyhow::Error),
}

impl SodaResult {
    /// Interpret a raw query outcome.
    ///
    /// - A transport failure is passed through.
    /// - The expected status with a JSON body succeeds with that body.
    /// - The expected status with no body is a [`CacheError::JsonParse`].
    /// - Any other status is a [`CacheError::UnexpectedResponseCode`].
    pub fn check(self, expected_status: u16) -> Result<JsonValue> {
        match self {
            SodaResult::Failed(err) => Err(CacheError::transport(err)),
            SodaResult::Response {
                status,
                body: Some(json),
            } if status == expected_status => Ok(json),
            SodaResult::Response { status, body: None }
                if status == expected_status =>
            {
                Err(CacheError::JsonParse)
            }
            SodaResult::Response { status, .. } => {
                Err(CacheError::UnexpectedResponseCode(status))
            }
        }
    }
}

/// The read side of the tabular backend.
///
/// Kept abstract so hosts can plug in their own client and tests can
/// script responses.
#[async_trait]
pub trait RemoteDataset: Send + Sync + 'static {
    /// Run a query against `resource`, asking for `format`, with the given
    /// request parameters.
    async fn query(
        &self,
        resource: &str,
        format: &str,
        params: &[(String, String)],
    ) -> SodaResult;
}

/// Build the `$query` parameter for populating a region cache entry.
///
/// With an envelope, the query narrows to features intersecting it. The
/// envelope is serialized as a single-polygon MULTIPOLYGON because the
/// backend's spatial predicate does not accept a bare POLYGON.
pub(crate) fn region_query(
    column: &str,
    envelope: Option<&Envelope>,
) -> Vec<(String, String)> {
    let query = match envelope {
        Some(envelope) => format!(
            "select * where intersects({}, '{}') limit {}",
            column,
            envelope.to_multi_polygon().wkt_string(),
            MAX_ROWS,
        ),
        None => format!("select * limit {}", MAX_ROWS),
    };
    vec![("$query".to_owned(), query)]
}

/// Require `json` to be a GeoJSON feature collection.
pub(crate) fn feature_collection(json: JsonValue) -> Result<FeatureCollection> {
    match GeoJson::from_json_value(json) {
        Ok(GeoJson::FeatureCollection(collection)) => Ok(collection),
        Ok(_) => Err(CacheError::GeoJsonFormat(
            "expected a FeatureCollection".to_owned(),
        )),
        Err(err) => Err(CacheError::GeoJsonFormat(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::format_err;
    use serde_json::json;

    use super::*;

    #[test]
    fn check_accepts_the_expected_status_with_a_body() {
        let result = SodaResult::Response {
            status: 201,
            body: Some(json!({ "yay": "success!" })),
        };
        assert_eq!(result.check(201).unwrap(), json!({ "yay": "success!" }));
    }

    #[test]
    fn check_rejects_an_unexpected_status() {
        let result = SodaResult::Response {
            status: 200,
            body: Some(json!({ "yay": "success!" })),
        };
        assert!(matches!(
            result.check(201),
            Err(CacheError::UnexpectedResponseCode(200)),
        ));
    }

    #[test]
    fn check_rejects_a_missing_body() {
        let result = SodaResult::Response {
            status: 200,
            body: None,
        };
        assert!(matches!(result.check(200), Err(CacheError::JsonParse)));
    }

    #[test]
    fn check_passes_transport_failures_through() {
        let result = SodaResult::Failed(format_err!("connection refused"));
        match result.check(200) {
            Err(CacheError::Transport(err)) => {
                assert!(err.to_string().contains("connection refused"));
            }
            other => panic!("expected a transport error, got {:?}", other),
        }
    }

    #[test]
    fn region_query_without_an_envelope_selects_everything() {
        let params = region_query("the_geom", None);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "$query");
        assert_eq!(params[0].1, format!("select * limit {}", MAX_ROWS));
    }

    #[test]
    fn region_query_with_an_envelope_narrows_by_intersection() {
        let envelope = Envelope::new(0.0, 0.0, 10.0, 20.0);
        let params = region_query("the_geom", Some(&envelope));
        let query = &params[0].1;
        assert!(query.starts_with("select * where intersects(the_geom, 'MULTIPOLYGON"));
        assert!(query.ends_with(&format!("limit {}", MAX_ROWS)));
        assert!(query.contains("10"));
        assert!(query.contains("20"));
    }

    #[test]
    fn feature_collection_rejects_other_geojson() {
        let not_a_collection = json!({
            "type": "Point",
            "coordinates": [0.0, 0.0],
        });
        assert!(matches!(
            feature_collection(not_a_collection),
            Err(CacheError::GeoJsonFormat(_)),
        ));

        let not_geojson = json!({ "rows": [] });
        assert!(matches!(
            feature_collection(not_geojson),
            Err(CacheError::GeoJsonFormat(_)),
        ));
    }
}
