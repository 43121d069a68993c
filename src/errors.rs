//! Error types.

use std::sync::Arc;

use thiserror::Error;

/// An error raised while populating or querying a region cache.
///
/// This type is `Clone` on purpose: a failed population is fanned out to
/// every caller waiting on the same cache slot, so the underlying transport
/// error has to be shareable.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The remote fetcher failed before producing any response at all
    /// (connection refused, timeout, TLS trouble, and friends).
    #[error("remote dataset query failed: {0}")]
    Transport(Arc<anyhow::Error>),

    /// The backend answered with a status code we did not expect.
    #[error("unexpected response code {0}")]
    UnexpectedResponseCode(u16),

    /// The backend claimed success but sent no parseable JSON body.
    #[error("response body was missing or not valid JSON")]
    JsonParse,

    /// The body was JSON, but not a GeoJSON feature collection we can use.
    #[error("not a usable GeoJSON feature collection: {0}")]
    GeoJsonFormat(String),

    /// Free memory was below the configured floor at a checkpoint.
    #[error("free memory {free_pct}% is below the required {min_pct}%")]
    OutOfMemoryPressure { free_pct: u8, min_pct: u8 },

    /// An index entry carried a geometry with no usable extent.
    #[error("geometry has no usable extent: {0}")]
    Geometry(String),

    /// The population task died before resolving. This is a bug somewhere,
    /// not a per-request condition.
    #[error("index population task failed: {0}")]
    BuildFailed(String),
}

impl CacheError {
    /// Wrap a transport-level error from the remote fetcher.
    pub fn transport(err: anyhow::Error) -> CacheError {
        CacheError::Transport(Arc::new(err))
    }
}
