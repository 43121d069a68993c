//! `regioncode`: the in-memory core of a geo-region coding service.
//!
//! Given geographic points or attribute values, map them to curated
//! regions (wards, zip codes, neighborhoods) described by GeoJSON feature
//! collections served from a remote tabular-data backend. Region lookup
//! structures are expensive to build, so they are built once per dataset
//! and cached:
//!
//! - [`SpatialRegionCache`] holds bulk-loaded R-trees answering
//!   point-in-region queries.
//! - [`HashMapRegionCache`] holds attribute → feature-id lookup tables.
//!
//! Both are bounded LRU caches of *futures*: population is single-flight
//! (concurrent callers for one key share one build), and a
//! [`MemoryGovernor`] can evict the smallest entries when free memory runs
//! short ("depressurization").
//!
//! The host supplies two things: a [`RemoteDataset`] implementation
//! wrapping its tabular-backend client, and a [`RegionCacheConfig`]
//! deserialized from its configuration tree. Everything else is wired
//! here:
//!
//! ```no_run
//! # async fn example(remote: std::sync::Arc<dyn regioncode::RemoteDataset>) -> regioncode::Result<()> {
//! use regioncode::{RegionCacheConfig, RegionCoder, SpatialRegionCache, HashMapRegionCache};
//!
//! let config = RegionCacheConfig::default();
//! let coder = RegionCoder::new(
//!     remote,
//!     SpatialRegionCache::new(&config),
//!     HashMapRegionCache::new(&config),
//! );
//! let points = vec![geo_types::point!(x: -71.06, y: 42.36)];
//! let regions = coder.code_points("wards-2024", "the_geom", &points).await?;
//! # Ok(()) }
//! ```

pub mod cache;
pub mod coder;
pub mod errors;
pub mod features;
pub mod memory;
pub mod soda;
pub mod spatial_index;

pub use crate::cache::{
    Envelope, HashMapIndex, HashMapRegionCache, KeyMapIndexer, RegionCache,
    RegionCacheConfig, RegionCacheKey, RegionIndexer, SpatialIndexer,
    SpatialRegionCache,
};
pub use crate::coder::RegionCoder;
pub use crate::errors::CacheError;
pub use crate::features::{FeatureId, FEATURE_ID_PROPERTY};
pub use crate::memory::{Depressurizable, FreeStats, MemoryGovernor};
pub use crate::soda::{RemoteDataset, SodaResult, GEOJSON_FORMAT};
pub use crate::spatial_index::{SpatialEntry, SpatialIndex};

/// A `Result` type which defaults to [`CacheError`].
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
