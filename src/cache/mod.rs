//! The region cache: a bounded, concurrent, single-flight,
//! memory-pressure-aware store of per-dataset lookup structures.
//!
//! The cache holds one *future* per key rather than one value. That gives
//! us single-flight population for free: whoever finds the slot empty
//! installs the future, and everyone else (concurrent or later) awaits
//! the same one. Failed populations stay in their slot until evicted, so a
//! key that keeps failing doesn't hammer the backend.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use geo_types::{coord, MultiPolygon, Point, Rect};
use geojson::FeatureCollection;
use lru::LruCache;
use metrics::{describe_gauge, describe_histogram, gauge, histogram, Unit};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace};

use crate::memory::{Depressurizable, MemoryGovernor};
use crate::soda::{self, RemoteDataset, GEOJSON_FORMAT};
use crate::{CacheError, Result};

mod keymap;
mod spatial;

pub use keymap::{HashMapIndex, HashMapRegionCache, KeyMapIndexer};
pub use spatial::{SpatialIndexer, SpatialRegionCache};

/// An axis-aligned bounding box in dataset coordinates.
///
/// Envelopes take part in cache keys, so equality and hashing are bitwise
/// on the coordinates: two envelopes only share a slot if they were
/// produced from identical floats.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The smallest envelope covering `points`, or `None` for an empty
    /// slice.
    pub fn covering(points: &[Point<f64>]) -> Option<Envelope> {
        let first = points.first()?;
        let mut envelope = Envelope::new(first.x(), first.y(), first.x(), first.y());
        for point in &points[1..] {
            envelope.min_x = envelope.min_x.min(point.x());
            envelope.min_y = envelope.min_y.min(point.y());
            envelope.max_x = envelope.max_x.max(point.x());
            envelope.max_y = envelope.max_y.max(point.y());
        }
        Some(envelope)
    }

    /// The envelope as a single-polygon MULTIPOLYGON, which is the shape
    /// the backend's spatial predicate insists on.
    pub(crate) fn to_multi_polygon(&self) -> MultiPolygon<f64> {
        let rect = Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        );
        MultiPolygon(vec![rect.to_polygon()])
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Envelope) -> bool {
        self.min_x.to_bits() == other.min_x.to_bits()
            && self.min_y.to_bits() == other.min_y.to_bits()
            && self.max_x.to_bits() == other.max_x.to_bits()
            && self.max_y.to_bits() == other.max_y.to_bits()
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_x.to_bits().hash(state);
        self.min_y.to_bits().hash(state);
        self.max_x.to_bits().hash(state);
        self.max_y.to_bits().hash(state);
    }
}

/// Identifies one cached index: a dataset resource, the column the index
/// is built over, and an optional narrowing envelope.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RegionCacheKey {
    pub resource: String,
    pub column: String,
    pub envelope: Option<Envelope>,
}

impl RegionCacheKey {
    pub fn new(
        resource: impl Into<String>,
        column: impl Into<String>,
    ) -> RegionCacheKey {
        RegionCacheKey {
            resource: resource.into(),
            column: column.into(),
            envelope: None,
        }
    }

    pub fn with_envelope(
        resource: impl Into<String>,
        column: impl Into<String>,
        envelope: Envelope,
    ) -> RegionCacheKey {
        RegionCacheKey {
            resource: resource.into(),
            column: column.into(),
            envelope: Some(envelope),
        }
    }
}

impl fmt::Display for RegionCacheKey {
    /// The rendering used by size reports. Note that the envelope is not
    /// included, so narrowed and unnarrowed entries for the same resource
    /// and column display alike.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.column)
    }
}

/// Tuning options for a region cache. Field names mirror the host's
/// configuration tree.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RegionCacheConfig {
    /// Hard capacity: how many indices one cache may hold.
    pub max_entries: usize,
    /// Whether memory-driven eviction runs at all.
    pub enable_depressurize: bool,
    /// Free-memory floor (percent) below which depressurization starts.
    pub min_free_percentage: u8,
    /// Free-memory level (percent) depressurization tries to restore.
    pub target_free_percentage: u8,
    /// Minimum milliseconds between depressurization sweeps.
    pub iteration_interval: u64,
}

impl Default for RegionCacheConfig {
    fn default() -> RegionCacheConfig {
        RegionCacheConfig {
            max_entries: 100,
            enable_depressurize: true,
            min_free_percentage: 20,
            target_free_percentage: 40,
            iteration_interval: 100,
        }
    }
}

/// The seam between the shared cache orchestration and a concrete index
/// kind. Implementations are stateless recipes; all the bookkeeping lives
/// in [`RegionCache`].
pub trait RegionIndexer: Send + Sync + 'static {
    /// The index this cache flavor stores.
    type Index: Send + Sync + 'static;

    /// Label attached to this cache's metrics.
    const KIND: &'static str;

    /// Build an index from features already held in memory, keyed by the
    /// cache key's column.
    fn build_from_features(
        &self,
        collection: &FeatureCollection,
        column: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index>;

    /// Build an index from a freshly fetched GeoJSON feature collection.
    fn build_from_feature_json(
        &self,
        collection: &FeatureCollection,
        resource: &str,
        key_attr: &str,
        value_attr: &str,
        pace: &mut dyn FnMut(),
    ) -> Result<Self::Index>;

    /// The eviction size metric for `index`.
    fn size_of(index: &Self::Index) -> usize;

    /// Hook run before a population allocates anything. The default does
    /// nothing.
    fn prep_for_caching(&self, _governor: &MemoryGovernor) -> Result<()> {
        Ok(())
    }
}

/// The shared outcome of one population: every waiter on a slot gets a
/// clone of this.
type SharedBuild<I> = Shared<BoxFuture<'static, Result<Arc<I>>>>;

/// A bounded, thread-safe, single-flight cache of region indices.
///
/// Cloning is cheap and shares the underlying cache.
pub struct RegionCache<Ix: RegionIndexer> {
    inner: Arc<CacheInner<Ix>>,
}

impl<Ix: RegionIndexer> Clone for RegionCache<Ix> {
    fn clone(&self) -> RegionCache<Ix> {
        RegionCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<Ix: RegionIndexer> {
    /// The only cache-wide mutable structure. The lock is held for slot
    /// lookup and install, never across a fetch or build.
    slots: Mutex<LruCache<RegionCacheKey, SharedBuild<Ix::Index>>>,
    indexer: Ix,
    governor: Arc<MemoryGovernor>,
    enable_depressurize: bool,
}

impl<Ix: RegionIndexer + Default> RegionCache<Ix> {
    /// Create a cache with its own memory governor, tuned by `config`.
    pub fn new(config: &RegionCacheConfig) -> RegionCache<Ix> {
        let governor = Arc::new(MemoryGovernor::new(
            config.min_free_percentage,
            config.target_free_percentage,
            Duration::from_millis(config.iteration_interval),
        ));
        Self::with_governor(config, governor)
    }

    /// Create a cache sharing an existing governor. Useful when several
    /// caches should depressurize against the same memory budget.
    pub fn with_governor(
        config: &RegionCacheConfig,
        governor: Arc<MemoryGovernor>,
    ) -> RegionCache<Ix> {
        // Describing metrics is idempotent, so recreating caches (the
        // test suites do this constantly) is harmless.
        describe_gauge!(
            "regioncode.region_cache.entries",
            "Cached region indices currently held, per cache kind"
        );
        describe_histogram!(
            "regioncode.region_cache.fetch.duration_seconds",
            Unit::Seconds,
            "Time spent fetching region features from the remote dataset"
        );
        describe_histogram!(
            "regioncode.region_cache.build.duration_seconds",
            Unit::Seconds,
            "Time spent building a region index from fetched features"
        );

        let capacity =
            NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        RegionCache {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(LruCache::new(capacity)),
                indexer: Ix::default(),
                governor,
                enable_depressurize: config.enable_depressurize,
            }),
        }
    }
}

impl<Ix: RegionIndexer> RegionCache<Ix> {
    /// Return the index for `key`, building it from `features` if absent.
    ///
    /// The lookup-and-install step is atomic: however many callers race on
    /// the same key, exactly one build runs and everyone shares its
    /// outcome, including a failure.
    pub async fn get_from_features(
        &self,
        key: &RegionCacheKey,
        features: FeatureCollection,
    ) -> Result<Arc<Ix::Index>> {
        let inner = Arc::clone(&self.inner);
        let column = key.column.clone();
        let slot = self.slot_for(key, move || {
            async move { inner.build_local(features, column) }.boxed()
        });
        slot.await
    }

    /// Return the index for `key`, populating it from the remote dataset
    /// if absent. Same single-flight contract as [`Self::get_from_features`].
    ///
    /// When the key carries an envelope, the query is narrowed to features
    /// intersecting it.
    pub async fn get_from_soda(
        &self,
        remote: Arc<dyn RemoteDataset>,
        key: &RegionCacheKey,
        value_column: &str,
    ) -> Result<Arc<Ix::Index>> {
        let inner = Arc::clone(&self.inner);
        let key_owned = key.clone();
        let value_column = value_column.to_owned();
        let slot = self.slot_for(key, move || {
            async move {
                inner
                    .populate_from_soda(remote, key_owned, value_column)
                    .await
            }
            .boxed()
        });
        slot.await
    }

    /// A snapshot of resolved entries as `(displayed key, size)`, largest
    /// first. In-flight and failed populations are omitted.
    pub fn indices_by_size_desc(&self) -> Vec<(String, usize)> {
        let slots = self.inner.lock_slots();
        let mut sizes = slots
            .iter()
            .filter_map(|(key, slot)| match slot.peek() {
                Some(Ok(index)) => Some((key.to_string(), Ix::size_of(index))),
                _ => None,
            })
            .collect::<Vec<_>>();
        sizes.sort_by(|a, b| b.1.cmp(&a.1));
        sizes
    }

    /// The depressurization primitive: drop the smallest resolved entry.
    /// Ties go to the least-recently-used entry. Returns what was evicted.
    pub fn evict_smallest(&self) -> Option<(RegionCacheKey, usize)> {
        self.inner.evict_smallest_entry()
    }

    /// Remove every entry. In-flight populations keep running, but their
    /// results are no longer retained. Mostly for test harnesses.
    pub fn reset(&self) {
        let mut slots = self.inner.lock_slots();
        slots.clear();
        CacheInner::<Ix>::record_entries(0);
    }

    /// How many slots (resolved, in-flight, or failed) the cache holds.
    pub fn len(&self) -> usize {
        self.inner.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The governor this cache depressurizes against.
    pub fn governor(&self) -> &Arc<MemoryGovernor> {
        &self.inner.governor
    }

    /// Start the background pressure loop: poll the governor once per
    /// iteration interval and evict smallest-first while memory is short.
    ///
    /// Returns `None` when depressurization is disabled. The task holds
    /// only a weak handle, so it winds down once the cache is dropped.
    pub fn spawn_depressurizer(&self) -> Option<JoinHandle<()>> {
        if !self.inner.enable_depressurize {
            return None;
        }
        let governor = Arc::clone(&self.inner.governor);
        let inner = Arc::downgrade(&self.inner);
        let period = governor
            .iteration_interval()
            .max(Duration::from_millis(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match inner.upgrade() {
                    Some(inner) => governor.depressurize(&*inner),
                    None => break,
                }
            }
        }))
    }

    /// Find the slot for `key`, installing a freshly spawned population
    /// (built by `populate`) if there is none. This is the single point
    /// where the slot table is read and written, and it happens under one
    /// lock acquisition.
    fn slot_for(
        &self,
        key: &RegionCacheKey,
        populate: impl FnOnce() -> BoxFuture<'static, Result<Arc<Ix::Index>>>,
    ) -> SharedBuild<Ix::Index> {
        let mut slots = self.inner.lock_slots();
        if let Some(existing) = slots.get(key) {
            trace!("cache hit for {}", key);
            return existing.clone();
        }

        trace!("populating cache entry for {}", key);
        // Spawn the population so it proceeds even if every caller goes
        // away; later callers for the same key still want the result.
        let task = tokio::spawn(populate());
        let slot: SharedBuild<Ix::Index> = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::BuildFailed(err.to_string())),
            }
        }
        .boxed()
        .shared();
        if let Some((evicted, _)) = slots.push(key.clone(), slot.clone()) {
            debug!("capacity eviction of {}", evicted);
        }
        CacheInner::<Ix>::record_entries(slots.len());
        slot
    }
}

impl<Ix: RegionIndexer> CacheInner<Ix> {
    fn lock_slots(
        &self,
    ) -> std::sync::MutexGuard<'_, LruCache<RegionCacheKey, SharedBuild<Ix::Index>>>
    {
        self.slots.lock().expect("slot table lock poisoned")
    }

    /// Build an index from caller-supplied features.
    fn build_local(
        self: Arc<Self>,
        features: FeatureCollection,
        column: String,
    ) -> Result<Arc<Ix::Index>> {
        self.prep_for_caching()?;
        let mut pace = self.pacer();
        let start = Instant::now();
        let index = self
            .indexer
            .build_from_features(&features, &column, &mut *pace)?;
        histogram!(
            "regioncode.region_cache.build.duration_seconds",
            start.elapsed().as_secs_f64(),
            "cache" => Ix::KIND
        );
        Ok(Arc::new(index))
    }

    /// Fetch features for `key` from the remote dataset and build an index
    /// from them.
    #[instrument(
        name = "RegionCache::populate_from_soda",
        level = "debug",
        skip_all,
        fields(key = %key)
    )]
    async fn populate_from_soda(
        self: Arc<Self>,
        remote: Arc<dyn RemoteDataset>,
        key: RegionCacheKey,
        value_column: String,
    ) -> Result<Arc<Ix::Index>> {
        self.prep_for_caching()?;

        let params = soda::region_query(&key.column, key.envelope.as_ref());
        let fetch_start = Instant::now();
        let result = remote.query(&key.resource, GEOJSON_FORMAT, &params).await;
        histogram!(
            "regioncode.region_cache.fetch.duration_seconds",
            fetch_start.elapsed().as_secs_f64(),
            "cache" => Ix::KIND
        );
        let body = result.check(200)?;
        let collection = soda::feature_collection(body)?;

        let mut pace = self.pacer();
        let build_start = Instant::now();
        let index = self.indexer.build_from_feature_json(
            &collection,
            &key.resource,
            &key.column,
            &value_column,
            &mut *pace,
        )?;
        histogram!(
            "regioncode.region_cache.build.duration_seconds",
            build_start.elapsed().as_secs_f64(),
            "cache" => Ix::KIND
        );
        Ok(Arc::new(index))
    }

    /// Run before a population allocates: give the indexer its hook, then
    /// make sure we aren't about to build into a full heap.
    fn prep_for_caching(&self) -> Result<()> {
        self.indexer.prep_for_caching(&self.governor)?;
        if self.enable_depressurize {
            self.governor.depressurize(self);
            self.governor
                .ensure_free(self.governor.min_free_percentage())?;
        }
        Ok(())
    }

    /// The cooperative yield point handed to decoders: every thousand
    /// features, give memory reclamation a chance to run.
    fn pacer(self: &Arc<Self>) -> Box<dyn FnMut() + Send> {
        if self.enable_depressurize {
            let inner = Arc::clone(self);
            Box::new(move || inner.governor.depressurize(&*inner))
        } else {
            Box::new(|| {})
        }
    }

    /// Drop the smallest resolved entry. In-flight and failed populations
    /// are not candidates: the former have no size yet, and evicting the
    /// latter frees nothing worth having.
    fn evict_smallest_entry(&self) -> Option<(RegionCacheKey, usize)> {
        let mut slots = self.lock_slots();
        let mut victim: Option<(RegionCacheKey, usize)> = None;
        for (key, slot) in slots.iter() {
            if let Some(Ok(index)) = slot.peek() {
                let size = Ix::size_of(index);
                // Iteration runs newest-first, so `<=` leaves us holding
                // the least-recently-used entry among equals.
                if victim
                    .as_ref()
                    .map_or(true, |(_, smallest)| size <= *smallest)
                {
                    victim = Some((key.clone(), size));
                }
            }
        }
        let (key, size) = victim?;
        slots.pop(&key);
        Self::record_entries(slots.len());
        debug!("evicted {} ({} size units) under memory pressure", key, size);
        Some((key, size))
    }

    fn record_entries(len: usize) {
        gauge!(
            "regioncode.region_cache.entries",
            len as f64,
            "cache" => Ix::KIND
        );
    }
}

impl<Ix: RegionIndexer> Depressurizable for CacheInner<Ix> {
    fn evict_smallest(&self) -> bool {
        self.evict_smallest_entry().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use geo_types::point;

    use super::*;

    fn hash_of(envelope: &Envelope) -> u64 {
        let mut hasher = DefaultHasher::new();
        envelope.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn envelope_equality_and_hashing_are_bitwise() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let c = Envelope::new(0.0, 0.0, 1.0, 2.0);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn envelope_covering_points() {
        assert_eq!(Envelope::covering(&[]), None);
        let points = vec![
            point!(x: 3.0, y: -1.0),
            point!(x: -2.0, y: 4.0),
            point!(x: 0.0, y: 0.0),
        ];
        assert_eq!(
            Envelope::covering(&points),
            Some(Envelope::new(-2.0, -1.0, 3.0, 4.0)),
        );
    }

    #[test]
    fn key_display_drops_the_envelope() {
        let plain = RegionCacheKey::new("wards-2024", "ward");
        let narrowed = RegionCacheKey::with_envelope(
            "wards-2024",
            "ward",
            Envelope::new(0.0, 0.0, 1.0, 1.0),
        );
        assert_eq!(plain.to_string(), "wards-2024/ward");
        assert_eq!(narrowed.to_string(), "wards-2024/ward");
        assert_ne!(plain, narrowed);
    }

    #[test]
    fn config_deserializes_from_kebab_case() {
        let config: RegionCacheConfig = serde_json::from_value(serde_json::json!({
            "max-entries": 7,
            "enable-depressurize": false,
            "min-free-percentage": 10,
            "target-free-percentage": 30,
            "iteration-interval": 250,
        }))
        .unwrap();
        assert_eq!(config.max_entries, 7);
        assert!(!config.enable_depressurize);
        assert_eq!(config.min_free_percentage, 10);
        assert_eq!(config.target_free_percentage, 30);
        assert_eq!(config.iteration_interval, 250);
    }

    #[test]
    fn config_defaults_are_filled_in() {
        let config: RegionCacheConfig =
            serde_json::from_value(serde_json::json!({ "max-entries": 3 })).unwrap();
        assert_eq!(config.max_entries, 3);
        assert!(config.enable_depressurize);
    }
}
