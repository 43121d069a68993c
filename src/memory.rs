//! Process memory introspection and pressure-driven eviction.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

use crate::{CacheError, Result};

/// A cache the governor can bleed entries out of.
///
/// The governor only ever needs one primitive, so the seam stays this
/// narrow on purpose.
pub trait Depressurizable: Send + Sync {
    /// Evict the smallest resolved entry. Returns `false` when there is
    /// nothing left to evict.
    fn evict_smallest(&self) -> bool;
}

/// A snapshot of free memory as the operating system sees it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeStats {
    /// Free memory, in whole megabytes.
    pub free_mb: u64,
    /// Free memory as a percentage of the total, rounded down.
    pub free_pct: u8,
}

/// Free-memory probe and depressurization driver.
///
/// `free_pct` is `available * 100 / total`, using the operating system's
/// view of memory. That figure is only meaningful when this process is the
/// dominant consumer of the machine (or cgroup) it runs in, the moral
/// equivalent of a preallocated heap. Hosts that co-locate other large
/// processes on the same box should disable depressurization rather than
/// trust it.
pub struct MemoryGovernor {
    system: Mutex<System>,
    min_free_pct: u8,
    target_free_pct: u8,
    iteration_interval: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl MemoryGovernor {
    /// Create a governor that starts evicting below `min_free_pct` free
    /// memory, aims for `target_free_pct`, and sweeps at most once per
    /// `iteration_interval`.
    pub fn new(
        min_free_pct: u8,
        target_free_pct: u8,
        iteration_interval: Duration,
    ) -> MemoryGovernor {
        let refresh = RefreshKind::nothing()
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        MemoryGovernor {
            system: Mutex::new(System::new_with_specifics(refresh)),
            min_free_pct,
            target_free_pct,
            iteration_interval,
            last_sweep: Mutex::new(None),
        }
    }

    /// Take a fresh reading of free memory.
    pub fn free_stats(&self) -> FreeStats {
        let mut system = self.system.lock().expect("memory probe lock poisoned");
        system.refresh_memory();
        let total = system.total_memory();
        let free = system.available_memory();
        let free_pct = if total == 0 {
            100
        } else {
            (free.saturating_mul(100) / total) as u8
        };
        FreeStats {
            free_mb: free / (1024 * 1024),
            free_pct,
        }
    }

    /// Is at least `min_pct` of memory free right now?
    pub fn at_least_free(&self, min_pct: u8) -> bool {
        self.free_stats().free_pct >= min_pct
    }

    /// Fail with [`CacheError::OutOfMemoryPressure`] unless at least
    /// `min_pct` of memory is free. Call this before a large allocation.
    pub fn ensure_free(&self, min_pct: u8) -> Result<()> {
        let stats = self.free_stats();
        if stats.free_pct < min_pct {
            Err(CacheError::OutOfMemoryPressure {
                free_pct: stats.free_pct,
                min_pct,
            })
        } else {
            Ok(())
        }
    }

    /// The floor below which depressurization starts.
    pub fn min_free_percentage(&self) -> u8 {
        self.min_free_pct
    }

    /// Minimum wall-clock time between depressurization sweeps.
    pub fn iteration_interval(&self) -> Duration {
        self.iteration_interval
    }

    /// If free memory is below the floor, evict the smallest entries from
    /// `cache` until the target is met or the cache runs dry.
    ///
    /// Sweeps are rate-limited to one per iteration interval, so the tight
    /// decode loops that call this every thousand features don't spend
    /// their time probing the OS.
    pub fn depressurize(&self, cache: &dyn Depressurizable) {
        {
            let mut last = self.last_sweep.lock().expect("sweep clock lock poisoned");
            match *last {
                Some(at) if at.elapsed() < self.iteration_interval => return,
                _ => *last = Some(Instant::now()),
            }
        }

        let mut stats = self.free_stats();
        if stats.free_pct >= self.min_free_pct {
            return;
        }
        debug!(
            "memory pressure: {}% free, evicting toward {}%",
            stats.free_pct, self.target_free_pct
        );
        while stats.free_pct < self.target_free_pct {
            if !cache.evict_smallest() {
                debug!("nothing left to evict at {}% free", stats.free_pct);
                return;
            }
            stats = self.free_stats();
        }
        debug!("memory pressure relieved at {}% free", stats.free_pct);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingCache {
        remaining: AtomicUsize,
        evictions: AtomicUsize,
    }

    impl CountingCache {
        fn with_entries(n: usize) -> CountingCache {
            CountingCache {
                remaining: AtomicUsize::new(n),
                evictions: AtomicUsize::new(0),
            }
        }
    }

    impl Depressurizable for CountingCache {
        fn evict_smallest(&self) -> bool {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return false;
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.evictions.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn free_stats_are_sane() {
        let governor = MemoryGovernor::new(20, 40, Duration::from_millis(100));
        let stats = governor.free_stats();
        assert!(stats.free_pct <= 100);
        assert!(governor.at_least_free(0));
        assert!(governor.ensure_free(0).is_ok());
    }

    #[test]
    fn ensure_free_fails_below_the_floor() {
        let governor = MemoryGovernor::new(20, 40, Duration::from_millis(100));
        // 101% free is unattainable, so this must always fail.
        let err = governor.ensure_free(101).unwrap_err();
        assert!(matches!(
            err,
            CacheError::OutOfMemoryPressure { min_pct: 101, .. }
        ));
    }

    #[test]
    fn depressurize_drains_the_cache_when_the_target_is_unattainable() {
        // min 100 / target 101 forces the loop to run until the cache is
        // dry, whatever the machine's actual memory looks like.
        let governor = MemoryGovernor::new(100, 101, Duration::from_secs(3600));
        let cache = CountingCache::with_entries(3);
        governor.depressurize(&cache);
        assert_eq!(cache.evictions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let governor = MemoryGovernor::new(100, 101, Duration::from_secs(3600));
        let cache = CountingCache::with_entries(2);
        governor.depressurize(&cache);
        assert_eq!(cache.evictions.load(Ordering::SeqCst), 2);

        // Within the iteration interval, another sweep is a no-op even
        // though the cache has refilled.
        cache.remaining.store(2, Ordering::SeqCst);
        governor.depressurize(&cache);
        assert_eq!(cache.evictions.load(Ordering::SeqCst), 2);
    }
}
