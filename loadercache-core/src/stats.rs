use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring how often contexts are built, reused and dropped.
///
/// Counters start at zero and only ever increase for the lifetime of the
/// cache; they are never reset.
///
/// # Thread Safety
///
/// All operations use atomic increments with `Relaxed` ordering. Each logical
/// event is counted exactly once; the relative order in which concurrent
/// increments become visible is not guaranteed.
///
/// # Examples
///
/// ```
/// use loadercache_core::CacheStats;
///
/// let stats = CacheStats::new();
///
/// stats.record_created();
/// stats.record_reused();
/// stats.record_reused();
///
/// assert_eq!(stats.created(), 1);
/// assert_eq!(stats.reused(), 2);
/// assert_eq!(stats.dropped(), 0);
/// assert!((stats.reuse_rate() - 0.6666).abs() < 0.001);
/// ```
#[derive(Debug, Default)]
pub struct CacheStats {
    created: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a context built by the factory and stored in the cache.
    #[inline]
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request served from an existing entry.
    #[inline]
    pub fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an entry removed or replaced because it went stale.
    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Total number of successful lookups (created + reused).
    #[inline]
    pub fn total_requests(&self) -> u64 {
        self.created() + self.reused()
    }

    /// Fraction of successful lookups served without building (0.0 to 1.0).
    ///
    /// Returns 0.0 if nothing has been requested yet.
    #[inline]
    pub fn reuse_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.reused() as f64 / total as f64
        }
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            created: self.created(),
            reused: self.reused(),
            dropped: self.dropped(),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub created: u64,
    pub reused: u64,
    pub dropped: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "new={} reused={} dropped={}",
            self.created, self.reused, self.dropped
        )
    }
}
