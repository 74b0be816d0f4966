use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::key::dedup_in_order;
use crate::probe::probe_or_unknown;
use crate::{
    stats_registry, BoxError, CacheConfig, CacheError, CacheResult, CacheStats, CachedContext,
    FreshnessToken, LoaderContextEntry, LoaderContextKey, MetadataProbe, Parent, StatsSnapshot,
    StrategyRef, UrlMetadataProbe,
};

/// Builds loader contexts on a cache miss.
///
/// The cache treats construction as a black box: it hands over the
/// de-duplicated resource list in the caller's order, the parent and the
/// strategy, and stores whatever comes back.
pub trait ContextFactory: Send + Sync {
    type Context: Send + Sync + 'static;

    fn build(
        &self,
        resources: &[Url],
        parent: Option<&Parent<Self::Context>>,
        strategy: Option<&StrategyRef>,
    ) -> Result<Self::Context, BoxError>;
}

/// Adapts a closure into a [`ContextFactory`].
///
/// # Examples
///
/// ```
/// use loadercache_core::{ContextCache, FnFactory};
/// use url::Url;
///
/// let factory = FnFactory::new(|resources: &[Url], _parent, _strategy| {
///     Ok(resources.len())
/// });
/// let cache = ContextCache::new(factory);
///
/// let urls = [Url::parse("file:///lib/a.jar").unwrap()];
/// let context = cache.get_or_create(&urls, None, None, false).unwrap();
/// assert_eq!(*context, 1);
/// ```
pub struct FnFactory<F, C> {
    build: F,
    _context: PhantomData<fn() -> C>,
}

impl<F, C> FnFactory<F, C>
where
    F: Fn(&[Url], Option<&Parent<C>>, Option<&StrategyRef>) -> Result<C, BoxError> + Send + Sync,
    C: Send + Sync + 'static,
{
    pub fn new(build: F) -> Self {
        Self {
            build,
            _context: PhantomData,
        }
    }
}

impl<F, C> ContextFactory for FnFactory<F, C>
where
    F: Fn(&[Url], Option<&Parent<C>>, Option<&StrategyRef>) -> Result<C, BoxError> + Send + Sync,
    C: Send + Sync + 'static,
{
    type Context = C;

    fn build(
        &self,
        resources: &[Url],
        parent: Option<&Parent<C>>,
        strategy: Option<&StrategyRef>,
    ) -> Result<C, BoxError> {
        (self.build)(resources, parent, strategy)
    }
}

type EntryRef<C> = Arc<LoaderContextEntry<C>>;

/// Per-key state. `build` serializes construction and removal for the key;
/// `entry` is read without it on the hit path.
struct Slot<C> {
    entry: RwLock<Option<EntryRef<C>>>,
    build: Mutex<BuildState>,
}

#[derive(Default)]
struct BuildState {
    // Set once the slot has been unlinked from the map. Callers that were
    // waiting on it must start over with a fresh lookup.
    retired: bool,
}

impl<C> Slot<C> {
    fn new() -> Self {
        Self {
            entry: RwLock::new(None),
            build: Mutex::new(BuildState::default()),
        }
    }

    fn current(&self) -> Option<EntryRef<C>> {
        self.entry.read().clone()
    }

    fn active(&self) -> Option<EntryRef<C>> {
        self.current().filter(|entry| entry.is_active())
    }
}

/// A thread-safe cache of loader contexts.
///
/// At most one context exists per [`LoaderContextKey`]. Contexts requested as
/// volatile are re-checked by [`refresh`](Self::refresh), which evicts every
/// entry whose resources changed so the next request rebuilds it.
///
/// # Thread Safety
///
/// Entries live in per-key slots inside a `DashMap`:
///
/// 1. **Hits** take a shard read lock and the slot's `RwLock` read lock only
/// 2. **Misses** take the slot's build `Mutex`; concurrent requests for the same
///    key wait there and reuse the first result, other keys are unaffected
/// 3. **Refresh** snapshots volatile entries, probes with no lock held, then
///    removes stale entries under the same build `Mutex`
///
/// A slot's build `Mutex` is never taken while a map shard lock is held.
///
/// # Examples
///
/// ```
/// use loadercache_core::{ContextCache, FnFactory};
/// use url::Url;
///
/// let cache = ContextCache::new(FnFactory::new(|resources: &[Url], _, _| {
///     Ok(resources.iter().map(|u| u.to_string()).collect::<Vec<_>>())
/// }));
///
/// let a = Url::parse("file:///lib/a.jar").unwrap();
/// let b = Url::parse("file:///lib/b.jar").unwrap();
///
/// let first = cache.get_or_create(&[a.clone(), b.clone()], None, None, false).unwrap();
/// let second = cache.get_or_create(&[b, a], None, None, false).unwrap();
///
/// assert!(loadercache_core::CachedContext::ptr_eq(&first, &second));
/// assert_eq!(cache.stat("new"), 1);
/// assert_eq!(cache.stat("reused"), 1);
/// ```
pub struct ContextCache<F: ContextFactory> {
    factory: F,
    probe: Arc<dyn MetadataProbe>,
    config: CacheConfig,
    slots: DashMap<Arc<LoaderContextKey>, Arc<Slot<F::Context>>>,
    // Address of each cached context, so a bare `Arc` of one is still
    // recognised as a cache-managed parent.
    managed: DashMap<usize, Arc<LoaderContextKey>>,
    stats: CacheStats,
}

impl<F: ContextFactory> ContextCache<F> {
    /// Creates a cache with the default configuration and [`UrlMetadataProbe`].
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, CacheConfig::default())
    }

    /// Creates a cache with `config`; the default probe uses its timeout and user agent.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadercache_core::{CacheConfig, ContextCache, FnFactory, TokenCapture};
    /// use std::time::Duration;
    /// use url::Url;
    ///
    /// let config = CacheConfig::default()
    ///     .with_probe_timeout(Duration::from_secs(2))
    ///     .with_token_capture(TokenCapture::VolatileOnly);
    /// let cache = ContextCache::with_config(
    ///     FnFactory::new(|resources: &[Url], _, _| Ok(resources.len())),
    ///     config,
    /// );
    /// assert_eq!(cache.config().probe_timeout, Duration::from_secs(2));
    /// ```
    pub fn with_config(factory: F, config: CacheConfig) -> Self {
        let probe = Arc::new(UrlMetadataProbe::new(&config));
        Self {
            factory,
            probe,
            config,
            slots: DashMap::new(),
            managed: DashMap::new(),
            stats: CacheStats::new(),
        }
    }

    /// Replaces the metadata probe used for freshness tokens.
    pub fn with_probe<P: MetadataProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the context for the request, building it on a miss.
    ///
    /// # Behavior
    ///
    /// - **Hit**: the cached context is returned and `REUSED` incremented. A
    ///   volatile request promotes a non-volatile entry; nothing demotes one.
    /// - **Miss** (or a stale entry): the factory builds a new context, a
    ///   freshness token is captured per resource, the entry replaces any
    ///   previous one and `NEW` is incremented (`DROPPED` as well when an
    ///   entry was replaced).
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidArgument`] if `resources` is empty
    /// - [`CacheError::ConstructionFailed`] if the factory fails; the cache is
    ///   left as it was for that key
    pub fn get_or_create(
        &self,
        resources: &[Url],
        parent: Option<&Parent<F::Context>>,
        strategy: Option<&StrategyRef>,
        volatile: bool,
    ) -> CacheResult<CachedContext<F::Context>> {
        let parent = parent.map(|p| self.resolve_parent(p));
        let parent = parent.as_ref();
        let key = Arc::new(LoaderContextKey::new(resources, parent, strategy)?);

        let existing = self.slots.get(&key).map(|slot| Arc::clone(slot.value()));
        if let Some(entry) = existing.and_then(|slot| slot.active()) {
            return Ok(self.reuse(&entry, volatile));
        }

        loop {
            let slot = Arc::clone(
                self.slots
                    .entry(Arc::clone(&key))
                    .or_insert_with(|| Arc::new(Slot::new()))
                    .value(),
            );

            let mut state = slot.build.lock();
            if state.retired {
                trace!(key = %key, "slot retired while waiting, retrying lookup");
                continue;
            }

            let prior = slot.current();
            if let Some(entry) = prior.as_ref().filter(|entry| entry.is_active()) {
                return Ok(self.reuse(entry, volatile));
            }

            let entry = match self.build_entry(&key, resources, parent, strategy, volatile) {
                Ok(entry) => entry,
                Err(err) => {
                    if prior.is_none() {
                        state.retired = true;
                        self.slots.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));
                    }
                    return Err(err);
                }
            };

            *slot.entry.write() = Some(Arc::clone(&entry));
            self.managed
                .insert(context_addr(&entry.context), Arc::clone(&key));
            self.stats.record_created();

            if let Some(prior) = prior {
                self.managed.remove(&context_addr(&prior.context));
                if prior.mark_evicted() {
                    self.stats.record_dropped();
                    info!(key = %key, "replaced stale loader context");
                }
            }

            return Ok(entry.handle());
        }
    }

    /// Gives an external parent that is in fact one of our contexts its managed identity.
    fn resolve_parent(&self, parent: &Parent<F::Context>) -> Parent<F::Context> {
        if let Parent::External(context) = parent {
            if let Some(key) = self.managed.get(&context_addr(context)) {
                return Parent::Managed(CachedContext::new(
                    Arc::clone(context),
                    Arc::clone(key.value()),
                ));
            }
        }
        parent.clone()
    }

    fn reuse(
        &self,
        entry: &LoaderContextEntry<F::Context>,
        volatile: bool,
    ) -> CachedContext<F::Context> {
        self.stats.record_reused();
        if volatile && entry.promote_volatile() {
            debug!(key = %entry.key, "promoted cached loader context to volatile");
        }
        trace!(key = %entry.key, "reusing cached loader context");
        entry.handle()
    }

    fn build_entry(
        &self,
        key: &Arc<LoaderContextKey>,
        resources: &[Url],
        parent: Option<&Parent<F::Context>>,
        strategy: Option<&StrategyRef>,
        volatile: bool,
    ) -> CacheResult<EntryRef<F::Context>> {
        let ordered = dedup_in_order(resources);
        let started = Instant::now();

        let context = self
            .factory
            .build(&ordered, parent, strategy)
            .map_err(|source| {
                warn!(key = %key, error = %source, "loader context construction failed");
                CacheError::construction_failed(&ordered, source)
            })?;

        let capture = self.config.token_capture.should_capture(volatile);
        let tokens = ordered
            .into_iter()
            .map(|location| {
                let token = if capture {
                    probe_or_unknown(self.probe.as_ref(), &location)
                } else {
                    FreshnessToken::Unknown
                };
                (location, token)
            })
            .collect();

        debug!(
            key = %key,
            volatile,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built loader context"
        );

        Ok(Arc::new(LoaderContextEntry::new(
            Arc::clone(key),
            Arc::new(context),
            tokens,
            volatile,
        )))
    }

    /// Re-probes every volatile entry and evicts the ones whose resources changed.
    ///
    /// A resource whose probe fails counts as changed. Each distinct location
    /// is probed at most once per call, and no cache-wide lock is held while
    /// probing. Contexts already handed out stay valid to their holders.
    ///
    /// Returns true if any entry was found stale.
    pub fn refresh(&self) -> bool {
        let candidates: Vec<_> = self
            .slots
            .iter()
            .filter_map(|item| {
                item.value()
                    .active()
                    .filter(|entry| entry.is_volatile())
                    .map(|entry| (Arc::clone(item.key()), Arc::clone(item.value()), entry))
            })
            .collect();

        if candidates.is_empty() {
            return false;
        }
        debug!(count = candidates.len(), "refreshing volatile loader contexts");

        let mut observed: HashMap<Url, FreshnessToken> = HashMap::new();
        let mut stale = Vec::new();
        for (key, slot, entry) in candidates {
            let changed = entry.has_changed(|location| {
                observed
                    .entry(location.clone())
                    .or_insert_with(|| probe_or_unknown(self.probe.as_ref(), location))
                    .clone()
            });
            if changed && entry.mark_stale() {
                stale.push((key, slot, entry));
            }
        }

        let changed = !stale.is_empty();
        for (key, slot, entry) in stale {
            self.evict(&key, &slot, &entry, "resources changed");
        }
        changed
    }

    /// Removes `entry` if it is still the current entry of `slot`.
    fn evict(
        &self,
        key: &Arc<LoaderContextKey>,
        slot: &Arc<Slot<F::Context>>,
        entry: &EntryRef<F::Context>,
        reason: &str,
    ) -> bool {
        let mut state = slot.build.lock();
        self.evict_locked(&mut state, key, slot, entry, reason)
    }

    /// Body of [`evict`](Self::evict); the caller holds `slot`'s build lock.
    fn evict_locked(
        &self,
        state: &mut BuildState,
        key: &Arc<LoaderContextKey>,
        slot: &Arc<Slot<F::Context>>,
        entry: &EntryRef<F::Context>,
        reason: &str,
    ) -> bool {
        if state.retired {
            return false;
        }

        {
            let mut current = slot.entry.write();
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, entry) => {
                    current.take();
                }
                // Already replaced by a concurrent rebuild, which did the accounting.
                _ => return false,
            }
        }

        state.retired = true;
        self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, slot));
        self.managed.remove(&context_addr(&entry.context));
        if entry.mark_evicted() {
            self.stats.record_dropped();
        }
        info!(key = %key, reason, "evicted loader context");
        true
    }

    fn entry_for(
        &self,
        context: &CachedContext<F::Context>,
    ) -> Option<(Arc<Slot<F::Context>>, EntryRef<F::Context>)> {
        let slot = self.slots.get(context.key()).map(|s| Arc::clone(s.value()))?;
        let shared = context.shared();
        let entry = slot
            .current()
            .filter(|entry| Arc::ptr_eq(&entry.context, &shared))?;
        Some((slot, entry))
    }

    /// Sets the volatility of the entry backing `context`, promoting or demoting it.
    ///
    /// Returns false if `context` is no longer the cached context for its key.
    pub fn set_volatile(&self, context: &CachedContext<F::Context>, volatile: bool) -> bool {
        match self.entry_for(context) {
            Some((_, entry)) => {
                let previous = entry.set_volatile(volatile);
                if previous != volatile {
                    debug!(key = %entry.key, volatile, "changed loader context volatility");
                }
                true
            }
            None => false,
        }
    }

    /// Returns whether the entry backing `context` is checked by refresh.
    pub fn is_volatile(&self, context: &CachedContext<F::Context>) -> Option<bool> {
        self.entry_for(context).map(|(_, entry)| entry.is_volatile())
    }

    /// Evicts the entry backing `context`, counting it as dropped.
    ///
    /// Returns false if `context` is no longer cached.
    pub fn invalidate(&self, context: &CachedContext<F::Context>) -> bool {
        match self.entry_for(context) {
            Some((slot, entry)) => self.evict(context.key(), &slot, &entry, "invalidated"),
            None => false,
        }
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|item| item.value().current().is_some())
            .count()
    }

    /// Returns true if no context is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Copies the three counters at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reads a counter by name (`NEW`, `REUSED`, `DROPPED`, any case); unknown names yield 0.
    pub fn stat(&self, name: &str) -> u64 {
        stats_registry::lookup(&self.stats, name)
    }

    /// Names accepted by [`stat`](Self::stat), in a stable order.
    pub fn stat_names(&self) -> &'static [&'static str] {
        stats_registry::names()
    }
}

fn context_addr<C>(context: &Arc<C>) -> usize {
    Arc::as_ptr(context) as usize
}

impl<F: ContextFactory> fmt::Debug for ContextCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCache")
            .field("entries", &self.len())
            .field("stats", &self.stats.snapshot())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProbeError, ResourceMetadata, ResolutionStrategy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    /// Probe answering from a table the test can edit.
    #[derive(Clone, Default)]
    struct TableProbe {
        tokens: Arc<Mutex<HashMap<Url, u64>>>,
        calls: Arc<AtomicUsize>,
    }

    impl TableProbe {
        fn set(&self, url: &Url, version: u64) {
            self.tokens.lock().insert(url.clone(), version);
        }

        fn remove(&self, url: &Url) {
            self.tokens.lock().remove(url);
        }
    }

    impl MetadataProbe for TableProbe {
        fn probe(&self, location: &Url) -> Result<FreshnessToken, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.tokens.lock().get(location) {
                Some(version) => Ok(ResourceMetadata {
                    length: Some(*version),
                    ..Default::default()
                }
                .into()),
                None => Err(ProbeError::Unavailable {
                    location: location.to_string(),
                    reason: "not in table".to_string(),
                }),
            }
        }
    }

    struct Strategy;
    impl ResolutionStrategy for Strategy {}

    /// Build number plus the resource list the factory was handed.
    type Built = (usize, Vec<Url>);
    type BuildFn = Box<
        dyn Fn(&[Url], Option<&Parent<Built>>, Option<&StrategyRef>) -> Result<Built, BoxError>
            + Send
            + Sync,
    >;
    type CountingFactory = FnFactory<BuildFn, Built>;

    fn counting_factory(builds: Arc<AtomicUsize>) -> CountingFactory {
        let build: BuildFn = Box::new(
            move |resources: &[Url],
                  _: Option<&Parent<Built>>,
                  _: Option<&StrategyRef>|
                  -> Result<Built, BoxError> {
                let n = builds.fetch_add(1, Ordering::SeqCst);
                Ok((n, resources.to_vec()))
            },
        );
        FnFactory::new(build)
    }

    fn cache_with(probe: TableProbe) -> (ContextCache<CountingFactory>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = ContextCache::new(counting_factory(Arc::clone(&builds))).with_probe(probe);
        (cache, builds)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_hit_returns_same_instance() {
        let (cache, builds) = cache_with(TableProbe::default());
        let urls = [url("file:///lib/a.jar")];

        let first = cache.get_or_create(&urls, None, None, false).unwrap();
        let second = cache.get_or_create(&urls, None, None, false).unwrap();
        let third = cache.get_or_create(&urls, None, None, false).unwrap();

        assert!(CachedContext::ptr_eq(&first, &second));
        assert!(CachedContext::ptr_eq(&first, &third));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().created(), 1);
        assert_eq!(cache.stats().reused(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_factory_receives_deduplicated_caller_order() {
        let (cache, _) = cache_with(TableProbe::default());
        let a = url("file:///lib/a.jar");
        let b = url("file:///lib/b.jar");

        let context = cache
            .get_or_create(&[b.clone(), a.clone(), b.clone()], None, None, false)
            .unwrap();
        assert_eq!(context.1, vec![b, a]);
    }

    #[test]
    fn test_empty_resources_rejected() {
        let (cache, builds) = cache_with(TableProbe::default());
        let err = cache.get_or_create(&[], None, None, false).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_construction_failure_leaves_no_entry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cache = ContextCache::new(FnFactory::new(move |_: &[Url], _: Option<&Parent<u8>>, _: Option<&StrategyRef>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u8, BoxError>("broken archive".into())
        }))
        .with_probe(TableProbe::default());

        let urls = [url("file:///lib/broken.jar")];
        for _ in 0..2 {
            match cache.get_or_create(&urls, None, None, false) {
                Err(CacheError::ConstructionFailed { source, .. }) => {
                    assert_eq!(source.to_string(), "broken archive")
                }
                other => panic!("expected construction failure, got {:?}", other.map(|_| ())),
            }
        }

        // Failures are not cached: each request retries the factory
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_parent_and_strategy_sensitivity() {
        let (cache, builds) = cache_with(TableProbe::default());
        let urls = [url("file:///lib/a.jar")];

        let root = cache.get_or_create(&[url("file:///lib/root.jar")], None, None, false).unwrap();
        let parent_a = Parent::Managed(root);
        let parent_b = Parent::External(Arc::new((99, Vec::new())));
        let s1: StrategyRef = Arc::new(Strategy);
        let s2: StrategyRef = Arc::new(Strategy);

        let plain = cache.get_or_create(&urls, None, None, false).unwrap();
        let with_a = cache.get_or_create(&urls, Some(&parent_a), None, false).unwrap();
        let with_b = cache.get_or_create(&urls, Some(&parent_b), None, false).unwrap();
        let with_s1 = cache.get_or_create(&urls, None, Some(&s1), false).unwrap();
        let with_s2 = cache.get_or_create(&urls, None, Some(&s2), false).unwrap();

        let all = [&plain, &with_a, &with_b, &with_s1, &with_s2];
        for (i, x) in all.iter().enumerate() {
            for y in &all[i + 1..] {
                assert!(!CachedContext::ptr_eq(x, y));
            }
        }
        assert_eq!(builds.load(Ordering::SeqCst), 6);
        assert_eq!(cache.stats().created(), 6);

        // Same parent handle again is a hit
        let again = cache.get_or_create(&urls, Some(&parent_a.clone()), None, false).unwrap();
        assert!(CachedContext::ptr_eq(&again, &with_a));
    }

    #[test]
    fn test_refresh_evicts_changed_volatile_entry() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        let b = url("http://repo.example.org/b.jar");
        probe.set(&a, 1);
        probe.set(&b, 1);

        let (cache, builds) = cache_with(probe.clone());
        let urls = [a.clone(), b.clone()];
        let before = cache.get_or_create(&urls, None, None, true).unwrap();

        assert!(!cache.refresh());
        assert_eq!(cache.stats().dropped(), 0);

        probe.set(&b, 2);
        assert!(cache.refresh());
        assert_eq!(cache.stats().dropped(), 1);
        assert!(cache.is_empty());

        // The evicted context stays usable by its holder
        assert_eq!(before.0, 0);

        let after = cache.get_or_create(&urls, None, None, true).unwrap();
        assert!(!CachedContext::ptr_eq(&before, &after));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().created(), 2);
        assert_eq!(cache.stats().reused(), 0);
    }

    #[test]
    fn test_refresh_ignores_non_volatile_entries() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        probe.set(&a, 1);

        let (cache, _) = cache_with(probe.clone());
        let first = cache.get_or_create(&[a.clone()], None, None, false).unwrap();

        probe.set(&a, 2);
        assert!(!cache.refresh());
        probe.remove(&a);
        assert!(!cache.refresh());

        let second = cache.get_or_create(&[a], None, None, false).unwrap();
        assert!(CachedContext::ptr_eq(&first, &second));
        assert_eq!(cache.stats().dropped(), 0);
    }

    #[test]
    fn test_probe_failure_at_build_forces_eviction() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");

        let (cache, _) = cache_with(probe.clone());
        cache.get_or_create(&[a.clone()], None, None, true).unwrap();

        // The resource is reachable now, but the build-time token is unknown
        probe.set(&a, 1);
        assert!(cache.refresh());
        assert_eq!(cache.stats().dropped(), 1);
    }

    #[test]
    fn test_probe_failure_during_refresh_evicts() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        probe.set(&a, 1);

        let (cache, _) = cache_with(probe.clone());
        cache.get_or_create(&[a.clone()], None, None, true).unwrap();

        probe.remove(&a);
        assert!(cache.refresh());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_volatile_request_promotes_entry() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        probe.set(&a, 1);

        let (cache, _) = cache_with(probe.clone());
        let context = cache.get_or_create(&[a.clone()], None, None, false).unwrap();
        assert_eq!(cache.is_volatile(&context), Some(false));

        cache.get_or_create(&[a.clone()], None, None, true).unwrap();
        assert_eq!(cache.is_volatile(&context), Some(true));

        // A later non-volatile request does not demote
        cache.get_or_create(&[a.clone()], None, None, false).unwrap();
        assert_eq!(cache.is_volatile(&context), Some(true));

        probe.set(&a, 2);
        assert!(cache.refresh());
    }

    #[test]
    fn test_explicit_demotion_makes_entry_immune() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        probe.set(&a, 1);

        let (cache, _) = cache_with(probe.clone());
        let context = cache.get_or_create(&[a.clone()], None, None, true).unwrap();
        assert!(cache.set_volatile(&context, false));

        probe.set(&a, 2);
        assert!(!cache.refresh());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refresh_probes_each_location_once() {
        let probe = TableProbe::default();
        let shared = url("http://repo.example.org/shared.jar");
        let a = url("http://repo.example.org/a.jar");
        let b = url("http://repo.example.org/b.jar");
        for u in [&shared, &a, &b] {
            probe.set(u, 1);
        }

        let (cache, _) = cache_with(probe.clone());
        cache.get_or_create(&[shared.clone(), a], None, None, true).unwrap();
        cache.get_or_create(&[shared, b], None, None, true).unwrap();

        let before = probe.calls.load(Ordering::SeqCst);
        assert!(!cache.refresh());
        assert_eq!(probe.calls.load(Ordering::SeqCst) - before, 3);
    }

    #[test]
    fn test_invalidate() {
        let (cache, builds) = cache_with(TableProbe::default());
        let urls = [url("file:///lib/a.jar")];

        let context = cache.get_or_create(&urls, None, None, false).unwrap();
        assert!(cache.invalidate(&context));
        assert!(!cache.invalidate(&context));
        assert!(!cache.set_volatile(&context, true));
        assert_eq!(cache.stats().dropped(), 1);

        cache.get_or_create(&urls, None, None, false).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        const THREADS: usize = 16;

        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let cache = Arc::new(
            ContextCache::new(FnFactory::new(move |_: &[Url], _: Option<&Parent<usize>>, _: Option<&StrategyRef>| {
                // Slow construction widens the race window
                thread::sleep(Duration::from_millis(50));
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }))
            .with_probe(TableProbe::default()),
        );
        let barrier = Arc::new(Barrier::new(THREADS));
        let urls = vec![url("file:///lib/a.jar"), url("file:///lib/b.jar")];

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let mut urls = urls.clone();
                if i % 2 == 1 {
                    urls.reverse();
                }
                thread::spawn(move || {
                    barrier.wait();
                    *cache.get_or_create(&urls, None, None, false).unwrap()
                })
            })
            .collect();

        let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(values.iter().all(|v| *v == 0));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().created(), 1);
        assert_eq!(cache.stats().reused(), (THREADS - 1) as u64);
    }

    #[test]
    fn test_unrelated_keys_do_not_wait() {
        let gate = Arc::new(Barrier::new(2));
        let factory_gate = Arc::clone(&gate);
        let slow = url("file:///lib/slow.jar");
        let slow_in_factory = slow.clone();

        let cache = Arc::new(
            ContextCache::new(FnFactory::new(move |resources: &[Url], _: Option<&Parent<String>>, _: Option<&StrategyRef>| {
                if resources[0] == slow_in_factory {
                    // Blocks until the fast key has been served
                    factory_gate.wait();
                }
                Ok(resources[0].to_string())
            }))
            .with_probe(TableProbe::default()),
        );

        let slow_cache = Arc::clone(&cache);
        let slow_handle = thread::spawn(move || slow_cache.get_or_create(&[slow], None, None, false).map(|c| c.to_string()));

        let fast = cache.get_or_create(&[url("file:///lib/fast.jar")], None, None, false).unwrap();
        assert_eq!(*fast, "file:///lib/fast.jar");
        gate.wait();

        assert_eq!(slow_handle.join().unwrap().unwrap(), "file:///lib/slow.jar");
    }

    #[test]
    fn test_stats_by_name() {
        let (cache, _) = cache_with(TableProbe::default());
        let urls = [url("file:///lib/a.jar")];
        cache.get_or_create(&urls, None, None, false).unwrap();
        cache.get_or_create(&urls, None, None, false).unwrap();

        assert_eq!(cache.stat("NEW"), 1);
        assert_eq!(cache.stat(" reused "), 1);
        assert_eq!(cache.stat("Dropped"), 0);
        assert_eq!(cache.stat("unknown"), 0);
        assert_eq!(cache.stat_names(), &["NEW", "REUSED", "DROPPED"]);
    }

    #[test]
    fn test_volatile_only_capture_skips_probes() {
        let probe = TableProbe::default();
        let a = url("http://repo.example.org/a.jar");
        probe.set(&a, 1);

        let builds = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig::default().with_token_capture(crate::TokenCapture::VolatileOnly);
        let cache = ContextCache::with_config(counting_factory(builds), config).with_probe(probe.clone());

        let context = cache.get_or_create(&[a.clone()], None, None, false).unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        // Promoted without a baseline token: the next refresh rebuilds it
        assert!(cache.set_volatile(&context, true));
        assert!(cache.refresh());
        assert_eq!(cache.stats().dropped(), 1);
    }

    #[test]
    fn test_cached_parent_passed_by_arc_shares_child() {
        let (cache, builds) = cache_with(TableProbe::default());
        let parent = cache
            .get_or_create(&[url("file:///lib/base.jar")], None, None, false)
            .unwrap();
        let plugin = [url("file:///plugins/p.jar")];

        let by_handle = cache
            .get_or_create(&plugin, Some(&Parent::Managed(parent.clone())), None, false)
            .unwrap();
        let by_arc = cache
            .get_or_create(&plugin, Some(&Parent::External(parent.shared())), None, false)
            .unwrap();

        assert!(CachedContext::ptr_eq(&by_handle, &by_arc));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().created(), 2);
        assert_eq!(cache.stats().reused(), 1);
    }

    #[test]
    fn test_evicted_parent_is_no_longer_managed() {
        let (cache, builds) = cache_with(TableProbe::default());
        let parent = cache
            .get_or_create(&[url("file:///lib/base.jar")], None, None, false)
            .unwrap();
        let plugin = [url("file:///plugins/p.jar")];

        let before = cache
            .get_or_create(&plugin, Some(&Parent::External(parent.shared())), None, false)
            .unwrap();
        assert!(cache.invalidate(&parent));

        // The same object, now outside the cache, is told apart by address
        let after = cache
            .get_or_create(&plugin, Some(&Parent::External(parent.shared())), None, false)
            .unwrap();
        assert!(!CachedContext::ptr_eq(&before, &after));
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_waiter_retries_after_failed_build() {
        let gate = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let build: BuildFn = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            Box::new(
                move |resources: &[Url],
                      _: Option<&Parent<Built>>,
                      _: Option<&StrategyRef>|
                      -> Result<Built, BoxError> {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        gate.wait();
                        thread::sleep(Duration::from_millis(100));
                        return Err("archive truncated".into());
                    }
                    Ok((n, resources.to_vec()))
                },
            )
        };
        let cache = Arc::new(
            ContextCache::new(FnFactory::new(build)).with_probe(TableProbe::default()),
        );
        let urls = vec![url("file:///lib/a.jar")];

        let request = |cache: &Arc<ContextCache<CountingFactory>>| {
            let cache = Arc::clone(cache);
            let urls = urls.clone();
            thread::spawn(move || cache.get_or_create(&urls, None, None, false).map(|c| c.0))
        };

        let first = request(&cache);
        // The failing build now holds the key's build lock
        gate.wait();
        let waiter = request(&cache);

        let first = first.join().unwrap();
        let waiter = waiter.join().unwrap();

        assert!(matches!(first, Err(CacheError::ConstructionFailed { .. })));
        assert_eq!(waiter.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().created(), 1);
        assert_eq!(cache.stats().dropped(), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.slots.len(), 1);
    }

    #[test]
    fn test_waiter_rebuilds_after_invalidation_unlinks_slot() {
        let (cache, builds) = cache_with(TableProbe::default());
        let cache = Arc::new(cache);
        let urls = vec![url("file:///lib/a.jar")];
        let old = cache.get_or_create(&urls, None, None, false).unwrap();
        let (slot, entry) = cache.entry_for(&old).unwrap();

        // Hold the key's build lock; a non-active entry sends callers to wait on it
        let mut state = slot.build.lock();
        assert!(entry.mark_stale());

        let waiter = {
            let cache = Arc::clone(&cache);
            let urls = urls.clone();
            thread::spawn(move || cache.get_or_create(&urls, None, None, false).unwrap())
        };
        thread::sleep(Duration::from_millis(100));

        assert!(cache.evict_locked(&mut state, old.key(), &slot, &entry, "invalidated"));
        drop(state);

        let fresh = waiter.join().unwrap();
        assert!(!CachedContext::ptr_eq(&old, &fresh));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().created(), 2);
        assert_eq!(cache.stats().reused(), 0);
        assert_eq!(cache.stats().dropped(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.slots.len(), 1);

        // The unlinked slot is inert: evicting through it again is a no-op
        assert!(!cache.invalidate(&old));
        assert_eq!(cache.stats().dropped(), 1);
    }
}
