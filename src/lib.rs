//! # Loadercache
//!
//! A thread-safe cache for expensive loader contexts: runtime objects built
//! from an ordered set of resource URLs, an optional parent context and an
//! optional resolution strategy.
//!
//! ## Features
//!
//! - **Reuse**: equivalent requests get the same context instance, whatever
//!   the order or repetition of their URLs
//! - **One build per key**: concurrent requests for a context wait for a single construction
//! - **Volatile contexts**: opt-in freshness checks that evict contexts whose
//!   resources changed since they were built
//! - **Statistics**: `NEW`, `REUSED` and `DROPPED` counters, readable by name
//!
//! ## Quick Start
//!
//! ```rust
//! use loadercache::{ContextOptions, FnFactory, LoaderCache, Url};
//!
//! #[derive(Debug)]
//! struct Loader {
//!     urls: Vec<Url>,
//! }
//!
//! let cache = LoaderCache::new(FnFactory::new(|urls: &[Url], _, _| {
//!     Ok(Loader { urls: urls.to_vec() })
//! }));
//!
//! let urls = [
//!     Url::parse("file:///opt/app/lib/a.jar").unwrap(),
//!     Url::parse("file:///opt/app/lib/b.jar").unwrap(),
//! ];
//!
//! let loader = cache.get_context(&urls, ContextOptions::default()).unwrap();
//! let again = cache.get_context(&urls, ContextOptions::default()).unwrap();
//!
//! assert_eq!(loader.urls.len(), 2);
//! assert_eq!(cache.get_stats("NEW"), 1);
//! assert_eq!(cache.get_stats("REUSED"), 1);
//! # drop(again);
//! ```
//!
//! ## Volatile Contexts
//!
//! A context requested with `volatile(true)` is re-checked every time
//! [`LoaderCache::refresh_cache`] runs. Each resource gets one lightweight
//! metadata probe (`HEAD` for HTTP, filesystem metadata for files); any
//! difference, or any probe failure, evicts the context and the next request
//! rebuilds it. Probing costs a request per URL, so keep volatile contexts
//! for resources that really do change.
//!
//! ```rust,no_run
//! use loadercache::{ContextOptions, FnFactory, LoaderCache, Url};
//!
//! let cache = LoaderCache::new(FnFactory::new(|urls: &[Url], _, _| Ok(urls.len())));
//! let urls = [Url::parse("https://repo.example.org/plugins/current.jar").unwrap()];
//!
//! cache
//!     .get_context(&urls, ContextOptions::default().volatile(true))
//!     .unwrap();
//!
//! // Later, on the host's own schedule:
//! if cache.refresh_cache() {
//!     println!("some contexts were dropped");
//! }
//! ```

use parking_lot::RwLock;
use tracing::debug;

pub use loadercache_core::*;

/// Which parent a request should use.
enum ParentChoice<C> {
    Ambient,
    Detached,
    Explicit(Parent<C>),
}

/// Optional parameters of [`LoaderCache::get_context`].
///
/// | Field      | Default                              | Effect                                   |
/// |------------|--------------------------------------|------------------------------------------|
/// | `parent`   | the cache's ambient parent, if any   | delegation target, part of the key       |
/// | `strategy` | none                                 | handed to the factory, part of the key   |
/// | `volatile` | `false`                              | checked by `refresh_cache` when true     |
///
/// # Examples
///
/// ```
/// use loadercache::ContextOptions;
///
/// let options = ContextOptions::<()>::default().volatile(true).without_parent();
/// assert!(options.is_volatile());
/// ```
pub struct ContextOptions<C> {
    parent: ParentChoice<C>,
    strategy: Option<StrategyRef>,
    volatile: bool,
}

impl<C> ContextOptions<C> {
    pub fn new() -> Self {
        Self {
            parent: ParentChoice::Ambient,
            strategy: None,
            volatile: false,
        }
    }

    /// Uses `parent` instead of the ambient parent.
    pub fn with_parent(mut self, parent: impl Into<Parent<C>>) -> Self {
        self.parent = ParentChoice::Explicit(parent.into());
        self
    }

    /// Requests a context with no parent at all, ignoring the ambient one.
    pub fn without_parent(mut self) -> Self {
        self.parent = ParentChoice::Detached;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyRef) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn volatile(mut self, volatile: bool) -> Self {
        self.volatile = volatile;
        self
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }
}

impl<C> Default for ContextOptions<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-facing loader cache.
///
/// Wraps a [`ContextCache`] with the ambient parent a host usually wants
/// applied to every request, and exposes the four operations hosts call:
/// [`get_context`](Self::get_context), [`refresh_cache`](Self::refresh_cache),
/// [`get_stats`](Self::get_stats) and [`get_stat_names`](Self::get_stat_names).
///
/// Construct one per process and share it (for example behind an `Arc`).
pub struct LoaderCache<F: ContextFactory> {
    cache: ContextCache<F>,
    ambient_parent: RwLock<Option<Parent<F::Context>>>,
}

impl<F: ContextFactory> LoaderCache<F> {
    /// Creates a loader cache with the default configuration and no ambient parent.
    pub fn new(factory: F) -> Self {
        Self::from_cache(ContextCache::new(factory))
    }

    pub fn with_config(factory: F, config: CacheConfig) -> Self {
        Self::from_cache(ContextCache::with_config(factory, config))
    }

    /// Wraps an already configured cache (custom probe, for instance).
    pub fn from_cache(cache: ContextCache<F>) -> Self {
        Self {
            cache,
            ambient_parent: RwLock::new(None),
        }
    }

    /// Sets the parent used by requests that do not name one.
    pub fn with_ambient_parent(self, parent: impl Into<Parent<F::Context>>) -> Self {
        *self.ambient_parent.write() = Some(parent.into());
        self
    }

    /// Replaces the ambient parent. Contexts already cached keep theirs.
    pub fn set_ambient_parent(&self, parent: Option<Parent<F::Context>>) {
        *self.ambient_parent.write() = parent;
    }

    /// Returns the loader context for `resources`, building it if needed.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidArgument`] if `resources` is empty
    /// - [`CacheError::ConstructionFailed`] if the factory fails
    pub fn get_context(
        &self,
        resources: &[Url],
        options: ContextOptions<F::Context>,
    ) -> CacheResult<CachedContext<F::Context>> {
        let parent = match options.parent {
            ParentChoice::Ambient => self.ambient_parent.read().clone(),
            ParentChoice::Detached => None,
            ParentChoice::Explicit(parent) => Some(parent),
        };

        self.cache.get_or_create(
            resources,
            parent.as_ref(),
            options.strategy.as_ref(),
            options.volatile,
        )
    }

    /// Re-checks volatile contexts; returns true if any was dropped.
    pub fn refresh_cache(&self) -> bool {
        let changed = self.cache.refresh();
        debug!(changed, stats = %self.cache.snapshot(), "loader cache refreshed");
        changed
    }

    /// Reads a counter by name (`NEW`, `REUSED`, `DROPPED`; case and
    /// surrounding whitespace ignored). Unknown names yield 0.
    pub fn get_stats(&self, name: &str) -> u64 {
        self.cache.stat(name)
    }

    /// Valid counter names, in a stable order.
    pub fn get_stat_names(&self) -> &'static [&'static str] {
        self.cache.stat_names()
    }

    /// The underlying cache, for volatility toggling and invalidation.
    pub fn cache(&self) -> &ContextCache<F> {
        &self.cache
    }
}
