use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

use crate::{FreshnessToken, LoaderContextKey};

/// Lifecycle state of a cache entry.
///
/// Transitions only move forward: `Active -> Stale -> Evicted`, or
/// `Active -> Evicted` when an entry is replaced or invalidated directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    Active = 0,
    Stale = 1,
    Evicted = 2,
}

impl EntryStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntryStatus::Active,
            1 => EntryStatus::Stale,
            _ => EntryStatus::Evicted,
        }
    }
}

/// A loader context handed out by the cache.
///
/// Cloning is cheap and every clone refers to the same context instance.
/// The handle stays usable after its entry has been evicted; eviction only
/// affects future lookups.
///
/// # Examples
///
/// ```ignore
/// let a = cache.get_or_create(&urls, None, None, false)?;
/// let b = cache.get_or_create(&urls, None, None, false)?;
/// assert!(CachedContext::ptr_eq(&a, &b));
/// ```
pub struct CachedContext<C> {
    context: Arc<C>,
    key: Arc<LoaderContextKey>,
}

impl<C> CachedContext<C> {
    pub(crate) fn new(context: Arc<C>, key: Arc<LoaderContextKey>) -> Self {
        Self { context, key }
    }

    /// Borrows the context. Equivalent to dereferencing the handle.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// The key this context was cached under.
    pub fn key(&self) -> &Arc<LoaderContextKey> {
        &self.key
    }

    /// Shared pointer to the context itself, detached from the cache handle.
    pub fn shared(&self) -> Arc<C> {
        Arc::clone(&self.context)
    }

    /// Returns true if both handles refer to the same context instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.context, &b.context)
    }
}

impl<C> Clone for CachedContext<C> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            key: Arc::clone(&self.key),
        }
    }
}

impl<C> Deref for CachedContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.context
    }
}

impl<C: fmt::Debug> fmt::Debug for CachedContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedContext")
            .field("key", &self.key)
            .field("context", &self.context)
            .finish()
    }
}

/// Internal record wrapping one constructed loader context.
///
/// The context itself is never mutated by the cache. Volatility and status
/// live here so that toggling them never touches an object that callers
/// are using.
///
/// # Fields
///
/// * `key` - The key the entry is stored under
/// * `context` - The constructed context, shared with every caller that received it
/// * `tokens` - One freshness token per resource, captured at construction
/// * `created_at` - When the entry was built
pub struct LoaderContextEntry<C> {
    pub key: Arc<LoaderContextKey>,
    pub context: Arc<C>,
    pub tokens: Vec<(Url, FreshnessToken)>,
    pub created_at: Instant,
    volatile: AtomicBool,
    status: AtomicU8,
}

impl<C> LoaderContextEntry<C> {
    /// Creates a new `Active` entry.
    pub fn new(
        key: Arc<LoaderContextKey>,
        context: Arc<C>,
        tokens: Vec<(Url, FreshnessToken)>,
        volatile: bool,
    ) -> Self {
        Self {
            key,
            context,
            tokens,
            created_at: Instant::now(),
            volatile: AtomicBool::new(volatile),
            status: AtomicU8::new(EntryStatus::Active as u8),
        }
    }

    /// A caller-facing handle to this entry's context.
    pub fn handle(&self) -> CachedContext<C> {
        CachedContext::new(Arc::clone(&self.context), Arc::clone(&self.key))
    }

    /// Current lifecycle state.
    pub fn status(&self) -> EntryStatus {
        EntryStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns true while the entry may be served to callers.
    pub fn is_active(&self) -> bool {
        self.status() == EntryStatus::Active
    }

    /// Returns true if `refresh` re-checks this entry.
    pub fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Acquire)
    }

    /// Sets the volatility flag, returning the previous value.
    pub fn set_volatile(&self, volatile: bool) -> bool {
        self.volatile.swap(volatile, Ordering::AcqRel)
    }

    /// Upgrades a non-volatile entry to volatile. Never demotes.
    ///
    /// Returns true if the flag changed.
    pub fn promote_volatile(&self) -> bool {
        !self.volatile.fetch_or(true, Ordering::AcqRel)
    }

    /// `Active -> Stale`. Returns false if the entry had already left `Active`.
    pub fn mark_stale(&self) -> bool {
        self.status
            .compare_exchange(
                EntryStatus::Active as u8,
                EntryStatus::Stale as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves the entry to `Evicted`. Returns false if it was already evicted.
    pub fn mark_evicted(&self) -> bool {
        self.status.swap(EntryStatus::Evicted as u8, Ordering::AcqRel) != EntryStatus::Evicted as u8
    }

    /// Returns true if any stored token fails to match `current`, which is
    /// called once per resource until the first mismatch.
    pub fn has_changed<F>(&self, mut current: F) -> bool
    where
        F: FnMut(&Url) -> FreshnessToken,
    {
        self.tokens
            .iter()
            .any(|(location, stored)| !stored.matches(&current(location)))
    }
}
