//! # Loader context keys
//!
//! A [`LoaderContextKey`] identifies the loader context a request is asking
//! for. It is built from three parts:
//!
//! - the resource set, deduplicated and sorted so that neither order nor
//!   repetition affects equality or hashing;
//! - the parent identity: the parent's own key when the parent came from the
//!   cache, its address otherwise;
//! - the resolution strategy identity: always by address. Two strategy
//!   instances never compare equal, however alike they behave.
//!
//! Keys hold strong references to external parents and strategies so that an
//! address cannot be reused by another object while a key still mentions it.

use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use url::Url;

use crate::{CacheError, CacheResult, CachedContext};

/// A custom resource-resolution strategy (a stream-handler factory).
///
/// The cache never calls into a strategy; it only passes it on to the
/// context factory and tells instances apart by identity.
pub trait ResolutionStrategy: Send + Sync + 'static {
    /// Label used in log output.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Shared handle to a resolution strategy.
pub type StrategyRef = Arc<dyn ResolutionStrategy>;

/// The parent (delegation) context of a requested loader context.
///
/// # Variants
///
/// * `Managed` - A context previously handed out by a cache; identified by its key
/// * `External` - Any other context; identified by reference. A cache that
///   recognises the `Arc` as one of its own cached contexts treats it as `Managed`.
pub enum Parent<C> {
    Managed(CachedContext<C>),
    External(Arc<C>),
}

impl<C: Send + Sync + 'static> Parent<C> {
    /// The parent context itself.
    pub fn context(&self) -> &C {
        match self {
            Parent::Managed(cached) => cached.context(),
            Parent::External(context) => &**context,
        }
    }

    pub(crate) fn identity(&self) -> ParentIdentity {
        match self {
            Parent::Managed(cached) => ParentIdentity::Managed(Arc::clone(cached.key())),
            Parent::External(context) => {
                let keep: Arc<dyn Any + Send + Sync> = context.clone();
                ParentIdentity::External(Identity::new(keep))
            }
        }
    }
}

impl<C> Clone for Parent<C> {
    fn clone(&self) -> Self {
        match self {
            Parent::Managed(cached) => Parent::Managed(cached.clone()),
            Parent::External(context) => Parent::External(Arc::clone(context)),
        }
    }
}

impl<C> From<CachedContext<C>> for Parent<C> {
    fn from(cached: CachedContext<C>) -> Self {
        Parent::Managed(cached)
    }
}

impl<C> From<Arc<C>> for Parent<C> {
    fn from(context: Arc<C>) -> Self {
        Parent::External(context)
    }
}

/// Reference identity of a shared object: equal iff same address.
pub(crate) struct Identity<T: ?Sized> {
    handle: Arc<T>,
}

impl<T: ?Sized> Clone for Identity<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<T: ?Sized> Identity<T> {
    fn new(handle: Arc<T>) -> Self {
        Self { handle }
    }

    // Thin address; vtable pointers of the same object may differ.
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.handle) as *const () as usize
    }
}

impl<T: ?Sized> PartialEq for Identity<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized> Eq for Identity<T> {}

impl<T: ?Sized> Hash for Identity<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum ParentIdentity {
    Managed(Arc<LoaderContextKey>),
    External(Identity<dyn Any + Send + Sync>),
}

/// Identity of a requested loader context.
///
/// # Examples
///
/// ```
/// use loadercache_core::LoaderContextKey;
/// use url::Url;
///
/// let a = Url::parse("file:///lib/a.jar").unwrap();
/// let b = Url::parse("file:///lib/b.jar").unwrap();
///
/// let k1 = LoaderContextKey::new::<()>(&[a.clone(), b.clone()], None, None).unwrap();
/// let k2 = LoaderContextKey::new::<()>(&[b.clone(), a.clone(), a.clone()], None, None).unwrap();
/// assert_eq!(k1, k2);
///
/// assert!(LoaderContextKey::new::<()>(&[], None, None).is_err());
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LoaderContextKey {
    resources: BTreeSet<Url>,
    parent: Option<ParentIdentity>,
    strategy: Option<Identity<dyn ResolutionStrategy>>,
}

impl LoaderContextKey {
    /// Builds the key for a request.
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidArgument`] if `resources` is empty.
    pub fn new<C: Send + Sync + 'static>(
        resources: &[Url],
        parent: Option<&Parent<C>>,
        strategy: Option<&StrategyRef>,
    ) -> CacheResult<Self> {
        if resources.is_empty() {
            return Err(CacheError::InvalidArgument(
                "a loader context needs at least one resource location".to_string(),
            ));
        }

        Ok(Self {
            resources: resources.iter().cloned().collect(),
            parent: parent.map(Parent::identity),
            strategy: strategy.map(|s| Identity::new(Arc::clone(s))),
        })
    }

    /// The canonical (sorted, deduplicated) resource set.
    pub fn resources(&self) -> impl ExactSizeIterator<Item = &Url> {
        self.resources.iter()
    }

    /// Returns true if the request named a parent context.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns true if the request named a resolution strategy.
    pub fn has_strategy(&self) -> bool {
        self.strategy.is_some()
    }
}

impl fmt::Debug for LoaderContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parent = match &self.parent {
            None => "none".to_string(),
            Some(ParentIdentity::Managed(key)) => format!("managed({:?})", key),
            Some(ParentIdentity::External(id)) => format!("external({:#x})", id.addr()),
        };
        f.debug_struct("LoaderContextKey")
            .field("resources", &self.resources.iter().map(Url::as_str).collect::<Vec<_>>())
            .field("parent", &parent)
            .field(
                "strategy",
                &self.strategy.as_ref().map(|s| s.handle.name().to_string()),
            )
            .finish()
    }
}

impl fmt::Display for LoaderContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resources: Vec<&str> = self.resources.iter().map(Url::as_str).collect();
        write!(f, "[{}]", resources.join(", "))
    }
}

/// Drops repeated locations, keeping the first occurrence of each.
///
/// Lookup order matters to a loader even though it does not matter to the
/// key, so the factory receives the caller's order minus duplicates.
pub fn dedup_in_order(resources: &[Url]) -> Vec<Url> {
    let mut seen = HashSet::with_capacity(resources.len());
    resources
        .iter()
        .filter(|url| seen.insert(*url))
        .cloned()
        .collect()
}
