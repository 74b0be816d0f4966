//! # Loadercache Core
//!
//! Core engine of the Loadercache library: a thread-safe cache of expensive
//! loader contexts built from sets of resource URLs.
//!
//! A loader context is opaque to this crate. The host supplies a
//! [`ContextFactory`] that builds one from a resource list, an optional
//! parent context and an optional resolution strategy; the cache makes sure
//! equivalent requests share a single instance and, for volatile contexts,
//! notices when the underlying resources change.
//!
//! ## Features
//!
//! - **Order-insensitive keys**: `[a, b]`, `[b, a]` and `[a, a, b]` name the same context
//! - **One construction per key**: concurrent requests for a key wait for the first build
//! - **Freshness probes**: volatile contexts are re-checked by `refresh` using
//!   lightweight metadata queries (`HEAD` for HTTP, filesystem metadata for files)
//! - **Statistics**: `NEW`, `REUSED` and `DROPPED` counters readable by name
//!
//! ## Module Organization
//!
//! - `cache_entry` - Entry record and the handle given to callers
//! - `config` - Cache tunables
//! - `context_cache` - The cache itself and the factory trait
//! - `key` - Key identity over resources, parent and strategy
//! - `probe` - Freshness tokens and metadata probes
//! - `stats` / `stats_registry` - Counters and their names
//!
mod cache_entry;
mod config;
mod context_cache;
mod error;
mod key;
mod probe;
mod stats;

pub mod stats_registry;

pub use cache_entry::{CachedContext, EntryStatus, LoaderContextEntry};
pub use config::{CacheConfig, TokenCapture};
pub use context_cache::{ContextCache, ContextFactory, FnFactory};
pub use error::{BoxError, CacheError, CacheResult, ProbeError};
pub use key::{dedup_in_order, LoaderContextKey, Parent, ResolutionStrategy, StrategyRef};
pub use probe::{FreshnessToken, MetadataProbe, ResourceMetadata, UrlMetadataProbe};
pub use stats::{CacheStats, StatsSnapshot};
pub use stats_registry::StatName;

pub use url::Url;
