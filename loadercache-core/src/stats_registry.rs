//! Named access to cache counters.
//!
//! Hosts that only know counters by name (management consoles, scripting
//! bridges) read them through this module. The name set is closed and
//! discoverable: [`names`] lists it, and [`lookup`] is total, answering 0
//! for anything it does not recognise.
//!
//! # Examples
//!
//! ```
//! use loadercache_core::{stats_registry, CacheStats};
//!
//! let stats = CacheStats::new();
//! stats.record_created();
//!
//! assert_eq!(stats_registry::names(), &["NEW", "REUSED", "DROPPED"]);
//! assert_eq!(stats_registry::lookup(&stats, " new "), 1);
//! assert_eq!(stats_registry::lookup(&stats, "evicted"), 0);
//! ```

use std::fmt;

use crate::CacheStats;

/// Identifier of one counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatName {
    New,
    Reused,
    Dropped,
}

impl StatName {
    /// Every counter, in the order [`names`] reports them.
    pub const ALL: [StatName; 3] = [StatName::New, StatName::Reused, StatName::Dropped];

    /// Canonical upper-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            StatName::New => "NEW",
            StatName::Reused => "REUSED",
            StatName::Dropped => "DROPPED",
        }
    }

    /// Resolves a counter name, ignoring case and surrounding whitespace.
    pub fn parse(name: &str) -> Option<StatName> {
        let name = name.trim();
        StatName::ALL
            .into_iter()
            .find(|stat| stat.as_str().eq_ignore_ascii_case(name))
    }

    /// Reads this counter from `stats`.
    pub fn read(self, stats: &CacheStats) -> u64 {
        match self {
            StatName::New => stats.created(),
            StatName::Reused => stats.reused(),
            StatName::Dropped => stats.dropped(),
        }
    }
}

impl fmt::Display for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NAMES: [&str; 3] = [
    StatName::ALL[0].as_str(),
    StatName::ALL[1].as_str(),
    StatName::ALL[2].as_str(),
];

/// Valid counter names, in a stable order.
pub fn names() -> &'static [&'static str] {
    &NAMES
}

/// Reads a counter by name; unknown names yield 0.
pub fn lookup(stats: &CacheStats, name: &str) -> u64 {
    StatName::parse(name).map_or(0, |stat| stat.read(stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_enum() {
        let from_enum: Vec<&str> = StatName::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names(), from_enum.as_slice());
        assert!(!names().is_empty());
    }

    #[test]
    fn test_parse_is_case_insensitive_and_trimmed() {
        assert_eq!(StatName::parse("NEW"), Some(StatName::New));
        assert_eq!(StatName::parse("reused"), Some(StatName::Reused));
        assert_eq!(StatName::parse("  Dropped\t"), Some(StatName::Dropped));
        assert_eq!(StatName::parse(""), None);
        assert_eq!(StatName::parse("NEWS"), None);
    }

    #[test]
    fn test_lookup_reads_counters() {
        let stats = CacheStats::new();
        stats.record_created();
        stats.record_created();
        stats.record_reused();
        stats.record_dropped();

        assert_eq!(lookup(&stats, "new"), 2);
        assert_eq!(lookup(&stats, "REUSED"), 1);
        assert_eq!(lookup(&stats, "dropped"), 1);
    }

    #[test]
    fn test_lookup_unknown_is_zero() {
        let stats = CacheStats::new();
        stats.record_created();
        assert_eq!(lookup(&stats, "hits"), 0);
        assert_eq!(lookup(&stats, "   "), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(StatName::Reused.to_string(), "REUSED");
    }
}
