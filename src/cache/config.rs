//! Cache configuration.

use std::time::Duration;

/// Configuration for a cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries in the cache.
    pub max_capacity: u64,

    /// Time-to-live for cache entries.
    /// After this duration, entries are evicted from memory.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Some(Duration::from_secs(300)), // 5 minutes
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with the given max capacity.
    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            max_capacity,
            ..Default::default()
        }
    }

    /// Set max capacity for cache (builder pattern).
    #[must_use]
    pub fn max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Set time-to-live for cache entries.
    #[must_use]
    pub fn ttl(mut self, duration: Duration) -> Self {
        self.ttl = Some(duration);
        self
    }

    /// Disable TTL (entries never expire based on time).
    #[must_use]
    pub fn no_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    /// Active punishments per subject.
    /// Looked up on every join and chat message, so high capacity.
    pub fn active_punishments(ttl: Duration) -> Self {
        Self::with_capacity(20_000).ttl(ttl)
    }

    /// Paged listings (history, ban lists).
    /// Command-triggered and short-lived.
    pub fn listings(ttl: Duration) -> Self {
        Self::with_capacity(2_000).ttl(ttl)
    }

    /// Performance profile snapshots.
    pub fn profiles() -> Self {
        Self::with_capacity(500).ttl(Duration::from_secs(600)) // 10 minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = CacheConfig::with_capacity(42).ttl(Duration::from_millis(5));
        assert_eq!(config.max_capacity, 42);
        assert_eq!(config.ttl, Some(Duration::from_millis(5)));
        assert_eq!(config.no_ttl().ttl, None);
    }
}
