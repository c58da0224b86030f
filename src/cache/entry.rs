//! Cached value with an explicit expiry instant.

use std::time::{Duration, Instant};

/// A cached value, valid only while `now < expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// The value, if still fresh at `now`.
    pub fn fresh_value(self, now: Instant) -> Option<T> {
        self.is_fresh(now).then_some(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_strictly_before_expiry() {
        let start = Instant::now();
        let entry = CacheEntry::new("v", start, Duration::from_millis(5000));

        assert!(entry.is_fresh(start));
        assert!(entry.is_fresh(start + Duration::from_millis(4999)));
        assert!(!entry.is_fresh(start + Duration::from_millis(5000)));
        assert_eq!(entry.clone().fresh_value(start + Duration::from_millis(5001)), None);
        assert_eq!(entry.fresh_value(start), Some("v"));
    }
}
