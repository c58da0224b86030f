//! Cache module - TTL caching primitives using Moka.
//!
//! ## Architecture
//!
//! - `TypedCache` - Named, bounded cache over Moka
//! - `CacheConfig` - Capacity/TTL presets per domain
//! - `CacheEntry` - Value plus expiry instant; freshness is checked on read
//! - `Clock` - Time source for freshness checks (swappable in tests)
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use warden::cache::{CacheConfig, CacheEntry, Clock, SystemClock, TypedCache};
//!
//! let clock = SystemClock;
//! let ttl = Duration::from_secs(5);
//! let cache: TypedCache<u64, CacheEntry<String>> =
//!     TypedCache::new("names", CacheConfig::with_capacity(100).ttl(ttl));
//!
//! cache.insert(1, CacheEntry::new("alice".to_string(), clock.now(), ttl));
//! let name = cache.get(&1).and_then(|entry| entry.fresh_value(clock.now()));
//! assert_eq!(name.as_deref(), Some("alice"));
//! ```

mod clock;
mod config;
mod entry;
mod typed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use typed::TypedCache;
