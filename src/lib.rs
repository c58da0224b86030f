//! Warden - moderation record caching and coordination.
//!
//! The layer a game-server plugin sits on to answer punishment and
//! player-identity questions without touching storage on the hot path.
//!
//! ## Architecture
//!
//! - `dispatch` - Worker pool, confined-thread channel, host scheduler strategies
//! - `metrics` - Per-operation timing counters flushed to the log
//! - `cache` - TTL cache primitives built on Moka
//! - `punishments` - Read-through cache over punishment storage
//! - `identity` - Encrypted, indexed cache of name/subject/IP observations
//! - `database` - MongoDB-backed storage collaborators
//! - `config` - Environment configuration

pub mod cache;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod punishments;

pub use error::BuildError;
