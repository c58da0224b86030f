//! Punishments module - cached lookups of bans, mutes, warns and jails.
//!
//! ## Architecture
//!
//! - `PunishmentRecord` - One punishment as stored
//! - `PunishmentStore` - Blocking storage collaborator (MongoDB or in-memory)
//! - `PunishmentCache` - Read-through TTL cache for active punishments and paged listings
//!
//! All storage access happens on the dispatcher's worker pool; callers get
//! an awaitable result.

mod model;
mod service;
mod store;

pub use model::{ListingKey, ListingKind, PunishmentRecord, PunishmentType};
pub use service::{LookupError, PunishmentCache, PunishmentCacheBuilder};
pub use store::{InMemoryPunishmentStore, PunishmentStore};
pub(crate) use store::page_window;
