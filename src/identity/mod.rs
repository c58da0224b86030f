//! Identity module - who joined from where.
//!
//! ## Architecture
//!
//! - `IdentityRecord` - One (name, subject, ip) observation and its line format
//! - `IdentityIndex` - name / subject / ip lookups over the primary map
//! - `LineCipher` - AES-128-GCM per line, hex encoded; `resolve_key` picks the key
//! - `IdentityLogStore` - Raw line persistence (file or MongoDB)
//! - `GeoResolver` - IP geolocation, bounded by a timeout
//! - `IdentityCache` - The cache itself, with coalesced background flushes

mod cache;
mod cipher;
mod geo;
mod index;
mod log;
mod record;

pub use cache::{IdentityCache, IdentityCacheBuilder, IdentityError};
pub use cipher::{CipherError, FALLBACK_KEY, KEY_FILE_NAME, KEY_LEN, KeySources, LineCipher, resolve_key};
pub use geo::{DisabledGeoResolver, GeoLocation, GeoResolver};
pub use index::IdentityIndex;
pub use log::{FileIdentityLog, IdentityLogStore, LOG_FILE_NAME};
pub use record::{DELIMITER, IdentityRecord, RecordError, TIMESTAMP_FORMAT, record_key};
