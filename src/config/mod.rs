//! Configuration module for Warden.
//!
//! Loads configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_ACTIVE_TTL_MS: u64 = 5_000;
const DEFAULT_LISTING_TTL_MS: u64 = 2_000;
const DEFAULT_INTERVAL_TICKS: u64 = 20 * 60; // one minute
const DEFAULT_GEOIP_TIMEOUT_MS: u64 = 1_500;

/// Where the identity log lives.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStorage {
    #[default]
    File,
    Database,
}

/// Punishment cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub active_ttl: Duration,
    pub listing_ttl: Duration,
    /// Expired-punishment sweep interval in host ticks.
    pub cleanup_interval_ticks: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            active_ttl: Duration::from_millis(DEFAULT_ACTIVE_TTL_MS),
            listing_ttl: Duration::from_millis(DEFAULT_LISTING_TTL_MS),
            cleanup_interval_ticks: DEFAULT_INTERVAL_TICKS,
        }
    }
}

/// Metrics recorder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Flush interval in host ticks.
    pub flush_interval_ticks: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ticks: DEFAULT_INTERVAL_TICKS,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheSettings,
    pub metrics: MetricsSettings,

    // Identity log
    pub identity_storage: IdentityStorage,
    /// Configuration secret for the identity log (persisted to the key file).
    pub identity_secret_key: Option<String>,
    pub data_dir: PathBuf,
    pub geoip_timeout: Duration,

    /// Host name; decides the scheduler flavor.
    pub server_name: String,

    // MongoDB (in-memory storage when unset)
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Nothing is required; malformed or non-positive numbers fall back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let identity_storage = match env::var("IDENTITY_STORAGE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "database" => IdentityStorage::Database,
            _ => IdentityStorage::File,
        };

        let metrics_enabled = env::var("METRICS_ENABLED")
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(true);

        Self {
            cache: CacheSettings {
                active_ttl: Duration::from_millis(positive_or("PUNISHMENT_CACHE_TTL_MS", DEFAULT_ACTIVE_TTL_MS)),
                listing_ttl: Duration::from_millis(positive_or("LISTING_CACHE_TTL_MS", DEFAULT_LISTING_TTL_MS)),
                cleanup_interval_ticks: positive_or("CLEANUP_INTERVAL_TICKS", DEFAULT_INTERVAL_TICKS),
            },
            metrics: MetricsSettings {
                enabled: metrics_enabled,
                flush_interval_ticks: positive_or("METRICS_FLUSH_INTERVAL_TICKS", DEFAULT_INTERVAL_TICKS),
            },
            identity_storage,
            identity_secret_key: non_empty("IDENTITY_SECRET_KEY"),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            geoip_timeout: Duration::from_millis(positive_or("GEOIP_TIMEOUT_MS", DEFAULT_GEOIP_TIMEOUT_MS)),
            server_name: env::var("SERVER_NAME").unwrap_or_else(|_| "standalone".to_string()),
            mongodb_uri: non_empty("MONGODB_URI"),
            mongodb_database: env::var("MONGODB_DATABASE").unwrap_or_else(|_| "warden".to_string()),
        }
    }
}

fn positive_or(key: &str, default: u64) -> u64 {
    parse_positive(env::var(key).ok().as_deref()).unwrap_or(default)
}

fn parse_positive(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_numbers_are_rejected() {
        assert_eq!(parse_positive(Some("5000")), Some(5000));
        assert_eq!(parse_positive(Some(" 20 ")), Some(20));
        assert_eq!(parse_positive(Some("0")), None);
        assert_eq!(parse_positive(Some("-5")), None);
        assert_eq!(parse_positive(Some("soon")), None);
        assert_eq!(parse_positive(None), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cache = CacheSettings::default();
        assert_eq!(cache.active_ttl, Duration::from_millis(5000));
        assert_eq!(cache.listing_ttl, Duration::from_millis(2000));
        assert_eq!(cache.cleanup_interval_ticks, 1200);
        assert!(MetricsSettings::default().enabled);
    }
}
