//! IP geolocation collaborator.

use std::fmt;

const UNKNOWN_CITY: &str = "Unknown city";
const UNKNOWN_COUNTRY: &str = "Unknown country";

/// City and country for an IP. Displays as `city, country`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLocation {
    pub city: String,
    pub country: String,
}

impl GeoLocation {
    pub fn new(city: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            country: country.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_CITY, UNKNOWN_COUNTRY)
    }

    pub fn is_unknown(&self) -> bool {
        self.city == UNKNOWN_CITY && self.country == UNKNOWN_COUNTRY
    }
}

impl fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.country)
    }
}

/// Resolves an IP to a location.
///
/// `lookup` may block on disk or network and must never fail; unresolvable
/// addresses yield [`GeoLocation::unknown`].
pub trait GeoResolver: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn lookup(&self, ip: &str) -> GeoLocation;
}

/// Geolocation turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGeoResolver;

impl GeoResolver for DisabledGeoResolver {
    fn is_enabled(&self) -> bool {
        false
    }

    fn lookup(&self, _ip: &str) -> GeoLocation {
        GeoLocation::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        assert_eq!(GeoLocation::new("Berlin", "Germany").to_string(), "Berlin, Germany");
        assert_eq!(GeoLocation::unknown().to_string(), "Unknown city, Unknown country");
        assert!(DisabledGeoResolver.lookup("1.2.3.4").is_unknown());
    }
}
