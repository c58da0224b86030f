//! Identity records and their plaintext line format.
//!
//! A line is `name|subject|ip|geolocation|yyyy-MM-dd HH:mm:ss`.

use chrono::{Local, NaiveDateTime, Timelike};
use thiserror::Error;
use uuid::Uuid;

pub const DELIMITER: char = '|';
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const FIELD_COUNT: usize = 5;

/// Why a decrypted line could not become a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid subject key: {0}")]
    Subject(String),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

/// One observed (name, subject, ip) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub name: String,
    pub subject: Uuid,
    pub ip: String,
    pub geo_location: String,
    pub last_updated: NaiveDateTime,
}

impl IdentityRecord {
    /// A record observed now, local time, second precision.
    pub fn observed_now(name: &str, subject: Uuid, ip: &str, geo_location: String) -> Self {
        let now = Local::now().naive_local();
        Self {
            name: name.to_string(),
            subject,
            ip: ip.to_string(),
            geo_location,
            last_updated: now.with_nanosecond(0).unwrap_or(now),
        }
    }

    /// Primary-map key: one record per (subject, ip).
    pub fn key(&self) -> String {
        record_key(self.subject, &self.ip)
    }

    pub fn to_line(&self) -> String {
        let subject = self.subject.to_string();
        let timestamp = self.last_updated.format(TIMESTAMP_FORMAT).to_string();
        [
            self.name.as_str(),
            subject.as_str(),
            self.ip.as_str(),
            self.geo_location.as_str(),
            timestamp.as_str(),
        ]
        .iter()
        .map(|field| field.replace(DELIMITER, " "))
        .collect::<Vec<_>>()
        .join(DELIMITER.to_string().as_str())
    }

    /// Parse a plaintext line. Extra trailing fields are ignored.
    pub fn parse_line(line: &str) -> Result<Self, RecordError> {
        let parts: Vec<&str> = line.split(DELIMITER).map(str::trim).collect();
        if parts.len() < FIELD_COUNT {
            return Err(RecordError::FieldCount(parts.len()));
        }

        let subject = Uuid::parse_str(parts[1]).map_err(|_| RecordError::Subject(parts[1].to_string()))?;
        let last_updated = NaiveDateTime::parse_from_str(parts[4], TIMESTAMP_FORMAT)
            .map_err(|_| RecordError::Timestamp(parts[4].to_string()))?;

        Ok(Self {
            name: parts[0].to_string(),
            subject,
            ip: parts[2].to_string(),
            geo_location: parts[3].to_string(),
            last_updated,
        })
    }
}

/// Case-insensitive key for a (subject, ip) pair.
pub fn record_key(subject: Uuid, ip: &str) -> String {
    format!("{}{}{}", subject, DELIMITER, ip.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_with_padding_and_extras() {
        let subject = Uuid::new_v4();
        let line = format!(" Alice | {subject} | 1.2.3.4 | Berlin, Germany | 2024-03-01 12:30:05 |extra");
        let record = IdentityRecord::parse_line(&line).unwrap();

        assert_eq!(record.name, "Alice");
        assert_eq!(record.subject, subject);
        assert_eq!(record.geo_location, "Berlin, Germany");
        assert_eq!(record.last_updated.format(TIMESTAMP_FORMAT).to_string(), "2024-03-01 12:30:05");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(IdentityRecord::parse_line("a|b|c"), Err(RecordError::FieldCount(3)));
        assert!(matches!(
            IdentityRecord::parse_line("a|not-a-uuid|c|d|2024-01-01 00:00:00"),
            Err(RecordError::Subject(_))
        ));
        let subject = Uuid::new_v4();
        assert!(matches!(
            IdentityRecord::parse_line(&format!("a|{subject}|c|d|yesterday")),
            Err(RecordError::Timestamp(_))
        ));
    }

    #[test]
    fn delimiter_inside_field_does_not_shift_columns() {
        let record = IdentityRecord::observed_now("Bob", Uuid::new_v4(), "10.0.0.1", "A|B".to_string());
        let parsed = IdentityRecord::parse_line(&record.to_line()).unwrap();
        assert_eq!(parsed.geo_location, "A B");
        assert_eq!(parsed.last_updated, record.last_updated);
    }

    #[test]
    fn key_ignores_ip_case() {
        let subject = Uuid::new_v4();
        assert_eq!(record_key(subject, "FE80::1"), record_key(subject, "fe80::1"));
    }
}
