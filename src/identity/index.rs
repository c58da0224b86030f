//! Secondary indices over the identity primary map.

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use super::record::IdentityRecord;

type Index = DashMap<String, HashSet<String>>;

/// name / subject / ip -> primary keys.
///
/// Updated after the primary map, so a key found here may briefly be gone
/// from it. Callers treat that as a miss.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_name: Index,
    by_subject: Index,
    by_ip: Index,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, record: &IdentityRecord) {
        add(&self.by_name, &record.name, key);
        add(&self.by_subject, &record.subject.to_string(), key);
        add(&self.by_ip, &record.ip, key);
    }

    /// Remove `key` from the record's three buckets, dropping emptied buckets.
    pub fn remove(&self, key: &str, record: &IdentityRecord) {
        remove(&self.by_name, &record.name, key);
        remove(&self.by_subject, &record.subject.to_string(), key);
        remove(&self.by_ip, &record.ip, key);
    }

    pub fn clear(&self) {
        self.by_name.clear();
        self.by_subject.clear();
        self.by_ip.clear();
    }

    pub fn keys_for_name(&self, name: &str) -> Vec<String> {
        keys(&self.by_name, name)
    }

    pub fn keys_for_subject(&self, subject: Uuid) -> Vec<String> {
        keys(&self.by_subject, &subject.to_string())
    }

    pub fn keys_for_ip(&self, ip: &str) -> Vec<String> {
        keys(&self.by_ip, ip)
    }

    /// Candidate keys for a search, preferring subject, then ip, then name.
    ///
    /// `None` means no index has a bucket for any given field; the caller
    /// falls back to a full scan.
    pub fn candidates(&self, name: Option<&str>, subject: Option<Uuid>, ip: Option<&str>) -> Option<Vec<String>> {
        if let Some(subject) = subject
            && let Some(bucket) = self.by_subject.get(&subject.to_string())
        {
            return Some(bucket.iter().cloned().collect());
        }
        if let Some(ip) = ip
            && let Some(bucket) = self.by_ip.get(&ip.to_lowercase())
        {
            return Some(bucket.iter().cloned().collect());
        }
        if let Some(name) = name
            && let Some(bucket) = self.by_name.get(&name.to_lowercase())
        {
            return Some(bucket.iter().cloned().collect());
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.by_name.len() + self.by_subject.len() + self.by_ip.len()
    }
}

fn add(index: &Index, attribute: &str, key: &str) {
    index
        .entry(attribute.to_lowercase())
        .or_default()
        .insert(key.to_string());
}

fn remove(index: &Index, attribute: &str, key: &str) {
    let normalized = attribute.to_lowercase();
    if let Some(mut bucket) = index.get_mut(&normalized) {
        bucket.remove(key);
    }
    index.remove_if(&normalized, |_, bucket| bucket.is_empty());
}

fn keys(index: &Index, attribute: &str) -> Vec<String> {
    index
        .get(&attribute.to_lowercase())
        .map(|bucket| bucket.iter().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, subject: Uuid, ip: &str) -> IdentityRecord {
        IdentityRecord::observed_now(name, subject, ip, "Unknown city, Unknown country".into())
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let index = IdentityIndex::new();
        let subject = Uuid::new_v4();
        let r = record("Alice", subject, "1.2.3.4");
        index.insert(&r.key(), &r);

        assert_eq!(index.keys_for_name("ALICE"), vec![r.key()]);
        assert_eq!(index.keys_for_subject(subject), vec![r.key()]);
        assert_eq!(index.keys_for_ip("1.2.3.4"), vec![r.key()]);
    }

    #[test]
    fn removal_prunes_empty_buckets() {
        let index = IdentityIndex::new();
        let subject = Uuid::new_v4();
        let first = record("Alice", subject, "1.2.3.4");
        let second = record("Alice", subject, "5.6.7.8");
        index.insert(&first.key(), &first);
        index.insert(&second.key(), &second);
        assert_eq!(index.bucket_count(), 4);

        index.remove(&first.key(), &first);
        assert_eq!(index.keys_for_subject(subject), vec![second.key()]);
        assert!(index.keys_for_ip("1.2.3.4").is_empty());
        assert_eq!(index.bucket_count(), 3);

        index.remove(&second.key(), &second);
        assert_eq!(index.bucket_count(), 0);
    }

    #[test]
    fn candidates_prefer_subject_then_ip_then_name() {
        let index = IdentityIndex::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ra = record("Alice", a, "1.1.1.1");
        let rb = record("Bob", b, "2.2.2.2");
        index.insert(&ra.key(), &ra);
        index.insert(&rb.key(), &rb);

        assert_eq!(index.candidates(Some("Bob"), Some(a), Some("2.2.2.2")), Some(vec![ra.key()]));
        assert_eq!(index.candidates(Some("Alice"), None, Some("2.2.2.2")), Some(vec![rb.key()]));
        assert_eq!(index.candidates(Some("alice"), Some(Uuid::new_v4()), None), Some(vec![ra.key()]));
        assert_eq!(index.candidates(Some("Carol"), None, None), None);
    }
}
