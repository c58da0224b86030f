//! Punishment storage collaborator.
//!
//! Every method blocks; callers run them on the worker pool.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::model::{PunishmentRecord, PunishmentType};

/// Blocking access to persisted punishments.
pub trait PunishmentStore: Send + Sync {
    /// Every punishment recorded for `subject`, any state.
    fn punishments_for(&self, subject: Uuid) -> Result<Vec<PunishmentRecord>>;

    /// Page of `subject`'s punishments, newest first.
    fn history(&self, subject: Uuid, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>>;

    /// Page of bans currently in effect, newest first.
    fn active_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>>;

    /// Page of all bans ever issued, newest first.
    fn historical_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>>;

    /// Remove the newest (or every) punishment of `kind` for `identifier`.
    /// Returns how many were removed.
    fn remove_punishment(&self, identifier: &str, kind: PunishmentType, remove_all: bool) -> Result<usize>;

    /// Delete punishments whose end lies before `before`. Returns how many were removed.
    fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// DashMap-backed store for tests and for running without a database.
#[derive(Debug, Default)]
pub struct InMemoryPunishmentStore {
    by_subject: DashMap<Uuid, Vec<PunishmentRecord>>,
}

impl InMemoryPunishmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PunishmentRecord) {
        self.by_subject.entry(record.subject).or_default().push(record);
    }

    /// Mark a punishment revoked. Returns `false` if unknown or already revoked.
    pub fn revoke(&self, id: Uuid) -> bool {
        for mut records in self.by_subject.iter_mut() {
            if let Some(record) = records.iter_mut().find(|r| r.id == id && !r.revoked) {
                record.revoked = true;
                return true;
            }
        }
        false
    }

    fn collect_newest_first(&self, filter: impl Fn(&PunishmentRecord) -> bool) -> Vec<PunishmentRecord> {
        let mut records: Vec<_> = self
            .by_subject
            .iter()
            .flat_map(|entry| entry.value().iter().filter(|r| filter(r)).cloned().collect::<Vec<_>>())
            .collect();
        records.sort_by(|a, b| b.start.cmp(&a.start));
        records
    }
}

/// Skip/take window for a page. A zero limit is an empty page in every store.
pub(crate) fn page_window(limit: u32, offset: u32) -> Option<(u64, u64)> {
    (limit > 0).then_some((u64::from(offset), u64::from(limit)))
}

fn page(records: Vec<PunishmentRecord>, limit: u32, offset: u32) -> Vec<PunishmentRecord> {
    let Some((skip, take)) = page_window(limit, offset) else {
        return Vec::new();
    };
    records
        .into_iter()
        .skip(skip as usize)
        .take(take as usize)
        .collect()
}

impl PunishmentStore for InMemoryPunishmentStore {
    fn punishments_for(&self, subject: Uuid) -> Result<Vec<PunishmentRecord>> {
        Ok(self
            .by_subject
            .get(&subject)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }

    fn history(&self, subject: Uuid, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        Ok(page(self.collect_newest_first(|r| r.subject == subject), limit, offset))
    }

    fn active_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        let now = Utc::now();
        Ok(page(
            self.collect_newest_first(|r| r.kind.is_ban() && r.is_active(now)),
            limit,
            offset,
        ))
    }

    fn historical_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        Ok(page(self.collect_newest_first(|r| r.kind.is_ban()), limit, offset))
    }

    fn remove_punishment(&self, identifier: &str, kind: PunishmentType, remove_all: bool) -> Result<usize> {
        let Ok(subject) = Uuid::parse_str(identifier) else {
            return Ok(0);
        };
        let Some(mut records) = self.by_subject.get_mut(&subject) else {
            return Ok(0);
        };

        let before = records.len();
        if remove_all {
            records.retain(|r| r.kind != kind);
        } else if let Some(newest) = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == kind)
            .max_by_key(|(_, r)| r.start)
            .map(|(i, _)| i)
        {
            records.remove(newest);
        }
        let removed = before - records.len();
        debug!("Removed {} {} punishment(s) for {}", removed, kind.as_str(), subject);
        Ok(removed)
    }

    fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for mut records in self.by_subject.iter_mut() {
            let len = records.len();
            records.retain(|r| r.end.is_none_or(|end| end >= before));
            purged += len - records.len();
        }
        self.by_subject.retain(|_, records| !records.is_empty());
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(subject: Uuid, kind: PunishmentType, start_offset_secs: i64, end: Option<DateTime<Utc>>) -> PunishmentRecord {
        let mut r = PunishmentRecord::new(subject, kind, "test", end);
        r.start = Utc::now() + Duration::seconds(start_offset_secs);
        r
    }

    #[test]
    fn ban_lists_split_active_and_historical() {
        let store = InMemoryPunishmentStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        store.insert(record(a, PunishmentType::Ban, -30, None));
        store.insert(record(b, PunishmentType::IpBan, -20, Some(now - Duration::seconds(5))));
        store.insert(record(b, PunishmentType::Mute, -10, None));

        assert_eq!(store.active_bans(10, 0).unwrap().len(), 1);
        let history = store.historical_bans(10, 0).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].subject, b, "newest first");
        assert_eq!(store.historical_bans(1, 1).unwrap()[0].subject, a);
    }

    #[test]
    fn zero_limit_is_an_empty_page() {
        let store = InMemoryPunishmentStore::new();
        let subject = Uuid::new_v4();
        store.insert(record(subject, PunishmentType::Ban, -10, None));

        assert!(store.active_bans(0, 0).unwrap().is_empty());
        assert!(store.history(subject, 0, 0).unwrap().is_empty());
        assert_eq!(page_window(0, 5), None);
        assert_eq!(page_window(10, 20), Some((20, 10)));
    }

    #[test]
    fn remove_newest_or_all_of_kind() {
        let store = InMemoryPunishmentStore::new();
        let subject = Uuid::new_v4();
        store.insert(record(subject, PunishmentType::Warn, -30, None));
        store.insert(record(subject, PunishmentType::Warn, -10, None));
        store.insert(record(subject, PunishmentType::Mute, -5, None));

        assert_eq!(store.remove_punishment(&subject.to_string(), PunishmentType::Warn, false).unwrap(), 1);
        let left = store.punishments_for(subject).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|r| r.kind == PunishmentType::Warn && r.start < Utc::now() - Duration::seconds(20)));

        assert_eq!(store.remove_punishment(&subject.to_string(), PunishmentType::Warn, true).unwrap(), 1);
        assert_eq!(store.remove_punishment("not-a-uuid", PunishmentType::Warn, true).unwrap(), 0);
    }

    #[test]
    fn purge_drops_only_ended_records() {
        let store = InMemoryPunishmentStore::new();
        let subject = Uuid::new_v4();
        let now = Utc::now();
        store.insert(record(subject, PunishmentType::Mute, -60, Some(now - Duration::seconds(1))));
        store.insert(record(subject, PunishmentType::Ban, -60, None));

        assert_eq!(store.purge_expired(now).unwrap(), 1);
        assert_eq!(store.punishments_for(subject).unwrap().len(), 1);
    }

    #[test]
    fn revoke_marks_once() {
        let store = InMemoryPunishmentStore::new();
        let r = record(Uuid::new_v4(), PunishmentType::Ban, 0, None);
        let id = r.id;
        store.insert(r);
        assert!(store.revoke(id));
        assert!(!store.revoke(id));
    }
}
