//! MongoDB-backed punishment storage.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use mongodb::IndexModel;
use mongodb::bson::{Document, doc};
use mongodb::sync::Collection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::punishments::{PunishmentRecord, PunishmentStore, PunishmentType, page_window};

const COLLECTION: &str = "punishments";

/// Stored shape of a punishment. Times are epoch milliseconds; a missing
/// `end` means permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PunishmentDocument {
    #[serde(rename = "_id")]
    id: String,
    subject: String,
    kind: PunishmentType,
    reason: String,
    start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<i64>,
    #[serde(default)]
    revoked: bool,
}

impl From<&PunishmentRecord> for PunishmentDocument {
    fn from(record: &PunishmentRecord) -> Self {
        Self {
            id: record.id.to_string(),
            subject: record.subject.to_string(),
            kind: record.kind,
            reason: record.reason.clone(),
            start: record.start.timestamp_millis(),
            end: record.end.map(|end| end.timestamp_millis()),
            revoked: record.revoked,
        }
    }
}

impl PunishmentDocument {
    fn into_record(self) -> Result<PunishmentRecord> {
        Ok(PunishmentRecord {
            id: Uuid::parse_str(&self.id).with_context(|| format!("punishment id {}", self.id))?,
            subject: Uuid::parse_str(&self.subject)
                .with_context(|| format!("punishment subject {}", self.subject))?,
            kind: self.kind,
            reason: self.reason,
            start: millis(self.start)?,
            end: self.end.map(millis).transpose()?,
            revoked: self.revoked,
        })
    }
}

fn millis(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .with_context(|| format!("timestamp {value} out of range"))
}

/// Punishments in the `punishments` collection.
#[derive(Debug, Clone)]
pub struct MongoPunishmentStore {
    collection: Collection<PunishmentDocument>,
}

impl MongoPunishmentStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(COLLECTION),
        }
    }

    /// Create the lookup indexes. Safe to call repeatedly.
    pub fn ensure_indexes(&self) -> Result<()> {
        let indexes = [
            IndexModel::builder().keys(doc! { "subject": 1, "start": -1 }).build(),
            IndexModel::builder().keys(doc! { "kind": 1, "start": -1 }).build(),
            IndexModel::builder().keys(doc! { "end": 1 }).build(),
        ];
        self.collection.create_indexes(indexes).run()?;
        Ok(())
    }

    /// Write a new punishment.
    pub fn insert(&self, record: &PunishmentRecord) -> Result<()> {
        self.collection
            .insert_one(PunishmentDocument::from(record))
            .run()?;
        debug!("Stored {} for {}", record.kind.as_str(), record.subject);
        Ok(())
    }

    /// Mark a punishment revoked. Returns whether anything changed.
    pub fn revoke(&self, id: Uuid) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id.to_string(), "revoked": false },
                doc! { "$set": { "revoked": true } },
            )
            .run()?;
        Ok(result.modified_count > 0)
    }

    /// `limit: None` reads everything; a zero limit never reaches the server,
    /// where it would mean "no limit".
    fn query(&self, filter: Document, limit: Option<u32>, offset: u32) -> Result<Vec<PunishmentRecord>> {
        let mut find = self.collection.find(filter).sort(doc! { "start": -1 });
        if let Some(limit) = limit {
            let Some((skip, take)) = page_window(limit, offset) else {
                return Ok(Vec::new());
            };
            find = find.skip(skip).limit(i64::try_from(take).unwrap_or(i64::MAX));
        }

        let mut records = Vec::new();
        for document in find.run()? {
            // One unreadable document should not hide the rest.
            match document.map_err(anyhow::Error::from).and_then(PunishmentDocument::into_record) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable punishment document: {:#}", e),
            }
        }
        Ok(records)
    }
}

fn ban_kinds() -> Vec<&'static str> {
    [PunishmentType::Ban, PunishmentType::IpBan]
        .iter()
        .map(PunishmentType::as_str)
        .collect()
}

impl PunishmentStore for MongoPunishmentStore {
    fn punishments_for(&self, subject: Uuid) -> Result<Vec<PunishmentRecord>> {
        self.query(doc! { "subject": subject.to_string() }, None, 0)
    }

    fn history(&self, subject: Uuid, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        self.query(doc! { "subject": subject.to_string() }, Some(limit), offset)
    }

    fn active_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        let now = Utc::now().timestamp_millis();
        let filter = doc! {
            "kind": { "$in": ban_kinds() },
            "revoked": { "$ne": true },
            "$or": [ { "end": null }, { "end": { "$gt": now } } ],
        };
        self.query(filter, Some(limit), offset)
    }

    fn historical_bans(&self, limit: u32, offset: u32) -> Result<Vec<PunishmentRecord>> {
        self.query(doc! { "kind": { "$in": ban_kinds() } }, Some(limit), offset)
    }

    fn remove_punishment(&self, identifier: &str, kind: PunishmentType, remove_all: bool) -> Result<usize> {
        let filter = doc! { "subject": identifier.to_lowercase(), "kind": kind.as_str() };

        let removed = if remove_all {
            self.collection.delete_many(filter).run()?.deleted_count as usize
        } else {
            self.collection
                .find_one_and_delete(filter)
                .sort(doc! { "start": -1 })
                .run()?
                .map_or(0, |_| 1)
        };

        debug!("Removed {} {} punishment(s) for {}", removed, kind.as_str(), identifier);
        Ok(removed)
    }

    fn purge_expired(&self, before: DateTime<Utc>) -> Result<usize> {
        let filter = doc! { "end": { "$lt": before.timestamp_millis() } };
        let result = self.collection.delete_many(filter).run()?;
        Ok(result.deleted_count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn document_round_trip_keeps_millisecond_precision() {
        let mut record = PunishmentRecord::new(
            Uuid::new_v4(),
            PunishmentType::IpBan,
            "alts",
            Some(Utc::now() + Duration::days(7)),
        );
        record.start = millis(record.start.timestamp_millis()).unwrap();
        record.end = record.end.map(|e| millis(e.timestamp_millis()).unwrap());

        let document = PunishmentDocument::from(&record);
        assert_eq!(document.end, record.end.map(|e| e.timestamp_millis()));
        assert_eq!(document.into_record().unwrap(), record);
    }

    #[test]
    fn permanent_punishment_omits_end() {
        let record = PunishmentRecord::new(Uuid::new_v4(), PunishmentType::Ban, "x", None);
        let bson = mongodb::bson::to_document(&PunishmentDocument::from(&record)).unwrap();
        assert!(!bson.contains_key("end"));
        assert_eq!(bson.get_str("kind").unwrap(), "ban");
    }

    #[test]
    fn corrupt_ids_are_rejected() {
        let mut document = PunishmentDocument::from(&PunishmentRecord::new(
            Uuid::new_v4(),
            PunishmentType::Warn,
            "x",
            None,
        ));
        document.subject = "nobody".into();
        assert!(document.into_record().is_err());
    }
}
