//! Identity log lines stored in MongoDB.

use anyhow::{Context, Result};
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::sync::Collection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::Database;
use crate::identity::IdentityLogStore;

const COLLECTION: &str = "player_cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LineDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    line: String,
}

impl LineDocument {
    fn new(line: &str) -> Self {
        Self {
            id: None,
            line: line.to_string(),
        }
    }
}

/// One document per encrypted line, in insertion order.
#[derive(Debug, Clone)]
pub struct MongoIdentityLog {
    db: Database,
    collection: Collection<LineDocument>,
    staging: Collection<LineDocument>,
}

impl MongoIdentityLog {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            collection: db.collection(COLLECTION),
            staging: db.collection(&staging_name()),
        }
    }
}

fn staging_name() -> String {
    format!("{COLLECTION}_staging")
}

impl IdentityLogStore for MongoIdentityLog {
    fn read_lines(&self) -> Result<Vec<String>> {
        let cursor = self.collection.find(doc! {}).sort(doc! { "_id": 1 }).run()?;
        let mut lines = Vec::new();
        for document in cursor {
            let document = document?;
            if !document.line.trim().is_empty() {
                lines.push(document.line);
            }
        }
        Ok(lines)
    }

    fn append_lines(&self, lines: &[String]) -> Result<()> {
        insert_lines(&self.collection, lines)
    }

    /// Builds the new log in a staging collection and renames it over the
    /// live one, so readers see either the old log or the new one.
    fn overwrite_lines(&self, lines: &[String]) -> Result<()> {
        let staging = staging_name();
        self.db
            .recreate_collection(&staging)
            .context("preparing identity log staging collection")?;
        insert_lines(&self.staging, lines).context("writing identity log staging collection")?;
        self.db
            .replace_collection(&staging, COLLECTION)
            .context("swapping identity log collection")?;
        debug!("Replaced identity log with {} document(s)", lines.len());
        Ok(())
    }
}

fn insert_lines(collection: &Collection<LineDocument>, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    collection
        .insert_many(lines.iter().map(|line| LineDocument::new(line)))
        .run()?;
    Ok(())
}
