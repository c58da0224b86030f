//! MongoDB database wrapper.
//!
//! Uses the driver's blocking API: every call here runs on a dispatcher
//! worker, never on the confined thread or inside an async task.

use mongodb::bson::{Document, doc};
use mongodb::sync::{Client, Collection};
use tracing::info;

/// Database wrapper for MongoDB operations.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    db: mongodb::sync::Database,
}

impl Database {
    /// Connect to MongoDB with the given URI and database name.
    ///
    /// # Errors
    /// Returns error if the URI is invalid or the server does not answer a ping.
    pub fn connect(uri: &str, db_name: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri)?;

        // Ping the database to verify connection
        client.database("admin").run_command(doc! { "ping": 1 }).run()?;

        info!("Successfully connected to MongoDB");

        let db = client.database(db_name);

        Ok(Self { client, db })
    }

    /// Get a reference to the underlying MongoDB client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get a typed collection from the database.
    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }

    /// Drop `name` if present and create it empty.
    pub fn recreate_collection(&self, name: &str) -> anyhow::Result<()> {
        self.db.collection::<Document>(name).drop().run()?;
        self.db.create_collection(name).run()?;
        Ok(())
    }

    /// Atomically replace `target` with `source` (server-side rename with `dropTarget`).
    pub fn replace_collection(&self, source: &str, target: &str) -> anyhow::Result<()> {
        self.client
            .database("admin")
            .run_command(rename_command(self.db.name(), source, target))
            .run()?;
        Ok(())
    }
}

fn rename_command(db: &str, source: &str, target: &str) -> Document {
    doc! {
        "renameCollection": format!("{db}.{source}"),
        "to": format!("{db}.{target}"),
        "dropTarget": true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_replaces_target_within_the_same_database() {
        let command = rename_command("warden", "player_cache_staging", "player_cache");
        assert_eq!(command.get_str("renameCollection").unwrap(), "warden.player_cache_staging");
        assert_eq!(command.get_str("to").unwrap(), "warden.player_cache");
        assert!(command.get_bool("dropTarget").unwrap());
        assert_eq!(command.keys().next().map(String::as_str), Some("renameCollection"));
    }
}
