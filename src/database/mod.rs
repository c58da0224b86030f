//! Database module exports.

mod identity_log;
mod mongo;
mod punishments;

pub use identity_log::MongoIdentityLog;
pub use mongo::Database;
pub use punishments::MongoPunishmentStore;
