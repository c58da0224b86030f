//! Punishment records and listing keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of punishment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum PunishmentType {
    Ban,
    Mute,
    Warn,
    Jail,
    #[serde(rename = "ipban")]
    IpBan,
}

impl PunishmentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "ban" => Some(Self::Ban),
            "mute" => Some(Self::Mute),
            "warn" | "warning" => Some(Self::Warn),
            "jail" => Some(Self::Jail),
            "ipban" => Some(Self::IpBan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
            Self::Warn => "warn",
            Self::Jail => "jail",
            Self::IpBan => "ipban",
        }
    }

    /// Whether this kind shows up in ban lists.
    pub fn is_ban(&self) -> bool {
        matches!(self, Self::Ban | Self::IpBan)
    }
}

/// A punishment as stored by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub id: Uuid,
    pub subject: Uuid,
    pub kind: PunishmentType,
    pub reason: String,
    pub start: DateTime<Utc>,
    /// `None` = permanent.
    pub end: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl PunishmentRecord {
    /// A fresh, unrevoked punishment starting now.
    pub fn new(
        subject: Uuid,
        kind: PunishmentType,
        reason: impl Into<String>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            kind,
            reason: reason.into(),
            start: Utc::now(),
            end,
            revoked: false,
        }
    }

    /// In effect at `now`: not revoked and either permanent or ending after `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.end.is_none_or(|end| end > now)
    }

    pub fn is_permanent(&self) -> bool {
        self.end.is_none()
    }
}

/// Which paged query a listing memoizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingKind {
    /// All punishments of one subject, newest first.
    History,
    /// Bans currently in effect.
    ActiveBans,
    /// Every ban ever issued.
    HistoricalBans,
}

impl ListingKind {
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::History => "punishments.history.list.fetch",
            Self::ActiveBans => "punishments.banlist.active.fetch",
            Self::HistoricalBans => "punishments.banlist.history.fetch",
        }
    }
}

/// Identifies one memoized listing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub kind: ListingKind,
    pub identifier: Option<Uuid>,
    pub limit: u32,
    pub offset: u32,
}
