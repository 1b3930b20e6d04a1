use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::ChannelId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Polymorphic link from a thread to an external business entity. The tag is
/// an opaque string resolved through the context alias table; the id points
/// into the external record layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub entity_type: String,
    pub entity_id: i64,
}

/// One conversation container per (channel, counterpart). Email threads are
/// correlated by a provider reply token; WhatsApp threads by the remote phone
/// number. The (channel_id, counterpart) pair is unique in storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub channel_id: ChannelId,
    pub counterpart: String,
    pub reply_token: Option<String>,
    pub context: Option<ContextRef>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub is_unread: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// Direction of the latest activity, derived from the stored aggregate
    /// timestamps. Ties favor inbound.
    pub fn last_direction(&self) -> Option<Direction> {
        match (self.last_inbound_at, self.last_outbound_at) {
            (Some(inbound), Some(outbound)) if inbound >= outbound => Some(Direction::Inbound),
            (Some(_), Some(_)) => Some(Direction::Outbound),
            (Some(_), None) => Some(Direction::Inbound),
            (None, Some(_)) => Some(Direction::Outbound),
            (None, None) => None,
        }
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_inbound_at, self.last_outbound_at) {
            (Some(inbound), Some(outbound)) => Some(inbound.max(outbound)),
            (inbound, outbound) => inbound.or(outbound),
        }
    }
}

/// Listing row for the conversation panel: the thread plus its derived
/// last-activity presentation fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub channel_id: ChannelId,
    pub counterpart: String,
    pub context: Option<ContextRef>,
    pub is_unread: bool,
    pub last_direction: Option<Direction>,
    pub last_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadSummary {
    pub fn from_thread(thread: &Thread) -> Self {
        Self {
            id: thread.id.clone(),
            channel_id: thread.channel_id.clone(),
            counterpart: thread.counterpart.clone(),
            context: thread.context.clone(),
            is_unread: thread.is_unread,
            last_direction: thread.last_direction(),
            last_at: thread.last_activity_at().map(format_last_at),
            updated_at: thread.updated_at,
        }
    }
}

/// Human-readable timestamp for thread listings.
pub fn format_last_at(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

/// Normalizes a phone number to digits with a leading `+` so the same remote
/// number always resolves to the same WhatsApp thread regardless of how a
/// provider formats it.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}
