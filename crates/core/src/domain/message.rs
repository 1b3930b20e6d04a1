use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subthread::ConversationThreadId;
use super::thread::{Direction, ThreadId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Template,
    Media,
}

impl MessageType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "template" => Some(Self::Template),
            "media" => Some(Self::Media),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Template => "template",
            Self::Media => "media",
        }
    }
}

/// Provider-reported lifecycle of a message. Inbound messages are `Received`
/// on arrival; outbound messages progress through `Sent`/`Delivered`/`Read`
/// via status webhooks, or land in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(Self::Received),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

/// Immutable once delivered. `conversation_thread_id` is assigned at
/// send/receive time from whichever sub-thread is then active and never
/// changes afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub conversation_thread_id: Option<ConversationThreadId>,
    pub direction: Direction,
    pub body: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Timeline ordering key: `sent_at` when the provider reported one,
    /// otherwise the local insertion timestamp.
    pub fn ordering_key(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or(self.created_at)
    }
}
