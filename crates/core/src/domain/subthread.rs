use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::UserId;
use super::thread::ThreadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationThreadId(pub String);

impl ConversationThreadId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for ConversationThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-side labeled segment of one thread's message history. Invisible
/// to the remote counterpart; never affects window-state computation. At most
/// one sub-thread per parent thread has `ended_at = None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSubThread {
    pub id: ConversationThreadId,
    pub thread_id: ThreadId,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
}

impl ConversationSubThread {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Listing row: the sub-thread plus how many messages were filed under it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubThreadSummary {
    pub sub_thread: ConversationSubThread,
    pub message_count: i64,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ConversationSubThread, ConversationThreadId};
    use crate::domain::channel::UserId;
    use crate::domain::thread::ThreadId;

    #[test]
    fn active_means_no_end_timestamp() {
        let mut sub = ConversationSubThread {
            id: ConversationThreadId("ct-1".to_string()),
            thread_id: ThreadId("th-1".to_string()),
            label: "march escalation".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            created_by: UserId("u-1".to_string()),
        };
        assert!(sub.is_active());

        sub.ended_at = Some(Utc::now());
        assert!(!sub.is_active());
    }
}
