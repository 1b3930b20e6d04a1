use chrono::{DateTime, Utc};
use sqlx::Row;

use omnichat_core::domain::message::{Message, MessageId, MessageStatus, MessageType};
use omnichat_core::domain::subthread::ConversationThreadId;
use omnichat_core::domain::thread::{Direction, ThreadId};

use super::{parse_optional_timestamp, parse_timestamp, MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = "id, thread_id, conversation_thread_id, direction, body,
     message_type, status, provider_message_id, sent_at, created_at";

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let thread_id: String =
        row.try_get("thread_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let conversation_thread_id: Option<String> = row
        .try_get("conversation_thread_id")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let direction_str: String =
        row.try_get("direction").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let body: String = row.try_get("body").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let message_type_str: String =
        row.try_get("message_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let provider_message_id: Option<String> =
        row.try_get("provider_message_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sent_at_str: Option<String> =
        row.try_get("sent_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let direction = Direction::parse(&direction_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown direction `{direction_str}`")))?;
    let message_type = MessageType::parse(&message_type_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown message_type `{message_type_str}`"))
    })?;
    let status = MessageStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_str}`")))?;

    Ok(Message {
        id: MessageId(id),
        thread_id: ThreadId(thread_id),
        conversation_thread_id: conversation_thread_id.map(ConversationThreadId),
        direction,
        body,
        message_type,
        status,
        provider_message_id,
        sent_at: parse_optional_timestamp(sent_at_str)?,
        created_at: parse_timestamp(&created_at_str)?,
    })
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
        sub_thread: Option<&ConversationThreadId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        // rowid breaks ties so concurrent appends keep insertion order.
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some(sub_thread) = sub_thread {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message
                 WHERE thread_id = ? AND conversation_thread_id = ?
                 ORDER BY COALESCE(sent_at, created_at) ASC, rowid ASC"
            ))
            .bind(&thread_id.0)
            .bind(&sub_thread.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message
                 WHERE thread_id = ?
                 ORDER BY COALESCE(sent_at, created_at) ASC, rowid ASC"
            ))
            .bind(&thread_id.0)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()
    }

    async fn list_since(
        &self,
        thread_id: &ThreadId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE thread_id = ? AND created_at > ?
             ORDER BY COALESCE(sent_at, created_at) ASC, rowid ASC"
        ))
        .bind(&thread_id.0)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()
    }

    async fn update_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE message SET status = ? WHERE provider_message_id = ?")
            .bind(status.as_str())
            .bind(provider_message_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use omnichat_core::domain::channel::{ChannelId, ChannelType};
    use omnichat_core::domain::message::MessageStatus;
    use omnichat_core::domain::thread::Direction;

    use super::SqlMessageRepository;
    use crate::fixtures::{channel_fixture, message_fixture};
    use crate::repositories::{
        ChannelRepository, MessageRepository, SqlChannelRepository, SqlThreadRepository,
        ThreadRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> (sqlx::SqlitePool, omnichat_core::domain::thread::Thread) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let channels = SqlChannelRepository::new(pool.clone());
        channels
            .save(channel_fixture("ch-1", ChannelType::WhatsApp, "15550001111"))
            .await
            .expect("seed channel");

        let threads = SqlThreadRepository::new(pool.clone());
        let thread = threads
            .resolve_or_create(&ChannelId("ch-1".to_string()), "+15550002222", None)
            .await
            .expect("thread");
        (pool, thread)
    }

    #[tokio::test]
    async fn timeline_orders_by_sent_at_then_insertion() {
        let (pool, thread) = setup().await;
        let threads = SqlThreadRepository::new(pool.clone());
        let repo = SqlMessageRepository::new(pool);

        let base = Utc::now();

        let mut late = message_fixture(&thread.id, Direction::Inbound, "second");
        late.sent_at = Some(base + Duration::seconds(10));
        threads.record_inbound(late, true).await.expect("record late");

        let mut early = message_fixture(&thread.id, Direction::Inbound, "first");
        early.sent_at = Some(base);
        threads.record_inbound(early, true).await.expect("record early");

        let timeline = repo.list_for_thread(&thread.id, None).await.expect("list");
        let bodies: Vec<&str> = timeline.iter().map(|message| message.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn status_update_targets_existing_message_only() {
        let (pool, thread) = setup().await;
        let threads = SqlThreadRepository::new(pool.clone());
        let repo = SqlMessageRepository::new(pool);

        let mut outbound = message_fixture(&thread.id, Direction::Outbound, "on its way");
        outbound.status = MessageStatus::Sent;
        outbound.provider_message_id = Some("wamid.1".to_string());
        threads.record_outbound(outbound).await.expect("record");

        let updated = repo
            .update_status_by_provider_id("wamid.1", MessageStatus::Delivered)
            .await
            .expect("update");
        assert!(updated);

        let missing = repo
            .update_status_by_provider_id("wamid.unknown", MessageStatus::Delivered)
            .await
            .expect("update unknown");
        assert!(!missing, "a status update for an unknown message creates nothing");

        let timeline = repo.list_for_thread(&thread.id, None).await.expect("list");
        assert_eq!(timeline.len(), 1, "status updates never insert new rows");
        assert_eq!(timeline[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn list_since_returns_only_newer_messages() {
        let (pool, thread) = setup().await;
        let threads = SqlThreadRepository::new(pool.clone());
        let repo = SqlMessageRepository::new(pool);

        let mut old = message_fixture(&thread.id, Direction::Inbound, "old");
        old.created_at = Utc::now() - Duration::minutes(10);
        threads.record_inbound(old, true).await.expect("record old");

        let cutoff = Utc::now() - Duration::minutes(5);

        threads
            .record_inbound(message_fixture(&thread.id, Direction::Inbound, "new"), true)
            .await
            .expect("record new");

        let recent = repo.list_since(&thread.id, cutoff).await.expect("list since");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].body, "new");
    }
}
