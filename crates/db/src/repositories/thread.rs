use chrono::Utc;
use sqlx::Row;

use omnichat_core::domain::channel::ChannelId;
use omnichat_core::domain::message::Message;
use omnichat_core::domain::thread::{ContextRef, Direction, Thread, ThreadId};

use super::{
    parse_optional_timestamp, parse_timestamp, ContextFilter, RepositoryError, ThreadRepository,
};
use crate::DbPool;

pub struct SqlThreadRepository {
    pool: DbPool,
}

impl SqlThreadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const THREAD_COLUMNS: &str = "id, channel_id, counterpart, reply_token, context_model,
     context_model_id, last_inbound_at, last_outbound_at, is_unread, created_at, updated_at";

fn row_to_thread(row: &sqlx::sqlite::SqliteRow) -> Result<Thread, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let channel_id: String =
        row.try_get("channel_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let counterpart: String =
        row.try_get("counterpart").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reply_token: Option<String> =
        row.try_get("reply_token").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let context_model: Option<String> =
        row.try_get("context_model").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let context_model_id: Option<i64> =
        row.try_get("context_model_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_inbound_at_str: Option<String> =
        row.try_get("last_inbound_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_outbound_at_str: Option<String> =
        row.try_get("last_outbound_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_unread: bool =
        row.try_get("is_unread").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at_str: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let context = match (context_model, context_model_id) {
        (Some(entity_type), Some(entity_id)) => Some(ContextRef { entity_type, entity_id }),
        _ => None,
    };

    Ok(Thread {
        id: ThreadId(id),
        channel_id: ChannelId(channel_id),
        counterpart,
        reply_token,
        context,
        last_inbound_at: parse_optional_timestamp(last_inbound_at_str)?,
        last_outbound_at: parse_optional_timestamp(last_outbound_at_str)?,
        is_unread,
        created_at: parse_timestamp(&created_at_str)?,
        updated_at: parse_timestamp(&updated_at_str)?,
    })
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message: &Message,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO message (id, thread_id, conversation_thread_id, direction, body,
                              message_type, status, provider_message_id, sent_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id.0)
    .bind(&message.thread_id.0)
    .bind(message.conversation_thread_id.as_ref().map(|id| id.0.as_str()))
    .bind(message.direction.as_str())
    .bind(&message.body)
    .bind(message.message_type.as_str())
    .bind(message.status.as_str())
    .bind(message.provider_message_id.as_deref())
    .bind(message.sent_at.map(|at| at.to_rfc3339()))
    .bind(message.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl ThreadRepository for SqlThreadRepository {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<Thread>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {THREAD_COLUMNS} FROM thread WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_counterpart(
        &self,
        channel_id: &ChannelId,
        counterpart: &str,
    ) -> Result<Option<Thread>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM thread WHERE channel_id = ? AND counterpart = ?"
        ))
        .bind(&channel_id.0)
        .bind(counterpart)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_reply_token(
        &self,
        channel_id: &ChannelId,
        reply_token: &str,
    ) -> Result<Option<Thread>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM thread WHERE channel_id = ? AND reply_token = ?"
        ))
        .bind(&channel_id.0)
        .bind(reply_token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn resolve_or_create(
        &self,
        channel_id: &ChannelId,
        counterpart: &str,
        reply_token: Option<&str>,
    ) -> Result<Thread, RepositoryError> {
        // Atomic upsert keyed on UNIQUE(channel_id, counterpart): concurrent
        // webhook deliveries for a new counterpart collapse onto one row
        // instead of racing a read-then-write.
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO thread (id, channel_id, counterpart, reply_token, is_unread,
                                 created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT(channel_id, counterpart) DO UPDATE SET
                 reply_token = COALESCE(thread.reply_token, excluded.reply_token)",
        )
        .bind(ThreadId::generate().0)
        .bind(&channel_id.0)
        .bind(counterpart)
        .bind(reply_token)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_by_counterpart(channel_id, counterpart).await?.ok_or_else(|| {
            RepositoryError::Decode(format!(
                "thread for channel `{channel_id}` counterpart `{counterpart}` vanished after upsert"
            ))
        })
    }

    async fn list_for_channel(
        &self,
        channel_id: &ChannelId,
        context: Option<&ContextFilter>,
        limit: u32,
    ) -> Result<Vec<Thread>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = match context {
            Some(filter) if !filter.variants.is_empty() => {
                let placeholders = vec!["?"; filter.variants.len()].join(", ");
                let sql = format!(
                    "SELECT {THREAD_COLUMNS} FROM thread
                     WHERE channel_id = ? AND context_model IN ({placeholders})
                       AND context_model_id = ?
                     ORDER BY updated_at DESC
                     LIMIT ?"
                );
                let mut query = sqlx::query(&sql).bind(&channel_id.0);
                for variant in &filter.variants {
                    query = query.bind(variant);
                }
                query.bind(filter.entity_id).bind(limit).fetch_all(&self.pool).await?
            }
            _ => {
                sqlx::query(&format!(
                    "SELECT {THREAD_COLUMNS} FROM thread
                     WHERE channel_id = ?
                     ORDER BY updated_at DESC
                     LIMIT ?"
                ))
                .bind(&channel_id.0)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_thread).collect::<Result<Vec<_>, _>>()
    }

    async fn newest_for_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<Thread>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM thread
             WHERE channel_id = ?
             ORDER BY updated_at DESC
             LIMIT 1"
        ))
        .bind(&channel_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn record_inbound(
        &self,
        message: Message,
        mark_unread: bool,
    ) -> Result<(), RepositoryError> {
        debug_assert_eq!(message.direction, Direction::Inbound);
        let activity_at = message.ordering_key().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        insert_message(&mut tx, &message).await?;
        sqlx::query(
            "UPDATE thread
             SET last_inbound_at = ?,
                 is_unread = CASE WHEN ? THEN 1 ELSE is_unread END,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&activity_at)
        .bind(mark_unread)
        .bind(Utc::now().to_rfc3339())
        .bind(&message.thread_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_outbound(&self, message: Message) -> Result<(), RepositoryError> {
        debug_assert_eq!(message.direction, Direction::Outbound);
        let activity_at = message.ordering_key().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        insert_message(&mut tx, &message).await?;
        sqlx::query("UPDATE thread SET last_outbound_at = ?, updated_at = ? WHERE id = ?")
            .bind(&activity_at)
            .bind(Utc::now().to_rfc3339())
            .bind(&message.thread_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn tag_context(
        &self,
        thread_id: &ThreadId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<(), RepositoryError> {
        // First writer wins; re-tagging an already-linked thread is a no-op
        // so a later unrelated reply cannot re-parent the conversation.
        sqlx::query(
            "UPDATE thread
             SET context_model = ?, context_model_id = ?, updated_at = ?
             WHERE id = ? AND context_model IS NULL",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&thread_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_read(&self, thread_id: &ThreadId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE thread SET is_unread = 0 WHERE id = ?")
            .bind(&thread_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, thread_id: &ThreadId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM thread WHERE id = ?").bind(&thread_id.0).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use omnichat_core::domain::channel::{ChannelId, ChannelType};
    use omnichat_core::domain::thread::Direction;

    use super::SqlThreadRepository;
    use crate::fixtures::{channel_fixture, message_fixture};
    use crate::repositories::{
        ChannelRepository, ContextFilter, RepositoryError, SqlChannelRepository, ThreadRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool =
            connect_with_settings("sqlite::memory:?cache=shared", 2, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let channels = SqlChannelRepository::new(pool.clone());
        channels
            .save(channel_fixture("ch-1", ChannelType::WhatsApp, "15550001111"))
            .await
            .expect("seed channel");
        pool
    }

    fn channel_id() -> ChannelId {
        ChannelId("ch-1".to_string())
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let first =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        let second =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("resolve");

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn concurrent_resolve_or_create_yields_one_thread() {
        let pool = setup().await;
        let repo = Arc::new(SqlThreadRepository::new(pool.clone()));

        let left = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move {
                repo.resolve_or_create(&channel_id(), "+15550002222", None).await
            })
        };
        let right = {
            let repo = Arc::clone(&repo);
            tokio::spawn(async move {
                repo.resolve_or_create(&channel_id(), "+15550002222", None).await
            })
        };

        let first = left.await.expect("join").expect("resolve");
        let second = right.await.expect("join").expect("resolve");
        assert_eq!(first.id, second.id);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM thread WHERE channel_id = 'ch-1' AND counterpart = '+15550002222'",
        )
        .fetch_one(&pool)
        .await
        .expect("count threads");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn resolve_or_create_backfills_missing_reply_token_only() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let created = repo
            .resolve_or_create(&channel_id(), "ana@customer.test", Some("tok-1"))
            .await
            .expect("create");
        assert_eq!(created.reply_token.as_deref(), Some("tok-1"));

        let resolved = repo
            .resolve_or_create(&channel_id(), "ana@customer.test", Some("tok-2"))
            .await
            .expect("resolve");
        assert_eq!(resolved.reply_token.as_deref(), Some("tok-1"), "existing token is kept");
    }

    #[tokio::test]
    async fn record_inbound_bumps_window_timestamp_and_unread() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        assert!(thread.last_inbound_at.is_none());

        let message = message_fixture(&thread.id, Direction::Inbound, "hola");
        repo.record_inbound(message, true).await.expect("record");

        let reloaded = repo.find_by_id(&thread.id).await.expect("find").expect("exists");
        assert!(reloaded.last_inbound_at.is_some());
        assert!(reloaded.is_unread);
        assert!(reloaded.last_outbound_at.is_none(), "inbound never touches outbound side");
    }

    #[tokio::test]
    async fn record_inbound_can_suppress_unread_for_viewed_thread() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        let message = message_fixture(&thread.id, Direction::Inbound, "hola");
        repo.record_inbound(message, false).await.expect("record");

        let reloaded = repo.find_by_id(&thread.id).await.expect("find").expect("exists");
        assert!(!reloaded.is_unread);
    }

    #[tokio::test]
    async fn record_outbound_never_extends_the_inbound_side() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        let message = message_fixture(&thread.id, Direction::Outbound, "thanks!");
        repo.record_outbound(message).await.expect("record");

        let reloaded = repo.find_by_id(&thread.id).await.expect("find").expect("exists");
        assert!(reloaded.last_outbound_at.is_some());
        assert!(reloaded.last_inbound_at.is_none());
    }

    #[tokio::test]
    async fn tag_context_is_first_writer_wins() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");

        repo.tag_context(&thread.id, "deal", 42).await.expect("first tag");
        repo.tag_context(&thread.id, "ticket", 7).await.expect("second tag is a no-op");

        let reloaded = repo.find_by_id(&thread.id).await.expect("find").expect("exists");
        let context = reloaded.context.expect("context set");
        assert_eq!(context.entity_type, "deal");
        assert_eq!(context.entity_id, 42);
    }

    #[tokio::test]
    async fn list_for_channel_filters_by_context_variants() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let tagged =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        repo.tag_context(&tagged.id, "crm.deal", 42).await.expect("tag");

        let untagged =
            repo.resolve_or_create(&channel_id(), "+15550003333", None).await.expect("create");
        let _ = untagged;

        let filter = ContextFilter {
            variants: vec!["deal".to_string(), "crm.deal".to_string()],
            entity_id: 42,
        };
        let matching =
            repo.list_for_channel(&channel_id(), Some(&filter), 50).await.expect("list");
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id, tagged.id);

        let all = repo.list_for_channel(&channel_id(), None, 50).await.expect("list all");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn list_for_channel_never_leaks_other_channels() {
        let pool = setup().await;
        let channels = SqlChannelRepository::new(pool.clone());
        channels
            .save(channel_fixture("ch-2", ChannelType::WhatsApp, "15550009999"))
            .await
            .expect("seed second channel");

        let repo = SqlThreadRepository::new(pool);
        repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        repo.resolve_or_create(&ChannelId("ch-2".to_string()), "+15550002222", None)
            .await
            .expect("create on other channel");

        let listed = repo.list_for_channel(&channel_id(), None, 50).await.expect("list");
        assert!(listed.iter().all(|thread| thread.channel_id == channel_id()));
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_activity() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool);

        let older =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        let newer =
            repo.resolve_or_create(&channel_id(), "+15550003333", None).await.expect("create");

        let mut message = message_fixture(&older.id, Direction::Inbound, "bump");
        message.sent_at = Some(Utc::now() + Duration::seconds(5));
        repo.record_inbound(message, true).await.expect("record");

        let listed = repo.list_for_channel(&channel_id(), None, 50).await.expect("list");
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[1].id, newer.id);

        let newest = repo.newest_for_channel(&channel_id()).await.expect("newest");
        assert_eq!(newest.expect("some").id, older.id);
    }

    #[tokio::test]
    async fn corrupt_stored_timestamp_surfaces_as_decode_error() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool.clone());

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");

        sqlx::query("UPDATE thread SET created_at = 'not-a-timestamp' WHERE id = ?")
            .bind(&thread.id.0)
            .execute(&pool)
            .await
            .expect("corrupt row");

        let error = repo.find_by_id(&thread.id).await.expect_err("decode must fail");
        assert!(matches!(error, RepositoryError::Decode(_)), "got {error:?}");
    }

    #[tokio::test]
    async fn delete_removes_thread_and_cascades_messages() {
        let pool = setup().await;
        let repo = SqlThreadRepository::new(pool.clone());

        let thread =
            repo.resolve_or_create(&channel_id(), "+15550002222", None).await.expect("create");
        repo.record_inbound(message_fixture(&thread.id, Direction::Inbound, "hola"), true)
            .await
            .expect("record");

        assert!(repo.delete(&thread.id).await.expect("delete"));
        assert!(!repo.delete(&thread.id).await.expect("second delete finds nothing"));

        let (message_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM message WHERE thread_id = ?")
                .bind(&thread.id.0)
                .fetch_one(&pool)
                .await
                .expect("count messages");
        assert_eq!(message_count, 0);
    }
}
