use chrono::Utc;
use sqlx::Row;

use omnichat_core::domain::channel::UserId;
use omnichat_core::domain::subthread::{
    ConversationSubThread, ConversationThreadId, SubThreadSummary,
};
use omnichat_core::domain::thread::ThreadId;

use super::{parse_optional_timestamp, parse_timestamp, RepositoryError, SubThreadRepository};
use crate::DbPool;

pub struct SqlSubThreadRepository {
    pool: DbPool,
}

impl SqlSubThreadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_sub_thread(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationSubThread, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let thread_id: String =
        row.try_get("thread_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let label: String =
        row.try_get("label").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let started_at_str: String =
        row.try_get("started_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let ended_at_str: Option<String> =
        row.try_get("ended_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_by: String =
        row.try_get("created_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(ConversationSubThread {
        id: ConversationThreadId(id),
        thread_id: ThreadId(thread_id),
        label,
        started_at: parse_timestamp(&started_at_str)?,
        ended_at: parse_optional_timestamp(ended_at_str)?,
        created_by: UserId(created_by),
    })
}

#[async_trait::async_trait]
impl SubThreadRepository for SqlSubThreadRepository {
    async fn start_new(
        &self,
        thread_id: &ThreadId,
        label: &str,
        created_by: &UserId,
    ) -> Result<ConversationSubThread, RepositoryError> {
        // Close-then-open runs in one transaction; together with the partial
        // unique index there is no moment with two active sub-threads.
        let now = Utc::now();
        let sub_thread = ConversationSubThread {
            id: ConversationThreadId::generate(),
            thread_id: thread_id.clone(),
            label: label.to_string(),
            started_at: now,
            ended_at: None,
            created_by: created_by.clone(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE conversation_thread SET ended_at = ? WHERE thread_id = ? AND ended_at IS NULL",
        )
        .bind(now.to_rfc3339())
        .bind(&thread_id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_thread (id, thread_id, label, started_at, ended_at, created_by)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(&sub_thread.id.0)
        .bind(&thread_id.0)
        .bind(label)
        .bind(now.to_rfc3339())
        .bind(&created_by.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(sub_thread)
    }

    async fn active_for(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationSubThread>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, thread_id, label, started_at, ended_at, created_by
             FROM conversation_thread
             WHERE thread_id = ? AND ended_at IS NULL",
        )
        .bind(&thread_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_sub_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_id(
        &self,
        id: &ConversationThreadId,
    ) -> Result<Option<ConversationSubThread>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, thread_id, label, started_at, ended_at, created_by
             FROM conversation_thread WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_sub_thread(r)?)),
            None => Ok(None),
        }
    }

    async fn list_for(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<SubThreadSummary>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT ct.id, ct.thread_id, ct.label, ct.started_at, ct.ended_at, ct.created_by,
                    (SELECT COUNT(*) FROM message m WHERE m.conversation_thread_id = ct.id)
                        AS message_count
             FROM conversation_thread ct
             WHERE ct.thread_id = ?
             ORDER BY ct.started_at DESC",
        )
        .bind(&thread_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let message_count: i64 = row
                    .try_get("message_count")
                    .map_err(|e| RepositoryError::Decode(e.to_string()))?;
                Ok(SubThreadSummary { sub_thread: row_to_sub_thread(row)?, message_count })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()
    }
}
