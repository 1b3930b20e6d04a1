use sqlx::Row;

use omnichat_core::domain::channel::ChannelId;
use omnichat_core::domain::template::{MessageTemplate, TemplateId, TemplateStatus};

use super::{parse_timestamp, RepositoryError, TemplateRepository};
use crate::DbPool;

pub struct SqlTemplateRepository {
    pool: DbPool,
}

impl SqlTemplateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const TEMPLATE_COLUMNS: &str = "id, channel_id, name, language, category, body, status, created_at";

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> Result<MessageTemplate, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let channel_id: String =
        row.try_get("channel_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let language: String =
        row.try_get("language").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let category: String =
        row.try_get("category").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let body: String = row.try_get("body").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = TemplateStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_str}`")))?;

    Ok(MessageTemplate {
        id: TemplateId(id),
        channel_id: ChannelId(channel_id),
        name,
        language,
        category,
        body,
        status,
        created_at: parse_timestamp(&created_at_str)?,
    })
}

#[async_trait::async_trait]
impl TemplateRepository for SqlTemplateRepository {
    async fn list_approved(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageTemplate>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM message_template
             WHERE channel_id = ? AND status = 'approved'
             ORDER BY name ASC, language ASC"
        ))
        .bind(&channel_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_template).collect::<Result<Vec<_>, _>>()
    }

    async fn find_by_name(
        &self,
        channel_id: &ChannelId,
        name: &str,
    ) -> Result<Option<MessageTemplate>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM message_template
             WHERE channel_id = ? AND name = ?
             ORDER BY language ASC LIMIT 1"
        ))
        .bind(&channel_id.0)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_template(r)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, template: MessageTemplate) -> Result<(), RepositoryError> {
        // Provider syncs re-deliver the same (channel, name, language) with a
        // fresh status; the natural key wins over the surrogate id.
        sqlx::query(
            "INSERT INTO message_template (id, channel_id, name, language, category, body,
                                           status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, name, language) DO UPDATE SET
                 category = excluded.category,
                 body = excluded.body,
                 status = excluded.status",
        )
        .bind(&template.id.0)
        .bind(&template.channel_id.0)
        .bind(&template.name)
        .bind(&template.language)
        .bind(&template.category)
        .bind(&template.body)
        .bind(template.status.as_str())
        .bind(template.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
