use sqlx::Row;

use omnichat_core::domain::channel::{
    Channel, ChannelId, ChannelType, ChannelVisibility, TenantId, UserId,
};

use super::{parse_timestamp, ChannelRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChannelRepository {
    pool: DbPool,
}

impl SqlChannelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CHANNEL_COLUMNS: &str = "id, tenant_id, channel_type, provider, sender_identifier,
     visibility, is_active, created_by, created_at, updated_at";

fn row_to_channel(row: &sqlx::sqlite::SqliteRow) -> Result<Channel, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let channel_type_str: String =
        row.try_get("channel_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let provider: String =
        row.try_get("provider").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sender_identifier: String =
        row.try_get("sender_identifier").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let visibility_str: String =
        row.try_get("visibility").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_by: String =
        row.try_get("created_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at_str: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let channel_type = ChannelType::parse(&channel_type_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown channel_type `{channel_type_str}`"))
    })?;
    let visibility = ChannelVisibility::parse(&visibility_str).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown visibility `{visibility_str}`"))
    })?;

    Ok(Channel {
        id: ChannelId(id),
        tenant_id: TenantId(tenant_id),
        channel_type,
        provider,
        sender_identifier,
        visibility,
        is_active,
        created_by: UserId(created_by),
        created_at: parse_timestamp(&created_at_str)?,
        updated_at: parse_timestamp(&updated_at_str)?,
    })
}

#[async_trait::async_trait]
impl ChannelRepository for SqlChannelRepository {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHANNEL_COLUMNS} FROM channel WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_channel(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_sender_identifier(
        &self,
        channel_type: ChannelType,
        identifier: &str,
    ) -> Result<Option<Channel>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channel
             WHERE channel_type = ? AND sender_identifier = ? AND is_active = 1"
        ))
        .bind(channel_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_channel(r)?)),
            None => Ok(None),
        }
    }

    async fn list_for_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
        channel_type: Option<ChannelType>,
    ) -> Result<Vec<Channel>, RepositoryError> {
        // Team-visible channels sort before private ones for deterministic
        // presentation.
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some(channel_type) = channel_type {
            sqlx::query(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channel
                 WHERE tenant_id = ? AND is_active = 1 AND channel_type = ?
                   AND (visibility = 'team' OR (visibility = 'private' AND created_by = ?))
                 ORDER BY CASE visibility WHEN 'team' THEN 0 ELSE 1 END, sender_identifier ASC"
            ))
            .bind(&tenant.0)
            .bind(channel_type.as_str())
            .bind(&user.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channel
                 WHERE tenant_id = ? AND is_active = 1
                   AND (visibility = 'team' OR (visibility = 'private' AND created_by = ?))
                 ORDER BY CASE visibility WHEN 'team' THEN 0 ELSE 1 END, sender_identifier ASC"
            ))
            .bind(&tenant.0)
            .bind(&user.0)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_channel).collect::<Result<Vec<_>, _>>()
    }

    async fn save(&self, channel: Channel) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO channel (id, tenant_id, channel_type, provider, sender_identifier,
                                  visibility, is_active, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 provider = excluded.provider,
                 sender_identifier = excluded.sender_identifier,
                 visibility = excluded.visibility,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&channel.id.0)
        .bind(&channel.tenant_id.0)
        .bind(channel.channel_type.as_str())
        .bind(&channel.provider)
        .bind(&channel.sender_identifier)
        .bind(channel.visibility.as_str())
        .bind(channel.is_active)
        .bind(&channel.created_by.0)
        .bind(channel.created_at.to_rfc3339())
        .bind(channel.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
