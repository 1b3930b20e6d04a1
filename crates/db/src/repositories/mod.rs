use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use omnichat_core::domain::channel::{Channel, ChannelId, ChannelType, TenantId, UserId};
use omnichat_core::domain::message::{Message, MessageStatus};
use omnichat_core::domain::subthread::{
    ConversationSubThread, ConversationThreadId, SubThreadSummary,
};
use omnichat_core::domain::template::MessageTemplate;
use omnichat_core::domain::thread::{Thread, ThreadId};

pub mod channel;
pub mod message;
pub mod subthread;
pub mod template;
pub mod thread;

pub use channel::SqlChannelRepository;
pub use message::SqlMessageRepository;
pub use subthread::SqlSubThreadRepository;
pub use template::SqlTemplateRepository;
pub use thread::SqlThreadRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Timestamps are stored as RFC 3339 TEXT; a row that fails to parse is
/// corrupt and surfaces as a decode error rather than a substituted value.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("malformed timestamp `{raw}`: {e}")))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// OR-filter over a thread's polymorphic context link: any of `variants`
/// paired with the exact entity id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextFilter {
    pub variants: Vec<String>,
    pub entity_id: i64,
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<Channel>, RepositoryError>;

    /// Resolves the target channel for an inbound webhook from the payload's
    /// recipient identity alone.
    async fn find_by_sender_identifier(
        &self,
        channel_type: ChannelType,
        identifier: &str,
    ) -> Result<Option<Channel>, RepositoryError>;

    /// Active channels usable by `user`: team-visible ones plus the user's
    /// own private ones, team before private, then by sender identifier.
    async fn list_for_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
        channel_type: Option<ChannelType>,
    ) -> Result<Vec<Channel>, RepositoryError>;

    async fn save(&self, channel: Channel) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn find_by_id(&self, id: &ThreadId) -> Result<Option<Thread>, RepositoryError>;

    async fn find_by_counterpart(
        &self,
        channel_id: &ChannelId,
        counterpart: &str,
    ) -> Result<Option<Thread>, RepositoryError>;

    async fn find_by_reply_token(
        &self,
        channel_id: &ChannelId,
        reply_token: &str,
    ) -> Result<Option<Thread>, RepositoryError>;

    /// Idempotent thread resolution. Creation races on the same
    /// (channel, counterpart) pair collapse onto one row via the unique
    /// constraint; an existing thread is returned unchanged apart from
    /// backfilling a missing reply token.
    async fn resolve_or_create(
        &self,
        channel_id: &ChannelId,
        counterpart: &str,
        reply_token: Option<&str>,
    ) -> Result<Thread, RepositoryError>;

    async fn list_for_channel(
        &self,
        channel_id: &ChannelId,
        context: Option<&ContextFilter>,
        limit: u32,
    ) -> Result<Vec<Thread>, RepositoryError>;

    async fn newest_for_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Option<Thread>, RepositoryError>;

    /// Appends an inbound message and bumps `last_inbound_at` in one
    /// transaction. `mark_unread` is false when an active viewing session has
    /// the thread open.
    async fn record_inbound(
        &self,
        message: Message,
        mark_unread: bool,
    ) -> Result<(), RepositoryError>;

    /// Appends an outbound message and bumps `last_outbound_at` in one
    /// transaction. Never touches the messaging window.
    async fn record_outbound(&self, message: Message) -> Result<(), RepositoryError>;

    /// First-writer-wins context tagging: a no-op when the thread already
    /// carries a context link.
    async fn tag_context(
        &self,
        thread_id: &ThreadId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<(), RepositoryError>;

    async fn mark_read(&self, thread_id: &ThreadId) -> Result<(), RepositoryError>;

    /// Hard delete; messages and sub-threads cascade. Returns false when no
    /// such thread existed.
    async fn delete(&self, thread_id: &ThreadId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Timeline order: `sent_at` when present else `created_at`, ascending,
    /// with insertion order breaking ties.
    async fn list_for_thread(
        &self,
        thread_id: &ThreadId,
        sub_thread: Option<&ConversationThreadId>,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn list_since(
        &self,
        thread_id: &ThreadId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Applies a provider delivery-status update to the matching outbound
    /// message. Returns false when no message carries that provider id.
    async fn update_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait SubThreadRepository: Send + Sync {
    /// Closes any active sub-thread for the parent and opens a new one inside
    /// a single transaction; the partial unique index makes a double-active
    /// state unrepresentable.
    async fn start_new(
        &self,
        thread_id: &ThreadId,
        label: &str,
        created_by: &UserId,
    ) -> Result<ConversationSubThread, RepositoryError>;

    async fn active_for(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationSubThread>, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &ConversationThreadId,
    ) -> Result<Option<ConversationSubThread>, RepositoryError>;

    async fn list_for(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<SubThreadSummary>, RepositoryError>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn list_approved(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageTemplate>, RepositoryError>;

    async fn find_by_name(
        &self,
        channel_id: &ChannelId,
        name: &str,
    ) -> Result<Option<MessageTemplate>, RepositoryError>;

    async fn save(&self, template: MessageTemplate) -> Result<(), RepositoryError>;
}
