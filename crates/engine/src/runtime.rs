//! The conversation runtime: wires repositories and outbound transports into
//! the operations the API surface exposes.
//!
//! Invariants enforced here rather than in storage:
//! - a free-form WhatsApp send is gated on the 24h window *before* any
//!   transport call;
//! - a failed provider send records nothing;
//! - inbound delivery suppresses the unread flag only when a live session has
//!   the thread on screen;
//! - messages are filed under whichever sub-thread is active at record time,
//!   never the one being viewed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use omnichat_core::domain::channel::{
    Channel, ChannelId, ChannelType, ChannelVisibility, TenantId, UserId,
};
use omnichat_core::domain::message::{Message, MessageId, MessageStatus, MessageType};
use omnichat_core::domain::subthread::{
    ConversationSubThread, ConversationThreadId, SubThreadSummary,
};
use omnichat_core::domain::template::MessageTemplate;
use omnichat_core::domain::thread::{normalize_phone, Direction, Thread, ThreadId, ThreadSummary};
use omnichat_core::errors::CommsError;
use omnichat_core::session::ViewMode;
use omnichat_core::template as template_rules;
use omnichat_core::window::{window_expires_at, window_state, WindowState};
use omnichat_core::resolve_context_variants;
use omnichat_db::repositories::{
    ChannelRepository, ContextFilter, MessageRepository, RepositoryError, SubThreadRepository,
    TemplateRepository, ThreadRepository,
};
use omnichat_providers::context_api::{ComposePrefill, ContextDirectory};
use omnichat_providers::inbound::{EmailInboundPayload, WhatsAppWebhookPayload};
use omnichat_providers::transport::{EmailTransport, WhatsAppTransport};

use crate::sessions::SessionRegistry;

const THREAD_LIST_LIMIT: u32 = 50;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Comms(#[from] CommsError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("record layer lookup failed: {0}")]
    ContextLookup(String),
}

/// What to put on the wire for one outbound send.
#[derive(Clone, Debug)]
pub enum OutboundContent {
    FreeForm { body: String, subject: Option<String> },
    Template { name: String, variables: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct SendRequest {
    pub channel_id: ChannelId,
    pub to: String,
    pub content: OutboundContent,
    /// Pending context tag applied after thread resolution; first writer wins.
    pub context: Option<(String, i64)>,
}

/// Poll result for one viewing session.
#[derive(Clone, Debug)]
pub struct ChangedSet {
    pub thread_id: Option<ThreadId>,
    pub new_messages: Vec<Message>,
    pub window_state: Option<WindowState>,
    pub window_expires_at: Option<DateTime<Utc>>,
}

/// Ingestion tally for one WhatsApp webhook request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub messages_ingested: usize,
    pub statuses_applied: usize,
}

pub struct ConversationEngine {
    channels: Arc<dyn ChannelRepository>,
    threads: Arc<dyn ThreadRepository>,
    messages: Arc<dyn MessageRepository>,
    sub_threads: Arc<dyn SubThreadRepository>,
    templates: Arc<dyn TemplateRepository>,
    email: Arc<dyn EmailTransport>,
    whatsapp: Arc<dyn WhatsAppTransport>,
    context_directory: Arc<dyn ContextDirectory>,
    sessions: SessionRegistry,
}

impl ConversationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: Arc<dyn ChannelRepository>,
        threads: Arc<dyn ThreadRepository>,
        messages: Arc<dyn MessageRepository>,
        sub_threads: Arc<dyn SubThreadRepository>,
        templates: Arc<dyn TemplateRepository>,
        email: Arc<dyn EmailTransport>,
        whatsapp: Arc<dyn WhatsAppTransport>,
        context_directory: Arc<dyn ContextDirectory>,
    ) -> Self {
        Self {
            channels,
            threads,
            messages,
            sub_threads,
            templates,
            email,
            whatsapp,
            context_directory,
            sessions: SessionRegistry::new(),
        }
    }

    async fn require_channel(&self, id: &ChannelId) -> Result<Channel, EngineError> {
        self.channels
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::Comms(CommsError::ChannelNotFound(id.clone())))
    }

    async fn require_thread(&self, id: &ThreadId) -> Result<Thread, EngineError> {
        self.threads
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::Comms(CommsError::ThreadNotFound(id.clone())))
    }

    pub async fn list_channels(
        &self,
        tenant: &TenantId,
        user: &UserId,
        channel_type: Option<ChannelType>,
    ) -> Result<Vec<Channel>, EngineError> {
        Ok(self.channels.list_for_user(tenant, user, channel_type).await?)
    }

    /// Threads for the conversation panel, optionally narrowed to one business
    /// context. The context tag is expanded through the alias table so
    /// historical spellings keep matching.
    pub async fn list_threads(
        &self,
        channel_id: &ChannelId,
        context: Option<(&str, i64)>,
    ) -> Result<Vec<ThreadSummary>, EngineError> {
        self.require_channel(channel_id).await?;

        let filter = context.map(|(tag, entity_id)| ContextFilter {
            variants: resolve_context_variants(tag),
            entity_id,
        });
        let threads = self
            .threads
            .list_for_channel(channel_id, filter.as_ref(), THREAD_LIST_LIMIT)
            .await?;
        Ok(threads.iter().map(ThreadSummary::from_thread).collect())
    }

    /// Timeline for a thread. When the session is viewing a past sub-thread of
    /// this thread, only that sub-thread's messages are returned.
    pub async fn list_messages(
        &self,
        session_key: &str,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>, EngineError> {
        self.require_thread(thread_id).await?;

        let session = self.sessions.snapshot(session_key).await;
        let sub_filter = if session.active_thread() == Some(thread_id) {
            session.viewing_sub_thread().cloned()
        } else {
            None
        };
        Ok(self.messages.list_for_thread(thread_id, sub_filter.as_ref()).await?)
    }

    pub async fn mark_read(&self, thread_id: &ThreadId) -> Result<(), EngineError> {
        self.require_thread(thread_id).await?;
        self.threads.mark_read(thread_id).await?;
        Ok(())
    }

    /// Current messaging-window state for a thread, derived from its
    /// `last_inbound_at`. Email threads are always open.
    pub async fn window_for_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<(WindowState, Option<DateTime<Utc>>), EngineError> {
        let thread = self.require_thread(thread_id).await?;
        let channel = self.require_channel(&thread.channel_id).await?;
        if channel.channel_type == ChannelType::Email {
            return Ok((WindowState::Open, None));
        }
        let now = Utc::now();
        Ok((window_state(thread.last_inbound_at, now), window_expires_at(thread.last_inbound_at)))
    }

    /// The outbound send path. Validation and window gating happen before any
    /// network call; the thread row and the message row are written only after
    /// the provider accepted the send, so a failed send leaves no trace.
    pub async fn send(&self, request: SendRequest) -> Result<Message, EngineError> {
        let channel = self.require_channel(&request.channel_id).await?;

        let to = request.to.trim();
        if to.is_empty() {
            return Err(CommsError::InvalidRequest("recipient is required".to_string()).into());
        }

        let counterpart = match channel.channel_type {
            ChannelType::WhatsApp => normalize_phone(to),
            ChannelType::Email => to.to_ascii_lowercase(),
        };
        let existing = self.threads.find_by_counterpart(&channel.id, &counterpart).await?;

        let now = Utc::now();
        let (body, message_type, receipt, reply_token) = match (&channel.channel_type, &request.content)
        {
            (ChannelType::Email, OutboundContent::FreeForm { body, subject }) => {
                if body.trim().is_empty() {
                    return Err(
                        CommsError::InvalidRequest("message body is required".to_string()).into()
                    );
                }
                let reply_token = existing
                    .as_ref()
                    .and_then(|thread| thread.reply_token.clone())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let subject = subject.clone().unwrap_or_default();
                let receipt = self
                    .email
                    .send_email(&channel, to, &subject, body, &reply_token)
                    .await
                    .map_err(|err| {
                        warn!(
                            event_name = "outbound_send_failed",
                            channel_id = %channel.id,
                            error = %err,
                            "email transport refused the send"
                        );
                        CommsError::ProviderSendFailed(err.to_string())
                    })?;
                (body.clone(), MessageType::Text, receipt, Some(reply_token))
            }
            (ChannelType::Email, OutboundContent::Template { .. }) => {
                return Err(CommsError::InvalidRequest(
                    "templates are only available on whatsapp channels".to_string(),
                )
                .into());
            }
            (ChannelType::WhatsApp, OutboundContent::FreeForm { body, .. }) => {
                if body.trim().is_empty() {
                    return Err(
                        CommsError::InvalidRequest("message body is required".to_string()).into()
                    );
                }
                let last_inbound = existing.as_ref().and_then(|thread| thread.last_inbound_at);
                if window_state(last_inbound, now) == WindowState::Closed {
                    return Err(CommsError::WindowClosed {
                        expires_at: window_expires_at(last_inbound),
                    }
                    .into());
                }
                let receipt = self
                    .whatsapp
                    .send_text(&channel, &counterpart, body)
                    .await
                    .map_err(|err| {
                        warn!(
                            event_name = "outbound_send_failed",
                            channel_id = %channel.id,
                            error = %err,
                            "whatsapp transport refused the send"
                        );
                        CommsError::ProviderSendFailed(err.to_string())
                    })?;
                (body.clone(), MessageType::Text, receipt, None)
            }
            (ChannelType::WhatsApp, OutboundContent::Template { name, variables }) => {
                let template = self
                    .templates
                    .find_by_name(&channel.id, name)
                    .await?
                    .ok_or_else(|| {
                        CommsError::InvalidRequest(format!("unknown template `{name}`"))
                    })?;
                template_rules::validate_send(&template, variables)?;
                let rendered = template_rules::preview(&template.body, variables);
                let receipt = self
                    .whatsapp
                    .send_template(&channel, &counterpart, &template, variables)
                    .await
                    .map_err(|err| {
                        warn!(
                            event_name = "outbound_send_failed",
                            channel_id = %channel.id,
                            template = %template.name,
                            error = %err,
                            "whatsapp transport refused the template send"
                        );
                        CommsError::ProviderSendFailed(err.to_string())
                    })?;
                (rendered, MessageType::Template, receipt, None)
            }
        };

        let thread = self
            .threads
            .resolve_or_create(&channel.id, &counterpart, reply_token.as_deref())
            .await?;
        let active_sub = self.sub_threads.active_for(&thread.id).await?;

        let message = Message {
            id: MessageId::generate(),
            thread_id: thread.id.clone(),
            conversation_thread_id: active_sub.map(|sub| sub.id),
            direction: Direction::Outbound,
            body,
            message_type,
            status: MessageStatus::Sent,
            provider_message_id: receipt.provider_message_id,
            sent_at: Some(now),
            created_at: now,
        };
        self.threads.record_outbound(message.clone()).await?;

        if let Some((tag, entity_id)) = &request.context {
            self.threads.tag_context(&thread.id, tag, *entity_id).await?;
        }

        info!(
            event_name = "outbound_recorded",
            channel_id = %channel.id,
            thread_id = %thread.id,
            message_type = message.message_type.as_str(),
            "outbound message recorded"
        );
        Ok(message)
    }

    /// Ingests one inbound email. The target channel is resolved solely from
    /// the recipient address; mail for an unregistered address is logged and
    /// dropped.
    pub async fn handle_email_inbound(
        &self,
        payload: &EmailInboundPayload,
    ) -> Result<Option<ThreadId>, EngineError> {
        let Some(channel) = self
            .channels
            .find_by_sender_identifier(ChannelType::Email, &payload.recipient.to_ascii_lowercase())
            .await?
        else {
            warn!(
                event_name = "inbound_email_unroutable",
                recipient = %payload.recipient,
                "inbound email for an unregistered address was dropped"
            );
            return Ok(None);
        };

        // A reply token pins the message to its original thread even when the
        // counterpart address changed (forwards, aliases).
        let thread = match &payload.reply_token {
            Some(token) => match self.threads.find_by_reply_token(&channel.id, token).await? {
                Some(thread) => thread,
                None => {
                    self.threads
                        .resolve_or_create(
                            &channel.id,
                            &payload.sender.to_ascii_lowercase(),
                            Some(token),
                        )
                        .await?
                }
            },
            None => {
                self.threads
                    .resolve_or_create(&channel.id, &payload.sender.to_ascii_lowercase(), None)
                    .await?
            }
        };

        let active_sub = self.sub_threads.active_for(&thread.id).await?;
        let mark_unread = !self.sessions.is_thread_in_view(&thread.id).await;
        let message = Message {
            id: MessageId::generate(),
            thread_id: thread.id.clone(),
            conversation_thread_id: active_sub.map(|sub| sub.id),
            direction: Direction::Inbound,
            body: payload.body.clone(),
            message_type: MessageType::Text,
            status: MessageStatus::Received,
            provider_message_id: payload.provider_message_id.clone(),
            sent_at: None,
            created_at: Utc::now(),
        };
        self.threads.record_inbound(message, mark_unread).await?;

        info!(
            event_name = "inbound_email_recorded",
            channel_id = %channel.id,
            thread_id = %thread.id,
            "inbound email recorded"
        );
        Ok(Some(thread.id))
    }

    /// Ingests one WhatsApp Cloud webhook request: new inbound messages and
    /// delivery-status updates, possibly mixed in one payload. Status updates
    /// for unknown provider ids are logged and skipped, never inserted.
    pub async fn handle_whatsapp_webhook(
        &self,
        payload: &WhatsAppWebhookPayload,
    ) -> Result<WebhookOutcome, EngineError> {
        let mut outcome = WebhookOutcome::default();

        for entry in &payload.entry {
            for change in &entry.changes {
                let value = &change.value;
                let Some(channel) = self
                    .channels
                    .find_by_sender_identifier(
                        ChannelType::WhatsApp,
                        &value.metadata.display_phone_number,
                    )
                    .await?
                else {
                    warn!(
                        event_name = "whatsapp_webhook_unroutable",
                        display_phone_number = %value.metadata.display_phone_number,
                        "webhook event for an unregistered number was dropped"
                    );
                    continue;
                };

                for inbound in &value.messages {
                    let counterpart = normalize_phone(&inbound.from);
                    let thread =
                        self.threads.resolve_or_create(&channel.id, &counterpart, None).await?;
                    let active_sub = self.sub_threads.active_for(&thread.id).await?;
                    let mark_unread = !self.sessions.is_thread_in_view(&thread.id).await;

                    let sent_at = inbound
                        .timestamp
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| DateTime::from_timestamp(secs, 0));
                    let message = Message {
                        id: MessageId::generate(),
                        thread_id: thread.id.clone(),
                        conversation_thread_id: active_sub.map(|sub| sub.id),
                        direction: Direction::Inbound,
                        body: inbound.display_body(),
                        message_type: MessageType::Text,
                        status: MessageStatus::Received,
                        provider_message_id: Some(inbound.id.clone()),
                        sent_at,
                        created_at: Utc::now(),
                    };
                    self.threads.record_inbound(message, mark_unread).await?;
                    outcome.messages_ingested += 1;
                }

                for status in &value.statuses {
                    let Some(parsed) = MessageStatus::parse(&status.status) else {
                        debug!(
                            event_name = "whatsapp_status_unknown",
                            status = %status.status,
                            "unrecognized delivery status was skipped"
                        );
                        continue;
                    };
                    let applied =
                        self.messages.update_status_by_provider_id(&status.id, parsed).await?;
                    if applied {
                        outcome.statuses_applied += 1;
                    } else {
                        debug!(
                            event_name = "whatsapp_status_unmatched",
                            provider_message_id = %status.id,
                            "status update matched no known message"
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    pub async fn start_sub_thread(
        &self,
        thread_id: &ThreadId,
        label: &str,
        created_by: &UserId,
    ) -> Result<ConversationSubThread, EngineError> {
        let thread = self.require_thread(thread_id).await?;
        if label.trim().is_empty() {
            return Err(CommsError::InvalidRequest("label is required".to_string()).into());
        }
        // Sub-threads segment WhatsApp timelines; email threads already carry
        // their own reply-token threading.
        let channel = self.require_channel(&thread.channel_id).await?;
        if channel.channel_type != ChannelType::WhatsApp {
            return Err(CommsError::InvalidRequest(
                "sub-threads are only available on whatsapp threads".to_string(),
            )
            .into());
        }
        Ok(self.sub_threads.start_new(thread_id, label.trim(), created_by).await?)
    }

    pub async fn list_sub_threads(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<SubThreadSummary>, EngineError> {
        self.require_thread(thread_id).await?;
        Ok(self.sub_threads.list_for(thread_id).await?)
    }

    /// Opens a thread in the session, optionally scoped to one sub-thread.
    /// Viewing the active sub-thread (or none) lands in live mode and clears
    /// the unread flag; viewing a past sub-thread freezes the view.
    pub async fn set_viewing_thread(
        &self,
        session_key: &str,
        thread_id: &ThreadId,
        requested: Option<ConversationThreadId>,
    ) -> Result<ViewMode, EngineError> {
        self.require_thread(thread_id).await?;

        if let Some(requested_id) = &requested {
            let sub = self.sub_threads.find_by_id(requested_id).await?.ok_or_else(|| {
                CommsError::InvalidRequest(format!("unknown sub-thread `{requested_id}`"))
            })?;
            if &sub.thread_id != thread_id {
                return Err(CommsError::InvalidRequest(
                    "sub-thread belongs to a different thread".to_string(),
                )
                .into());
            }
        }
        let active = self.sub_threads.active_for(thread_id).await?;

        let mode = self
            .sessions
            .with_session(session_key, |session| {
                session.set_active_thread(Some(thread_id.clone()));
                session.set_viewing(requested, active.as_ref().map(|sub| &sub.id))
            })
            .await;

        if mode == ViewMode::Live {
            self.threads.mark_read(thread_id).await?;
        }
        Ok(mode)
    }

    /// Switches the session to another channel. The previously active thread
    /// is remembered; the new channel restores its remembered thread when it
    /// still exists, else falls back to the newest thread, else none.
    pub async fn switch_channel(
        &self,
        session_key: &str,
        channel_id: &ChannelId,
    ) -> Result<Option<ThreadId>, EngineError> {
        let channel = self.require_channel(channel_id).await?;

        let remembered = self
            .sessions
            .with_session(session_key, |session| {
                session.begin_channel_switch(channel.channel_type, channel.id.clone())
            })
            .await;

        let restored = match remembered {
            Some(candidate) => match self.threads.find_by_id(&candidate).await? {
                Some(thread) if thread.channel_id == *channel_id => Some(thread),
                _ => self.threads.newest_for_channel(channel_id).await?,
            },
            None => self.threads.newest_for_channel(channel_id).await?,
        };
        let restored_id = restored.map(|thread| thread.id);

        self.sessions
            .with_session(session_key, |session| {
                session.set_active_thread(restored_id.clone());
            })
            .await;

        Ok(restored_id)
    }

    /// Poll-based refresh. Returns messages that arrived since the session's
    /// previous poll plus the current window state for the active thread. A
    /// frozen history view reports no new messages.
    pub async fn refresh(&self, session_key: &str) -> Result<ChangedSet, EngineError> {
        let now = Utc::now();
        let (active_thread, view_mode, since) = self
            .sessions
            .with_session(session_key, |session| {
                let since = session.note_refresh(now);
                (session.active_thread().cloned(), session.view_mode(), since)
            })
            .await;

        let Some(thread_id) = active_thread else {
            return Ok(ChangedSet {
                thread_id: None,
                new_messages: Vec::new(),
                window_state: None,
                window_expires_at: None,
            });
        };

        let thread = self.require_thread(&thread_id).await?;
        let channel = self.require_channel(&thread.channel_id).await?;

        let new_messages = if view_mode == ViewMode::History {
            Vec::new()
        } else {
            match since {
                Some(since) => self.messages.list_since(&thread_id, since).await?,
                None => self.messages.list_for_thread(&thread_id, None).await?,
            }
        };

        let (state, expires_at) = if channel.channel_type == ChannelType::Email {
            (WindowState::Open, None)
        } else {
            (window_state(thread.last_inbound_at, now), window_expires_at(thread.last_inbound_at))
        };

        Ok(ChangedSet {
            thread_id: Some(thread_id),
            new_messages,
            window_state: Some(state),
            window_expires_at: expires_at,
        })
    }

    /// Deletes a thread and all of its messages. Team-channel threads require
    /// a team admin; private-channel threads only their channel's creator.
    pub async fn delete_thread(
        &self,
        thread_id: &ThreadId,
        user: &UserId,
        is_team_admin: bool,
    ) -> Result<(), EngineError> {
        let thread = self.require_thread(thread_id).await?;
        let channel = self.require_channel(&thread.channel_id).await?;

        let allowed = match channel.visibility {
            ChannelVisibility::Team => is_team_admin,
            ChannelVisibility::Private => channel.created_by == *user,
        };
        if !allowed {
            return Err(CommsError::Unauthorized {
                user: user.0.clone(),
                action: "delete thread".to_string(),
            }
            .into());
        }

        self.threads.delete(thread_id).await?;
        self.sessions.forget_thread(thread_id).await;
        info!(
            event_name = "thread_deleted",
            thread_id = %thread_id,
            deleted_by = %user,
            "thread deleted"
        );
        Ok(())
    }

    pub async fn list_templates(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<MessageTemplate>, EngineError> {
        self.require_channel(channel_id).await?;
        Ok(self.templates.list_approved(channel_id).await?)
    }

    pub async fn preview_template(
        &self,
        channel_id: &ChannelId,
        name: &str,
        variables: &[String],
    ) -> Result<String, EngineError> {
        let template =
            self.templates.find_by_name(channel_id, name).await?.ok_or_else(|| {
                CommsError::InvalidRequest(format!("unknown template `{name}`"))
            })?;
        Ok(template_rules::preview(&template.body, variables))
    }

    /// Asks the record layer for recipients and a subject line to pre-fill a
    /// new outbound compose for one business entity.
    pub async fn compose_prefill(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Option<ComposePrefill>, EngineError> {
        self.context_directory
            .compose_prefill(entity_type, entity_id)
            .await
            .map_err(|error| EngineError::ContextLookup(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use omnichat_core::domain::channel::{ChannelId, ChannelType, ChannelVisibility, UserId};
    use omnichat_core::domain::message::{MessageStatus, MessageType};
    use omnichat_core::domain::template::TemplateStatus;
    use omnichat_core::errors::CommsError;
    use omnichat_core::session::ViewMode;
    use omnichat_core::window::WindowState;
    use omnichat_db::fixtures::{channel_fixture, template_fixture};
    use omnichat_db::repositories::{
        ChannelRepository, SqlChannelRepository, SqlMessageRepository, SqlSubThreadRepository,
        SqlTemplateRepository, SqlThreadRepository, TemplateRepository, ThreadRepository,
    };
    use omnichat_providers::context_api::{ComposePrefill, NoopContextDirectory};
    use omnichat_providers::inbound::WhatsAppWebhookPayload;
    use omnichat_providers::recording::{
        FailingWhatsAppTransport, RecordedWhatsAppSend, RecordingEmailTransport,
        RecordingWhatsAppTransport, StaticContextDirectory,
    };
    use omnichat_providers::transport::{EmailTransport, WhatsAppTransport};

    use super::{ConversationEngine, EngineError, OutboundContent, SendRequest};

    struct Harness {
        engine: ConversationEngine,
        pool: sqlx::SqlitePool,
        email: Arc<RecordingEmailTransport>,
        whatsapp: Arc<RecordingWhatsAppTransport>,
    }

    async fn harness() -> Harness {
        let email = Arc::new(RecordingEmailTransport::new());
        let whatsapp = Arc::new(RecordingWhatsAppTransport::new());
        harness_with(email.clone(), whatsapp.clone()).await
    }

    async fn harness_with(
        email: Arc<RecordingEmailTransport>,
        whatsapp: Arc<RecordingWhatsAppTransport>,
    ) -> Harness {
        let pool =
            omnichat_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        omnichat_db::migrations::run_pending(&pool).await.expect("migrations");
        let engine = build_engine(&pool, email.clone(), whatsapp.clone());
        Harness { engine, pool, email, whatsapp }
    }

    fn build_engine(
        pool: &sqlx::SqlitePool,
        email: Arc<dyn EmailTransport>,
        whatsapp: Arc<dyn WhatsAppTransport>,
    ) -> ConversationEngine {
        ConversationEngine::new(
            Arc::new(SqlChannelRepository::new(pool.clone())),
            Arc::new(SqlThreadRepository::new(pool.clone())),
            Arc::new(SqlMessageRepository::new(pool.clone())),
            Arc::new(SqlSubThreadRepository::new(pool.clone())),
            Arc::new(SqlTemplateRepository::new(pool.clone())),
            email,
            whatsapp,
            Arc::new(NoopContextDirectory),
        )
    }

    async fn seed_whatsapp_channel(pool: &sqlx::SqlitePool) -> ChannelId {
        let channels = SqlChannelRepository::new(pool.clone());
        channels
            .save(channel_fixture("ch-wa", ChannelType::WhatsApp, "15550001111"))
            .await
            .expect("seed channel");
        ChannelId("ch-wa".to_string())
    }

    async fn seed_email_channel(pool: &sqlx::SqlitePool) -> ChannelId {
        let channels = SqlChannelRepository::new(pool.clone());
        channels
            .save(channel_fixture("ch-email", ChannelType::Email, "sales@acme.test"))
            .await
            .expect("seed channel");
        ChannelId("ch-email".to_string())
    }

    fn wa_message_webhook(display_phone: &str, from: &str, wamid: &str, body: &str) -> WhatsAppWebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "waba-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": {
                            "display_phone_number": display_phone,
                            "phone_number_id": "phone-1"
                        },
                        "messages": [{
                            "from": from,
                            "id": wamid,
                            "timestamp": chrono::Utc::now().timestamp().to_string(),
                            "type": "text",
                            "text": {"body": body}
                        }]
                    }
                }]
            }]
        }))
        .expect("payload")
    }

    fn wa_status_webhook(display_phone: &str, wamid: &str, status: &str) -> WhatsAppWebhookPayload {
        serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "waba-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "metadata": {
                            "display_phone_number": display_phone,
                            "phone_number_id": "phone-1"
                        },
                        "statuses": [{
                            "id": wamid,
                            "status": status,
                            "timestamp": chrono::Utc::now().timestamp().to_string(),
                            "recipient_id": "15550002222"
                        }]
                    }
                }]
            }]
        }))
        .expect("payload")
    }

    fn free_form(channel: &ChannelId, to: &str, body: &str) -> SendRequest {
        SendRequest {
            channel_id: channel.clone(),
            to: to.to_string(),
            content: OutboundContent::FreeForm { body: body.to_string(), subject: None },
            context: None,
        }
    }

    #[tokio::test]
    async fn free_form_whatsapp_send_is_gated_on_the_window() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;

        let result = h.engine.send(free_form(&channel, "+15550002222", "hello")).await;
        assert!(matches!(
            result,
            Err(EngineError::Comms(CommsError::WindowClosed { expires_at: None }))
        ));
        assert!(h.whatsapp.sent().is_empty(), "gate fires before any transport call");

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "opening message",
            ))
            .await
            .expect("ingest");

        let message = h
            .engine
            .send(free_form(&channel, "+1 (555) 000-2222", "hello back"))
            .await
            .expect("send inside window");
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.provider_message_id.is_some());
        assert_eq!(h.whatsapp.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_provider_send_records_no_message() {
        let whatsapp = Arc::new(FailingWhatsAppTransport);
        let pool =
            omnichat_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        omnichat_db::migrations::run_pending(&pool).await.expect("migrations");
        let engine =
            build_engine(&pool, Arc::new(RecordingEmailTransport::new()), whatsapp);
        let channel = seed_whatsapp_channel(&pool).await;

        engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "opening message",
            ))
            .await
            .expect("ingest");

        let result = engine.send(free_form(&channel, "+15550002222", "will not go")).await;
        assert!(matches!(
            result,
            Err(EngineError::Comms(CommsError::ProviderSendFailed(_)))
        ));

        let threads = engine.list_threads(&channel, None).await.expect("list");
        let timeline =
            engine.list_messages("panel", &threads[0].id).await.expect("messages");
        assert_eq!(timeline.len(), 1, "only the inbound message exists");
    }

    #[tokio::test]
    async fn template_send_validates_before_transport_and_skips_the_window() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;
        let templates = SqlTemplateRepository::new(h.pool.clone());

        let mut pending = template_fixture(&channel, "welcome", "Hi {{1}}, order {{2}}");
        pending.status = TemplateStatus::Pending;
        templates.save(pending).await.expect("save pending");

        let request = SendRequest {
            channel_id: channel.clone(),
            to: "+15550002222".to_string(),
            content: OutboundContent::Template {
                name: "welcome".to_string(),
                variables: vec!["Ana".to_string(), "#42".to_string()],
            },
            context: None,
        };

        let result = h.engine.send(request.clone()).await;
        assert!(matches!(
            result,
            Err(EngineError::Comms(CommsError::TemplateNotApproved { .. }))
        ));

        templates
            .save(template_fixture(&channel, "welcome", "Hi {{1}}, order {{2}}"))
            .await
            .expect("approve");

        let mut incomplete = request.clone();
        incomplete.content = OutboundContent::Template {
            name: "welcome".to_string(),
            variables: vec!["Ana".to_string(), "  ".to_string()],
        };
        let result = h.engine.send(incomplete).await;
        assert!(matches!(
            result,
            Err(EngineError::Comms(CommsError::IncompleteVariables { index: 2 }))
        ));
        assert!(h.whatsapp.sent().is_empty(), "validation precedes transport");

        // No inbound ever arrived: the window is closed, templates go anyway.
        let message = h.engine.send(request).await.expect("template send");
        assert_eq!(message.message_type, MessageType::Template);
        assert_eq!(message.body, "Hi Ana, order #42");
        assert!(matches!(
            h.whatsapp.sent()[0],
            RecordedWhatsAppSend::Template { ref name, .. } if name == "welcome"
        ));
    }

    #[tokio::test]
    async fn email_reply_token_threads_replies_back() {
        let h = harness().await;
        let channel = seed_email_channel(&h.pool).await;

        let request = SendRequest {
            channel_id: channel.clone(),
            to: "Dana@Example.test".to_string(),
            content: OutboundContent::FreeForm {
                body: "following up on your request".to_string(),
                subject: Some("Your request".to_string()),
            },
            context: None,
        };
        h.engine.send(request).await.expect("send email");

        let sent = h.email.sent();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].reply_token.is_empty());

        let payload = omnichat_providers::inbound::EmailInboundPayload {
            recipient: "sales@acme.test".to_string(),
            sender: "dana@example.test".to_string(),
            subject: Some("Re: Your request".to_string()),
            body: "thanks, that works".to_string(),
            reply_token: Some(sent[0].reply_token.clone()),
            provider_message_id: None,
        };
        let thread_id = h
            .engine
            .handle_email_inbound(&payload)
            .await
            .expect("ingest")
            .expect("routable");

        let timeline = h.engine.list_messages("panel", &thread_id).await.expect("messages");
        assert_eq!(timeline.len(), 2, "reply joined the original thread");

        let (state, expires_at) =
            h.engine.window_for_thread(&thread_id).await.expect("window");
        assert_eq!(state, WindowState::Open, "email threads never close");
        assert_eq!(expires_at, None);
    }

    #[tokio::test]
    async fn sub_threads_are_rejected_on_email_threads() {
        let h = harness().await;
        seed_email_channel(&h.pool).await;

        let payload = omnichat_providers::inbound::EmailInboundPayload {
            recipient: "sales@acme.test".to_string(),
            sender: "dana@example.test".to_string(),
            subject: Some("Question".to_string()),
            body: "is the renewal still on?".to_string(),
            reply_token: None,
            provider_message_id: None,
        };
        let thread_id = h
            .engine
            .handle_email_inbound(&payload)
            .await
            .expect("ingest")
            .expect("routable");

        let operator = UserId("u-op".to_string());
        let error = h
            .engine
            .start_sub_thread(&thread_id, "renewal talk", &operator)
            .await
            .err()
            .expect("email threads cannot be segmented");
        assert!(matches!(error, EngineError::Comms(CommsError::InvalidRequest(_))));

        let summaries = h.engine.list_sub_threads(&thread_id).await.expect("list");
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn unread_is_suppressed_while_the_thread_is_on_screen() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "first",
            ))
            .await
            .expect("ingest");

        let threads = h.engine.list_threads(&channel, None).await.expect("list");
        assert!(threads[0].is_unread, "fresh inbound flags the thread");
        let thread_id = threads[0].id.clone();

        let mode = h
            .engine
            .set_viewing_thread("panel", &thread_id, None)
            .await
            .expect("open thread");
        assert_eq!(mode, ViewMode::Live);

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in2",
                "second",
            ))
            .await
            .expect("ingest");

        let threads = h.engine.list_threads(&channel, None).await.expect("list");
        assert!(!threads[0].is_unread, "on-screen delivery stays read");
    }

    #[tokio::test]
    async fn status_updates_apply_to_known_messages_only() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "opening",
            ))
            .await
            .expect("ingest");
        let sent =
            h.engine.send(free_form(&channel, "+15550002222", "reply")).await.expect("send");
        let wamid = sent.provider_message_id.expect("receipt id");

        let outcome = h
            .engine
            .handle_whatsapp_webhook(&wa_status_webhook("15550001111", &wamid, "delivered"))
            .await
            .expect("status");
        assert_eq!(outcome.statuses_applied, 1);

        let outcome = h
            .engine
            .handle_whatsapp_webhook(&wa_status_webhook("15550001111", "wamid.ghost", "read"))
            .await
            .expect("status");
        assert_eq!(outcome.statuses_applied, 0);

        let timeline = h
            .engine
            .list_messages("panel", &sent.thread_id)
            .await
            .expect("messages");
        assert_eq!(timeline.len(), 2, "status updates never insert");
        let outbound = timeline.iter().find(|m| m.id == sent.id).expect("outbound");
        assert_eq!(outbound.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn switch_channel_restores_remembered_then_falls_back_to_newest() {
        let h = harness().await;
        let wa = seed_whatsapp_channel(&h.pool).await;
        let email = seed_email_channel(&h.pool).await;

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "older thread",
            ))
            .await
            .expect("ingest");
        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550003333",
                "wamid.in2",
                "newer thread",
            ))
            .await
            .expect("ingest");

        let threads = h.engine.list_threads(&wa, None).await.expect("list");
        let older = threads
            .iter()
            .find(|t| t.counterpart == "+15550002222")
            .expect("older thread")
            .id
            .clone();

        // First visit: nothing remembered, newest thread wins.
        let selected =
            h.engine.switch_channel("panel", &wa).await.expect("switch").expect("selected");
        let newest = h.engine.list_threads(&wa, None).await.expect("list")[0].id.clone();
        assert_eq!(selected, newest);

        // Pick the older thread, leave, come back: the older one is restored.
        h.engine.set_viewing_thread("panel", &older, None).await.expect("open older");
        let away = h.engine.switch_channel("panel", &email).await.expect("switch away");
        assert_eq!(away, None, "empty channel selects nothing");
        let back = h.engine.switch_channel("panel", &wa).await.expect("switch back");
        assert_eq!(back, Some(older));
    }

    #[tokio::test]
    async fn delete_thread_enforces_channel_visibility_rules() {
        let h = harness().await;
        seed_whatsapp_channel(&h.pool).await;
        let channels = SqlChannelRepository::new(h.pool.clone());
        let mut private = channel_fixture("ch-private", ChannelType::WhatsApp, "15550009999");
        private.visibility = ChannelVisibility::Private;
        private.created_by = UserId("u-owner".to_string());
        channels.save(private).await.expect("seed private");

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.team",
                "team thread",
            ))
            .await
            .expect("ingest");
        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550009999",
                "15550004444",
                "wamid.private",
                "private thread",
            ))
            .await
            .expect("ingest");

        let team_thread = h
            .engine
            .list_threads(&ChannelId("ch-wa".to_string()), None)
            .await
            .expect("list")[0]
            .id
            .clone();
        let private_thread = h
            .engine
            .list_threads(&ChannelId("ch-private".to_string()), None)
            .await
            .expect("list")[0]
            .id
            .clone();

        let user = UserId("u-someone".to_string());
        let result = h.engine.delete_thread(&team_thread, &user, false).await;
        assert!(matches!(result, Err(EngineError::Comms(CommsError::Unauthorized { .. }))));

        h.engine.delete_thread(&team_thread, &user, true).await.expect("admin delete");

        let result = h.engine.delete_thread(&private_thread, &user, true).await;
        assert!(
            matches!(result, Err(EngineError::Comms(CommsError::Unauthorized { .. }))),
            "private channels ignore team admin"
        );
        h.engine
            .delete_thread(&private_thread, &UserId("u-owner".to_string()), false)
            .await
            .expect("creator delete");
    }

    #[tokio::test]
    async fn refresh_returns_messages_since_the_previous_poll() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "first",
            ))
            .await
            .expect("ingest");
        let thread_id = h.engine.list_threads(&channel, None).await.expect("list")[0].id.clone();
        h.engine.set_viewing_thread("panel", &thread_id, None).await.expect("open");

        let changes = h.engine.refresh("panel").await.expect("first poll");
        assert_eq!(changes.new_messages.len(), 1, "first poll returns the full timeline");
        assert_eq!(changes.window_state, Some(WindowState::Open));

        let changes = h.engine.refresh("panel").await.expect("idle poll");
        assert!(changes.new_messages.is_empty());

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in2",
                "second",
            ))
            .await
            .expect("ingest");
        let changes = h.engine.refresh("panel").await.expect("poll after inbound");
        assert_eq!(changes.new_messages.len(), 1);
        assert_eq!(changes.new_messages[0].body, "second");
    }

    #[tokio::test]
    async fn messages_are_filed_under_the_sub_thread_active_at_record_time() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;
        let operator = UserId("u-1".to_string());

        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in1",
                "before any sub-thread",
            ))
            .await
            .expect("ingest");
        let thread_id = h.engine.list_threads(&channel, None).await.expect("list")[0].id.clone();

        let first = h
            .engine
            .start_sub_thread(&thread_id, "renewal talk", &operator)
            .await
            .expect("first sub");
        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in2",
                "filed under renewal",
            ))
            .await
            .expect("ingest");

        let second = h
            .engine
            .start_sub_thread(&thread_id, "support episode", &operator)
            .await
            .expect("second sub");

        // Viewing the closed first sub-thread freezes the timeline to it.
        let mode = h
            .engine
            .set_viewing_thread("panel", &thread_id, Some(first.id.clone()))
            .await
            .expect("view history");
        assert_eq!(mode, ViewMode::History);

        let scoped = h.engine.list_messages("panel", &thread_id).await.expect("scoped");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].body, "filed under renewal");

        // New inbound files under the active (second) sub-thread even while
        // the first is being viewed, and a frozen view reports no changes.
        h.engine.refresh("panel").await.expect("baseline poll");
        h.engine
            .handle_whatsapp_webhook(&wa_message_webhook(
                "15550001111",
                "15550002222",
                "wamid.in3",
                "filed under support",
            ))
            .await
            .expect("ingest");
        let changes = h.engine.refresh("panel").await.expect("frozen poll");
        assert!(changes.new_messages.is_empty(), "history view suppresses live updates");

        let summaries = h.engine.list_sub_threads(&thread_id).await.expect("summaries");
        let counts: Vec<(String, i64)> = summaries
            .iter()
            .map(|s| (s.sub_thread.label.clone(), s.message_count))
            .collect();
        assert!(counts.contains(&("renewal talk".to_string(), 1)));
        assert!(counts.contains(&("support episode".to_string(), 1)));
        assert_eq!(summaries[0].sub_thread.id, second.id, "newest first");
    }

    #[tokio::test]
    async fn unroutable_inbound_email_is_dropped() {
        let h = harness().await;
        seed_email_channel(&h.pool).await;

        let payload = omnichat_providers::inbound::EmailInboundPayload {
            recipient: "nobody@acme.test".to_string(),
            sender: "dana@example.test".to_string(),
            subject: None,
            body: "hello?".to_string(),
            reply_token: None,
            provider_message_id: None,
        };
        let outcome = h.engine.handle_email_inbound(&payload).await.expect("ingest");
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn pending_context_is_tagged_after_thread_creation() {
        let h = harness().await;
        let channel = seed_whatsapp_channel(&h.pool).await;
        let templates = SqlTemplateRepository::new(h.pool.clone());
        templates
            .save(template_fixture(&channel, "welcome", "Hi {{1}}"))
            .await
            .expect("save template");

        let request = SendRequest {
            channel_id: channel.clone(),
            to: "+15550002222".to_string(),
            content: OutboundContent::Template {
                name: "welcome".to_string(),
                variables: vec!["Ana".to_string()],
            },
            context: Some(("deal".to_string(), 42)),
        };
        h.engine.send(request).await.expect("send");

        let tagged =
            h.engine.list_threads(&channel, Some(("deal", 42))).await.expect("filtered");
        assert_eq!(tagged.len(), 1);
        assert_eq!(
            tagged[0].context.as_ref().map(|c| (c.entity_type.as_str(), c.entity_id)),
            Some(("deal", 42))
        );
    }

    #[tokio::test]
    async fn compose_prefill_comes_from_the_record_layer() {
        let pool =
            omnichat_db::connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        omnichat_db::migrations::run_pending(&pool).await.expect("migrations");

        let directory = StaticContextDirectory::new().with_entry(
            "deal",
            42,
            ComposePrefill {
                recipients: vec!["dana@example.test".to_string()],
                subject: Some("Renewal Q3".to_string()),
            },
        );
        let engine = ConversationEngine::new(
            Arc::new(SqlChannelRepository::new(pool.clone())),
            Arc::new(SqlThreadRepository::new(pool.clone())),
            Arc::new(SqlMessageRepository::new(pool.clone())),
            Arc::new(SqlSubThreadRepository::new(pool.clone())),
            Arc::new(SqlTemplateRepository::new(pool.clone())),
            Arc::new(RecordingEmailTransport::new()),
            Arc::new(RecordingWhatsAppTransport::new()),
            Arc::new(directory),
        );

        let prefill =
            engine.compose_prefill("deal", 42).await.expect("lookup").expect("entry exists");
        assert_eq!(prefill.recipients, vec!["dana@example.test".to_string()]);
        assert_eq!(prefill.subject.as_deref(), Some("Renewal Q3"));

        let missing = engine.compose_prefill("ticket", 7).await.expect("lookup");
        assert!(missing.is_none());
    }
}
