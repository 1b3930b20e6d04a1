//! Seed builders shared by repository and engine tests.

use chrono::Utc;

use omnichat_core::domain::channel::{
    Channel, ChannelId, ChannelType, ChannelVisibility, TenantId, UserId,
};
use omnichat_core::domain::message::{Message, MessageId, MessageStatus, MessageType};
use omnichat_core::domain::template::{MessageTemplate, TemplateId, TemplateStatus};
use omnichat_core::domain::thread::{Direction, ThreadId};

/// Active team-visible channel under tenant `t-1`. Callers override fields
/// when a test needs a private or disabled channel.
pub fn channel_fixture(id: &str, channel_type: ChannelType, sender_identifier: &str) -> Channel {
    let now = Utc::now();
    let provider = match channel_type {
        ChannelType::Email => "smtp_relay",
        ChannelType::WhatsApp => "whatsapp_cloud",
    };
    Channel {
        id: ChannelId(id.to_string()),
        tenant_id: TenantId("t-1".to_string()),
        channel_type,
        provider: provider.to_string(),
        sender_identifier: sender_identifier.to_string(),
        visibility: ChannelVisibility::Team,
        is_active: true,
        created_by: UserId("u-creator".to_string()),
        created_at: now,
        updated_at: now,
    }
}

/// Plain text message with no provider correlation and no sub-thread filing.
pub fn message_fixture(thread_id: &ThreadId, direction: Direction, body: &str) -> Message {
    Message {
        id: MessageId::generate(),
        thread_id: thread_id.clone(),
        conversation_thread_id: None,
        direction,
        body: body.to_string(),
        message_type: MessageType::Text,
        status: MessageStatus::Received,
        provider_message_id: None,
        sent_at: None,
        created_at: Utc::now(),
    }
}

/// Approved English utility template.
pub fn template_fixture(channel_id: &ChannelId, name: &str, body: &str) -> MessageTemplate {
    MessageTemplate {
        id: TemplateId::generate(),
        channel_id: channel_id.clone(),
        name: name.to_string(),
        language: "en".to_string(),
        category: "utility".to_string(),
        body: body.to_string(),
        status: TemplateStatus::Approved,
        created_at: Utc::now(),
    }
}
