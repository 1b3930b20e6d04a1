//! Wire shapes for inbound webhook payloads. Email arrives pre-parsed from
//! the relay; WhatsApp arrives in the Cloud API's entry/changes/value nesting
//! where one request can carry both new messages and delivery-status updates.

use serde::Deserialize;

/// One inbound email as delivered by the relay webhook. `recipient` is the
/// channel's sender identifier; `reply_token` correlates replies to an
/// existing thread when present.
#[derive(Clone, Debug, Deserialize)]
pub struct EmailInboundPayload {
    pub recipient: String,
    pub sender: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WhatsAppWebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookChange {
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChangeValue {
    pub metadata: ValueMetadata,
    #[serde(default)]
    pub messages: Vec<InboundWhatsAppMessage>,
    #[serde(default)]
    pub statuses: Vec<StatusUpdate>,
}

/// The business number the event belongs to. `display_phone_number` matches a
/// channel's sender identifier.
#[derive(Clone, Debug, Deserialize)]
pub struct ValueMetadata {
    pub display_phone_number: String,
    pub phone_number_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InboundWhatsAppMessage {
    pub from: String,
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextBody>,
}

impl InboundWhatsAppMessage {
    /// Display body for the unified timeline. Non-text payloads fall back to
    /// a kind marker since media fetching is out of scope here.
    pub fn display_body(&self) -> String {
        match &self.text {
            Some(text) => text.body.clone(),
            None => format!("[{}]", self.kind),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: String,
    pub timestamp: String,
    pub recipient_id: String,
}
