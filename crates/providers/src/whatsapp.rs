//! WhatsApp Cloud API client. Outbound sends go to
//! `POST {base}/{sender_identifier}/messages` with a bearer token; the
//! response carries the `wamid` used to correlate later status webhooks.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use omnichat_core::domain::channel::Channel;
use omnichat_core::domain::template::MessageTemplate;

use crate::transport::{ProviderSendReceipt, TransportError, WhatsAppTransport};

pub struct HttpWhatsAppTransport {
    client: Client,
    base_url: String,
    access_token: SecretString,
}

impl HttpWhatsAppTransport {
    pub fn new(base_url: String, access_token: SecretString) -> Self {
        Self { client: Client::new(), base_url, access_token }
    }

    async fn post_message(
        &self,
        channel: &Channel,
        payload: Value,
    ) -> Result<ProviderSendReceipt, TransportError> {
        let url =
            format!("{}/{}/messages", self.base_url.trim_end_matches('/'), channel.sender_identifier);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "whatsapp_send_rejected",
                channel_id = %channel.id,
                status = status.as_u16(),
                "whatsapp cloud api rejected the send"
            );
            return Err(TransportError::Rejected { status: status.as_u16(), body });
        }

        let body: Value = response.json().await?;
        let provider_message_id = body
            .get("messages")
            .and_then(|messages| messages.get(0))
            .and_then(|message| message.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if provider_message_id.is_none() {
            return Err(TransportError::UnexpectedResponse(
                "send accepted but response carried no message id".to_string(),
            ));
        }

        debug!(
            event_name = "whatsapp_send_accepted",
            channel_id = %channel.id,
            "whatsapp cloud api accepted the send"
        );
        Ok(ProviderSendReceipt { provider_message_id })
    }
}

#[async_trait]
impl WhatsAppTransport for HttpWhatsAppTransport {
    async fn send_text(
        &self,
        channel: &Channel,
        to: &str,
        body: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "body": body },
        });
        self.post_message(channel, payload).await
    }

    async fn send_template(
        &self,
        channel: &Channel,
        to: &str,
        template: &MessageTemplate,
        variables: &[String],
    ) -> Result<ProviderSendReceipt, TransportError> {
        let parameters: Vec<Value> = variables
            .iter()
            .map(|value| json!({ "type": "text", "text": value }))
            .collect();

        let mut template_payload = json!({
            "name": template.name,
            "language": { "code": template.language },
        });
        if !parameters.is_empty() {
            template_payload["components"] =
                json!([{ "type": "body", "parameters": parameters }]);
        }

        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": template_payload,
        });
        self.post_message(channel, payload).await
    }
}
