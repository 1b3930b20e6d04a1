//! Email relay client. The relay accepts `POST {base}/messages` with the
//! sender, recipient, rendered body and the thread's reply token, and answers
//! with the relay-side message id.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use omnichat_core::domain::channel::Channel;

use crate::transport::{EmailTransport, ProviderSendReceipt, TransportError};

pub struct HttpEmailTransport {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpEmailTransport {
    pub fn new(base_url: String, api_key: SecretString) -> Self {
        Self { client: Client::new(), base_url, api_key }
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send_email(
        &self,
        channel: &Channel,
        to: &str,
        subject: &str,
        body: &str,
        reply_token: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "from": channel.sender_identifier,
            "to": to,
            "subject": subject,
            "body": body,
            "reply_token": reply_token,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "email_send_rejected",
                channel_id = %channel.id,
                status = status.as_u16(),
                "email relay rejected the send"
            );
            return Err(TransportError::Rejected { status: status.as_u16(), body });
        }

        let body: Value = response.json().await?;
        let provider_message_id =
            body.get("id").and_then(Value::as_str).map(str::to_string);

        debug!(
            event_name = "email_send_accepted",
            channel_id = %channel.id,
            "email relay accepted the send"
        );
        Ok(ProviderSendReceipt { provider_message_id })
    }
}
