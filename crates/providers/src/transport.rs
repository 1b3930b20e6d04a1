use async_trait::async_trait;
use thiserror::Error;

use omnichat_core::domain::channel::Channel;
use omnichat_core::domain::template::MessageTemplate;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not configured for this deployment")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider rejected the send: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Provider acknowledgement of an accepted send. The provider message id is
/// the correlation key for later delivery-status webhooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSendReceipt {
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Relays one outbound email from the channel's sender address. The reply
    /// token travels in the relay payload so replies thread back correctly.
    async fn send_email(
        &self,
        channel: &Channel,
        to: &str,
        subject: &str,
        body: &str,
        reply_token: &str,
    ) -> Result<ProviderSendReceipt, TransportError>;
}

#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    async fn send_text(
        &self,
        channel: &Channel,
        to: &str,
        body: &str,
    ) -> Result<ProviderSendReceipt, TransportError>;

    async fn send_template(
        &self,
        channel: &Channel,
        to: &str,
        template: &MessageTemplate,
        variables: &[String],
    ) -> Result<ProviderSendReceipt, TransportError>;
}

/// Placeholder wired in when the email provider is disabled in config.
pub struct NoopEmailTransport;

#[async_trait]
impl EmailTransport for NoopEmailTransport {
    async fn send_email(
        &self,
        _channel: &Channel,
        _to: &str,
        _subject: &str,
        _body: &str,
        _reply_token: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::NotConfigured)
    }
}

/// Placeholder wired in when the WhatsApp provider is disabled in config.
pub struct NoopWhatsAppTransport;

#[async_trait]
impl WhatsAppTransport for NoopWhatsAppTransport {
    async fn send_text(
        &self,
        _channel: &Channel,
        _to: &str,
        _body: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::NotConfigured)
    }

    async fn send_template(
        &self,
        _channel: &Channel,
        _to: &str,
        _template: &MessageTemplate,
        _variables: &[String],
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::NotConfigured)
    }
}
