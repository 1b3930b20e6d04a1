//! In-memory transport doubles. The recording variants capture what would
//! have gone over the wire and mint sequential provider ids; the failing
//! variants refuse every send so callers can assert nothing was persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use omnichat_core::domain::channel::Channel;
use omnichat_core::domain::template::MessageTemplate;

use crate::context_api::{ComposePrefill, ContextDirectory};
use crate::transport::{EmailTransport, ProviderSendReceipt, TransportError, WhatsAppTransport};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEmail {
    pub channel_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub reply_token: String,
}

#[derive(Default)]
pub struct RecordingEmailTransport {
    sent: Mutex<Vec<RecordedEmail>>,
    counter: AtomicU64,
}

impl RecordingEmailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<RecordedEmail> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send_email(
        &self,
        channel: &Channel,
        to: &str,
        subject: &str,
        body: &str,
        reply_token: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        self.sent.lock().expect("lock").push(RecordedEmail {
            channel_id: channel.id.0.clone(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            reply_token: reply_token.to_string(),
        });
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderSendReceipt { provider_message_id: Some(format!("email.{n}")) })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedWhatsAppSend {
    Text { channel_id: String, to: String, body: String },
    Template { channel_id: String, to: String, name: String, variables: Vec<String> },
}

#[derive(Default)]
pub struct RecordingWhatsAppTransport {
    sent: Mutex<Vec<RecordedWhatsAppSend>>,
    counter: AtomicU64,
}

impl RecordingWhatsAppTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<RecordedWhatsAppSend> {
        self.sent.lock().expect("lock").clone()
    }

    fn receipt(&self) -> ProviderSendReceipt {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        ProviderSendReceipt { provider_message_id: Some(format!("wamid.{n}")) }
    }
}

#[async_trait]
impl WhatsAppTransport for RecordingWhatsAppTransport {
    async fn send_text(
        &self,
        channel: &Channel,
        to: &str,
        body: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        self.sent.lock().expect("lock").push(RecordedWhatsAppSend::Text {
            channel_id: channel.id.0.clone(),
            to: to.to_string(),
            body: body.to_string(),
        });
        Ok(self.receipt())
    }

    async fn send_template(
        &self,
        channel: &Channel,
        to: &str,
        template: &MessageTemplate,
        variables: &[String],
    ) -> Result<ProviderSendReceipt, TransportError> {
        self.sent.lock().expect("lock").push(RecordedWhatsAppSend::Template {
            channel_id: channel.id.0.clone(),
            to: to.to_string(),
            name: template.name.clone(),
            variables: variables.to_vec(),
        });
        Ok(self.receipt())
    }
}

pub struct FailingEmailTransport;

#[async_trait]
impl EmailTransport for FailingEmailTransport {
    async fn send_email(
        &self,
        _channel: &Channel,
        _to: &str,
        _subject: &str,
        _body: &str,
        _reply_token: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::Rejected { status: 502, body: "relay unavailable".to_string() })
    }
}

/// Directory double answering from a fixed table.
#[derive(Default)]
pub struct StaticContextDirectory {
    entries: HashMap<(String, i64), ComposePrefill>,
}

impl StaticContextDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        entity_type: &str,
        entity_id: i64,
        prefill: ComposePrefill,
    ) -> Self {
        self.entries.insert((entity_type.to_string(), entity_id), prefill);
        self
    }
}

#[async_trait]
impl ContextDirectory for StaticContextDirectory {
    async fn compose_prefill(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Option<ComposePrefill>, TransportError> {
        Ok(self.entries.get(&(entity_type.to_string(), entity_id)).cloned())
    }
}

pub struct FailingWhatsAppTransport;

#[async_trait]
impl WhatsAppTransport for FailingWhatsAppTransport {
    async fn send_text(
        &self,
        _channel: &Channel,
        _to: &str,
        _body: &str,
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::Rejected { status: 500, body: "provider outage".to_string() })
    }

    async fn send_template(
        &self,
        _channel: &Channel,
        _to: &str,
        _template: &MessageTemplate,
        _variables: &[String],
    ) -> Result<ProviderSendReceipt, TransportError> {
        Err(TransportError::Rejected { status: 500, body: "provider outage".to_string() })
    }
}
