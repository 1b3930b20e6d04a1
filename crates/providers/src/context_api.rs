//! Record-layer lookup used to pre-fill a new outbound compose. The record
//! layer owns deals, tickets and contacts; given one entity reference it
//! answers with the recipients to address and a human subject line. The
//! integration is optional: a deployment without a record layer wires the
//! noop directory and compose starts blank.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transport::TransportError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposePrefill {
    #[serde(default)]
    pub recipients: Vec<String>,
    pub subject: Option<String>,
}

#[async_trait]
pub trait ContextDirectory: Send + Sync {
    /// Returns compose pre-fill data for one business entity, or `None` when
    /// the record layer has nothing for it.
    async fn compose_prefill(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Option<ComposePrefill>, TransportError>;
}

pub struct HttpContextDirectory {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpContextDirectory {
    pub fn new(base_url: String, api_key: SecretString) -> Self {
        Self { client: Client::new(), base_url, api_key }
    }
}

#[async_trait]
impl ContextDirectory for HttpContextDirectory {
    async fn compose_prefill(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Option<ComposePrefill>, TransportError> {
        let url = format!(
            "{}/contexts/{entity_type}/{entity_id}/compose",
            self.base_url.trim_end_matches('/'),
        );

        let response =
            self.client.get(&url).bearer_auth(self.api_key.expose_secret()).send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            debug!(
                event_name = "context_prefill_missing",
                entity_type,
                entity_id,
                "record layer has no compose data for this entity"
            );
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                event_name = "context_prefill_rejected",
                entity_type,
                entity_id,
                status = status.as_u16(),
                "record layer rejected the compose lookup"
            );
            return Err(TransportError::Rejected { status: status.as_u16(), body });
        }

        let prefill: ComposePrefill = response.json().await?;
        Ok(Some(prefill))
    }
}

/// Wired in when no record layer is configured.
pub struct NoopContextDirectory;

#[async_trait]
impl ContextDirectory for NoopContextDirectory {
    async fn compose_prefill(
        &self,
        _entity_type: &str,
        _entity_id: i64,
    ) -> Result<Option<ComposePrefill>, TransportError> {
        Ok(None)
    }
}
