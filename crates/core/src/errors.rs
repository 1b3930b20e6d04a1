use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::channel::ChannelId;
use crate::domain::thread::ThreadId;

/// Failures the conversation engine surfaces to its caller. None of these are
/// retried inside the core; retry policy belongs to the transport layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommsError {
    #[error("channel `{0}` not found")]
    ChannelNotFound(ChannelId),
    #[error("thread `{0}` not found")]
    ThreadNotFound(ThreadId),
    #[error("messaging window is closed; free-form sends require a recent inbound message")]
    WindowClosed { expires_at: Option<DateTime<Utc>> },
    #[error("template variable {{{{{index}}}}} is missing or blank")]
    IncompleteVariables { index: u32 },
    #[error("template `{name}` is not approved for sending")]
    TemplateNotApproved { name: String },
    #[error("user `{user}` is not authorized to {action}")]
    Unauthorized { user: String, action: String },
    #[error("provider send failed: {0}")]
    ProviderSendFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
