pub mod runtime;
pub mod sessions;

pub use runtime::{
    ChangedSet, ConversationEngine, EngineError, OutboundContent, SendRequest, WebhookOutcome,
};
pub use sessions::SessionRegistry;
