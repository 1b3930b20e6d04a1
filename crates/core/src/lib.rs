pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod session;
pub mod template;
pub mod window;

pub use context::resolve_context_variants;
pub use domain::channel::{Channel, ChannelId, ChannelType, ChannelVisibility, TenantId, UserId};
pub use domain::message::{Message, MessageId, MessageStatus, MessageType};
pub use domain::subthread::{ConversationSubThread, ConversationThreadId, SubThreadSummary};
pub use domain::template::{MessageTemplate, TemplateId, TemplateStatus};
pub use domain::thread::{
    format_last_at, normalize_phone, ContextRef, Direction, Thread, ThreadId, ThreadSummary,
};
pub use errors::CommsError;
pub use session::{SessionState, ViewMode};
pub use window::{is_window_open, window_expires_at, window_state, WindowState};
