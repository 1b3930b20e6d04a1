pub mod context_api;
pub mod email;
pub mod inbound;
pub mod recording;
pub mod transport;
pub mod whatsapp;

pub use context_api::{ComposePrefill, ContextDirectory, HttpContextDirectory, NoopContextDirectory};
pub use email::HttpEmailTransport;
pub use inbound::{EmailInboundPayload, WhatsAppWebhookPayload};
pub use transport::{
    EmailTransport, NoopEmailTransport, NoopWhatsAppTransport, ProviderSendReceipt,
    TransportError, WhatsAppTransport,
};
pub use whatsapp::HttpWhatsAppTransport;
