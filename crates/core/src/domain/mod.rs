pub mod channel;
pub mod message;
pub mod subthread;
pub mod template;
pub mod thread;
