pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{
    ChannelRepository, ContextFilter, MessageRepository, RepositoryError, SqlChannelRepository,
    SqlMessageRepository, SqlSubThreadRepository, SqlTemplateRepository, SqlThreadRepository,
    SubThreadRepository, TemplateRepository, ThreadRepository,
};
