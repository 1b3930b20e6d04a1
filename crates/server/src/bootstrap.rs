use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;
use tracing::{info, warn};

use omnichat_core::config::{AppConfig, ConfigError, LoadOptions};
use omnichat_db::repositories::{
    SqlChannelRepository, SqlMessageRepository, SqlSubThreadRepository, SqlTemplateRepository,
    SqlThreadRepository,
};
use omnichat_db::{connect, migrations, DbPool};
use omnichat_engine::ConversationEngine;
use omnichat_providers::context_api::ContextDirectory;
use omnichat_providers::transport::{EmailTransport, WhatsAppTransport};
use omnichat_providers::{
    HttpContextDirectory, HttpEmailTransport, HttpWhatsAppTransport, NoopContextDirectory,
    NoopEmailTransport, NoopWhatsAppTransport,
};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ConversationEngine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "bootstrap_start", "starting application bootstrap");

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "bootstrap_database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "bootstrap_migrations_applied", "database migrations applied");

    let email = email_transport(&config);
    let whatsapp = whatsapp_transport(&config);
    let context_directory = context_directory(&config);

    let engine = Arc::new(ConversationEngine::new(
        Arc::new(SqlChannelRepository::new(db_pool.clone())),
        Arc::new(SqlThreadRepository::new(db_pool.clone())),
        Arc::new(SqlMessageRepository::new(db_pool.clone())),
        Arc::new(SqlSubThreadRepository::new(db_pool.clone())),
        Arc::new(SqlTemplateRepository::new(db_pool.clone())),
        email,
        whatsapp,
        context_directory,
    ));

    Ok(Application { config, db_pool, engine })
}

/// Disabled or credential-less providers boot as noop transports. The
/// downgrade is logged once here; runtime sends through a noop fail loudly.
fn email_transport(config: &AppConfig) -> Arc<dyn EmailTransport> {
    match (config.email.enabled, &config.email.api_base_url, &config.email.api_key) {
        (true, Some(api_base_url), Some(api_key)) => {
            Arc::new(HttpEmailTransport::new(api_base_url.clone(), clone_secret(api_key)))
        }
        (true, _, _) => {
            warn!(
                event_name = "transport_downgraded",
                transport = "email",
                "email provider enabled without relay credentials; using noop transport"
            );
            Arc::new(NoopEmailTransport)
        }
        (false, _, _) => Arc::new(NoopEmailTransport),
    }
}

fn whatsapp_transport(config: &AppConfig) -> Arc<dyn WhatsAppTransport> {
    match (config.whatsapp.enabled, &config.whatsapp.access_token) {
        (true, Some(token)) => Arc::new(HttpWhatsAppTransport::new(
            config.whatsapp.api_base_url.clone(),
            clone_secret(token),
        )),
        (true, None) => {
            warn!(
                event_name = "transport_downgraded",
                transport = "whatsapp",
                "whatsapp provider enabled without an access token; using noop transport"
            );
            Arc::new(NoopWhatsAppTransport)
        }
        (false, _) => Arc::new(NoopWhatsAppTransport),
    }
}

fn context_directory(config: &AppConfig) -> Arc<dyn ContextDirectory> {
    match (config.crm.enabled, &config.crm.api_base_url, &config.crm.api_key) {
        (true, Some(api_base_url), Some(api_key)) => {
            Arc::new(HttpContextDirectory::new(api_base_url.clone(), clone_secret(api_key)))
        }
        (true, _, _) => {
            warn!(
                event_name = "transport_downgraded",
                transport = "crm",
                "record layer enabled without credentials; compose prefill disabled"
            );
            Arc::new(NoopContextDirectory)
        }
        (false, _, _) => Arc::new(NoopContextDirectory),
    }
}

fn clone_secret(secret: &SecretString) -> SecretString {
    use secrecy::ExposeSecret;
    SecretString::from(secret.expose_secret().to_string())
}
