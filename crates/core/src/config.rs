use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub email: EmailProviderConfig,
    pub whatsapp: WhatsAppProviderConfig,
    pub crm: CrmConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
    pub webhook_secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EmailProviderConfig {
    pub enabled: bool,
    pub api_base_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct WhatsAppProviderConfig {
    pub enabled: bool,
    pub api_base_url: String,
    pub access_token: Option<SecretString>,
    pub verify_token: Option<String>,
}

/// Connection to the record layer that owns deals, tickets and contacts.
/// Optional; when absent, compose prefill lookups simply return nothing.
#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    pub api_base_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub webhook_secret: Option<String>,
    pub email_enabled: Option<bool>,
    pub email_api_base_url: Option<String>,
    pub email_api_key: Option<String>,
    pub whatsapp_enabled: Option<bool>,
    pub whatsapp_api_base_url: Option<String>,
    pub whatsapp_access_token: Option<String>,
    pub whatsapp_verify_token: Option<String>,
    pub crm_enabled: Option<bool>,
    pub crm_api_base_url: Option<String>,
    pub crm_api_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://omnichat.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8090,
                health_check_port: 8091,
                graceful_shutdown_secs: 15,
                webhook_secret: None,
            },
            email: EmailProviderConfig { enabled: false, api_base_url: None, api_key: None },
            whatsapp: WhatsAppProviderConfig {
                enabled: false,
                api_base_url: "https://graph.facebook.com/v19.0".to_string(),
                access_token: None,
                verify_token: None,
            },
            crm: CrmConfig { enabled: false, api_base_url: None, api_key: None },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("omnichat.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(webhook_secret) = server.webhook_secret {
                self.server.webhook_secret = Some(webhook_secret);
            }
        }

        if let Some(email) = patch.email {
            if let Some(enabled) = email.enabled {
                self.email.enabled = enabled;
            }
            if let Some(api_base_url) = email.api_base_url {
                self.email.api_base_url = Some(api_base_url);
            }
            if let Some(email_api_key_value) = email.api_key {
                self.email.api_key = Some(secret_value(email_api_key_value));
            }
        }

        if let Some(whatsapp) = patch.whatsapp {
            if let Some(enabled) = whatsapp.enabled {
                self.whatsapp.enabled = enabled;
            }
            if let Some(api_base_url) = whatsapp.api_base_url {
                self.whatsapp.api_base_url = api_base_url;
            }
            if let Some(whatsapp_access_token_value) = whatsapp.access_token {
                self.whatsapp.access_token = Some(secret_value(whatsapp_access_token_value));
            }
            if let Some(verify_token) = whatsapp.verify_token {
                self.whatsapp.verify_token = Some(verify_token);
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(enabled) = crm.enabled {
                self.crm.enabled = enabled;
            }
            if let Some(api_base_url) = crm.api_base_url {
                self.crm.api_base_url = Some(api_base_url);
            }
            if let Some(crm_api_key_value) = crm.api_key {
                self.crm.api_key = Some(secret_value(crm_api_key_value));
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("OMNICHAT_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("OMNICHAT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("OMNICHAT_LOG_FORMAT") {
            self.logging.format = format.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "OMNICHAT_LOG_FORMAT".to_string(),
                value: format,
            })?;
        }
        if let Ok(port) = env::var("OMNICHAT_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "OMNICHAT_PORT".to_string(),
                value: port,
            })?;
        }
        if let Ok(secret) = env::var("OMNICHAT_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Ok(api_key) = env::var("OMNICHAT_EMAIL_API_KEY") {
            self.email.api_key = Some(secret_value(api_key));
        }
        if let Ok(token) = env::var("OMNICHAT_WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = Some(secret_value(token));
        }
        if let Ok(token) = env::var("OMNICHAT_WHATSAPP_VERIFY_TOKEN") {
            self.whatsapp.verify_token = Some(token);
        }
        if let Ok(api_key) = env::var("OMNICHAT_CRM_API_KEY") {
            self.crm.api_key = Some(secret_value(api_key));
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.server.webhook_secret = Some(webhook_secret);
        }
        if let Some(enabled) = overrides.email_enabled {
            self.email.enabled = enabled;
        }
        if let Some(api_base_url) = overrides.email_api_base_url {
            self.email.api_base_url = Some(api_base_url);
        }
        if let Some(api_key) = overrides.email_api_key {
            self.email.api_key = Some(secret_value(api_key));
        }
        if let Some(enabled) = overrides.whatsapp_enabled {
            self.whatsapp.enabled = enabled;
        }
        if let Some(api_base_url) = overrides.whatsapp_api_base_url {
            self.whatsapp.api_base_url = api_base_url;
        }
        if let Some(token) = overrides.whatsapp_access_token {
            self.whatsapp.access_token = Some(secret_value(token));
        }
        if let Some(token) = overrides.whatsapp_verify_token {
            self.whatsapp.verify_token = Some(token);
        }
        if let Some(enabled) = overrides.crm_enabled {
            self.crm.enabled = enabled;
        }
        if let Some(api_base_url) = overrides.crm_api_base_url {
            self.crm.api_base_url = Some(api_base_url);
        }
        if let Some(api_key) = overrides.crm_api_key {
            self.crm.api_key = Some(secret_value(api_key));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.server.port == self.server.health_check_port {
            return Err(ConfigError::Validation(
                "server.port and server.health_check_port must differ".to_string(),
            ));
        }

        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level `{}` is not one of trace|debug|info|warn|error",
                self.logging.level
            )));
        }

        if self.email.enabled {
            if self.email.api_base_url.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(ConfigError::Validation(
                    "email.api_base_url is required when email is enabled".to_string(),
                ));
            }
            let key_missing = self
                .email
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if key_missing {
                return Err(ConfigError::Validation(
                    "email.api_key is required when email is enabled".to_string(),
                ));
            }
        }

        if self.whatsapp.enabled {
            let token_missing = self
                .whatsapp
                .access_token
                .as_ref()
                .map(|token| token.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if token_missing {
                return Err(ConfigError::Validation(
                    "whatsapp.access_token is required when whatsapp is enabled".to_string(),
                ));
            }
            if self.whatsapp.verify_token.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(ConfigError::Validation(
                    "whatsapp.verify_token is required when whatsapp is enabled".to_string(),
                ));
            }
        }

        if self.crm.enabled {
            if self.crm.api_base_url.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(ConfigError::Validation(
                    "crm.api_base_url is required when crm is enabled".to_string(),
                ));
            }
            let key_missing = self
                .crm
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if key_missing {
                return Err(ConfigError::Validation(
                    "crm.api_key is required when crm is enabled".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    if let Ok(env_path) = env::var("OMNICHAT_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Some(path);
        }
    }
    let default = PathBuf::from("omnichat.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let interpolated = interpolate(&raw)?;
    toml::from_str(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Replaces `${VAR}` expressions with the named environment variable. A
/// missing variable is an error rather than an empty string so secrets are
/// never silently blank.
fn interpolate(raw: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let end = rest.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let var = &rest[..end];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        output.push_str(&value);
        rest = &rest[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    email: Option<EmailPatch>,
    whatsapp: Option<WhatsAppPatch>,
    crm: Option<CrmPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    webhook_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmailPatch {
    enabled: Option<bool>,
    api_base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WhatsAppPatch {
    enabled: Option<bool>,
    api_base_url: Option<String>,
    access_token: Option<String>,
    verify_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    api_base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
