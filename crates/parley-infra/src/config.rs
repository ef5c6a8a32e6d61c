//! Gateway configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.parley/` in production)
//! and deserializes it into [`GatewayConfig`]. Falls back to sensible
//! defaults when the file is missing or malformed, then applies `PARLEY_*`
//! environment overrides.

use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

use crate::sqlite::pool::default_database_url;

/// Top-level gateway configuration.
///
/// No Debug derive: the agent section carries an API key.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// SQLite database URL; `None` resolves via [`default_database_url`].
    pub database_url: Option<String>,
    /// Bridge tracing spans to OpenTelemetry.
    pub enable_otel: bool,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            database_url: None,
            enable_otel: false,
            agent: AgentConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Agent backend section.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider_name: String,
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider_name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            default_model: "gpt-4o".to_string(),
        }
    }
}

/// Static token table for transport auth.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

/// One accepted bearer token, mapped to a tenant.
#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: Uuid,
    pub org_id: Uuid,
}

impl GatewayConfig {
    /// Resolve the database URL, falling back to the data-dir default.
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(default_database_url)
    }

    /// Look up the tenant a presented token maps to.
    pub fn lookup_token(&self, token: &str) -> Option<(Uuid, Uuid)> {
        self.auth
            .tokens
            .iter()
            .find(|entry| entry.token == token)
            .map(|entry| (entry.user_id, entry.org_id))
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("PARLEY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("PARLEY_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(key) = std::env::var("PARLEY_AGENT_API_KEY") {
            self.agent.api_key = key;
        }
        self
    }
}

/// Load gateway configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GatewayConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the
///   default.
/// - Environment overrides are applied in every case.
pub async fn load_config(data_dir: &Path) -> GatewayConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GatewayConfig::default().apply_env_overrides();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GatewayConfig::default().apply_env_overrides();
        }
    };

    let config = match toml::from_str::<GatewayConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GatewayConfig::default()
        }
    };

    config.apply_env_overrides()
}
