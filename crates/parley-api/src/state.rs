//! Application state wiring the gateway together.
//!
//! The coordinator is generic over store and agent traits; AppState pins it
//! to the concrete infra implementations and shares one instance across all
//! transports so the per-conversation turn guard is process-wide.

use std::sync::Arc;

use parley_core::registry::ConnectionRegistry;
use parley_core::turn::TurnCoordinator;
use parley_infra::agent::openai::{OpenAiAgent, OpenAiAgentConfig};
use parley_infra::config::GatewayConfig;
use parley_infra::sqlite::conversation::SqliteConversationStore;
use parley_infra::sqlite::pool::DatabasePool;
use secrecy::SecretString;

/// The coordinator pinned to SQLite persistence and the OpenAI-compatible
/// agent backend.
pub type ConcreteCoordinator = TurnCoordinator<SqliteConversationStore, OpenAiAgent>;

/// Shared application state for REST and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: ConcreteCoordinator,
    pub store: Arc<SqliteConversationStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Initialize the application state: connect to the database, wire the
    /// coordinator, start an empty connection registry.
    pub async fn init(config: GatewayConfig) -> anyhow::Result<Self> {
        let db_pool = DatabasePool::new(&config.database_url()).await?;

        let store = Arc::new(SqliteConversationStore::new(db_pool));
        let agent = Arc::new(OpenAiAgent::new(OpenAiAgentConfig {
            provider_name: config.agent.provider_name.clone(),
            base_url: config.agent.base_url.clone(),
            api_key: SecretString::from(config.agent.api_key.as_str()),
            default_model: config.agent.default_model.clone(),
        }));

        let coordinator = TurnCoordinator::new(Arc::clone(&store), agent);

        Ok(Self {
            coordinator,
            store,
            registry: Arc::new(ConnectionRegistry::new()),
            config: Arc::new(config),
        })
    }
}
