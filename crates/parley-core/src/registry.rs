//! Connection registry: thread-safe bookkeeping of live duplex connections.
//!
//! The registry is the single source of truth for "is this connection
//! alive". No other component holds long-lived references to a connection's
//! transport handle — all sends go through [`ConnectionRegistry::send_to`],
//! so disconnect/cleanup cannot race with an in-flight send.
//!
//! Internals are two [`DashMap`]s (by connection id, and user id to
//! connection id set). Shard guards are always dropped before awaiting a
//! send; register/unregister races under normal churn are expected and
//! resolve to no-ops or logged replacements, never panics.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::error::RegistryError;

/// Object-safe transport handle for one duplex connection.
///
/// Returns a boxed future (not RPITIT) because the registry stores
/// heterogeneous sinks behind `Arc<dyn ConnectionSink>`.
pub trait ConnectionSink: Send + Sync {
    /// Deliver a payload to the remote peer.
    fn send(
        &self,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>>;
}

/// A live connection: identity, owner, and its transport handle.
#[derive(Clone)]
pub struct Connection {
    /// Unique for the lifetime of the process, generated fresh per connection.
    pub id: Uuid,
    pub user_id: Uuid,
    pub sink: Arc<dyn ConnectionSink>,
}

impl Connection {
    pub fn new(user_id: Uuid, sink: Arc<dyn ConnectionSink>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            sink,
        }
    }
}

/// Registry of live connections, keyed by connection id and by owning user.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Connection>,
    user_connections: DashMap<Uuid, HashSet<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its identity and its owner's connection set.
    ///
    /// Idempotent on identity collision: the new connection replaces the
    /// old one and the anomaly is logged, since ids are supposed to be
    /// unique per process lifetime.
    pub fn register(&self, connection: Connection) {
        let id = connection.id;
        let user_id = connection.user_id;

        if let Some(previous) = self.connections.insert(id, connection) {
            warn!(connection_id = %id, "Replaced connection with colliding id");
            if previous.user_id != user_id {
                if let Some(mut set) = self.user_connections.get_mut(&previous.user_id) {
                    set.remove(&id);
                }
            }
        }

        self.user_connections.entry(user_id).or_default().insert(id);
        info!(connection_id = %id, user_id = %user_id, "Connection registered");
    }

    /// Remove a connection from both maps.
    ///
    /// Removing an already-absent identity is a no-op: disconnect races
    /// (peer close vs. failed send) are expected.
    pub fn unregister(&self, connection_id: &Uuid) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };

        if let Some(mut set) = self.user_connections.get_mut(&connection.user_id) {
            set.remove(connection_id);
            let empty = set.is_empty();
            drop(set);
            if empty {
                self.user_connections
                    .remove_if(&connection.user_id, |_, set| set.is_empty());
            }
        }

        info!(
            connection_id = %connection_id,
            user_id = %connection.user_id,
            "Connection unregistered"
        );
    }

    /// Attempt delivery to one connection.
    ///
    /// On any transport-level failure the connection is unregistered before
    /// the error is returned — callers must not assume it is still live
    /// after a failed send. An unknown identity fails cleanly with
    /// [`RegistryError::ConnectionNotFound`].
    pub async fn send_to(&self, connection_id: &Uuid, payload: &str) -> Result<(), RegistryError> {
        // Clone the sink out so no shard guard is held across the await.
        let sink = match self.connections.get(connection_id) {
            Some(connection) => Arc::clone(&connection.sink),
            None => return Err(RegistryError::ConnectionNotFound),
        };

        match sink.send(payload.to_string()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "Send failed, dropping connection");
                self.unregister(connection_id);
                Err(err)
            }
        }
    }

    /// Deliver a payload to every connection registered for a user.
    ///
    /// Best effort: each individual failure unregisters that connection
    /// only; the call never errors on partial failure.
    pub async fn broadcast_to_user(&self, user_id: &Uuid, payload: &str) {
        let ids: Vec<Uuid> = self
            .user_connections
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for id in ids {
            if let Err(err) = self.send_to(&id, payload).await {
                debug!(connection_id = %id, user_id = %user_id, error = %err, "Broadcast delivery failed");
            }
        }
    }

    /// Total number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live connections for one user.
    pub fn user_connection_count(&self, user_id: &Uuid) -> usize {
        self.user_connections
            .get(user_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.user_connections.len()
    }
}
