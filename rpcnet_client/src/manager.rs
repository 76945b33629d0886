//! Connection manager + zone router (C5, live half): owns the
//! `server_id -> ClientConnection` map and the `zone_id -> server_id` map,
//! and hands read-only snapshots to [`rpcnet_core::router`] strategies so
//! routing decisions never block on the same lock a new connection takes.

use std::collections::HashMap;
use std::sync::Arc;

use rpcnet_core::config::RpcConfig;
use rpcnet_core::error::RpcError;
use rpcnet_core::message::{Health, ServerDescriptor};
use rpcnet_core::router::{CompositeRouter, RouteRequest};
use rpcnet_core::transport::Transport;
use tokio::sync::RwLock;

use crate::connection::ClientConnection;

struct ManagerState {
    connections: HashMap<String, Arc<ClientConnection>>,
    descriptors: HashMap<String, ServerDescriptor>,
    zone_to_server: HashMap<String, String>,
}

/// Tracks every server a client currently holds a connection to, and
/// answers "which server should this call go to" using the shared
/// [`CompositeRouter`] chain.
pub struct ConnectionManager {
    state: RwLock<ManagerState>,
    router: CompositeRouter,
    config: RpcConfig,
}

impl ConnectionManager {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                connections: HashMap::new(),
                descriptors: HashMap::new(),
                zone_to_server: HashMap::new(),
            }),
            router: CompositeRouter::default_chain(),
            config,
        }
    }

    /// Registers a freshly established connection under `server_id`,
    /// merging in any zone routes it advertised at handshake time.
    pub async fn register(
        &self,
        server_id: impl Into<String>,
        descriptor: ServerDescriptor,
        connection: Arc<ClientConnection>,
        zone_routes: HashMap<String, String>,
    ) {
        let server_id = server_id.into();
        let mut state = self.state.write().await;
        state.connections.insert(server_id.clone(), connection);
        state.descriptors.insert(server_id, descriptor);
        state.zone_to_server.extend(zone_routes);
    }

    pub async fn remove(&self, server_id: &str) {
        let mut state = self.state.write().await;
        state.connections.remove(server_id);
        state.descriptors.remove(server_id);
        state.zone_to_server.retain(|_, v| v != server_id);
    }

    pub async fn update_health(&self, server_id: &str, health: Health) {
        let mut state = self.state.write().await;
        if let Some(d) = state.descriptors.get_mut(server_id) {
            d.health = health;
        }
    }

    /// Connects to `endpoint` over UDP and registers the resulting
    /// connection, performing the PSK handshake inline.
    pub async fn connect_server(
        &self,
        server_id: impl Into<String>,
        endpoint: std::net::SocketAddr,
        client_id: impl Into<String>,
        psk: &[u8],
        is_primary: bool,
    ) -> Result<Arc<ClientConnection>, RpcError> {
        let server_id = server_id.into();
        let bind = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        let transport = rpcnet_core::transport::UdpTransport::connect(bind, endpoint).await?;
        let connection =
            ClientConnection::connect(transport as Arc<dyn Transport>, self.config.clone(), client_id, psk)
                .await?;

        let mut descriptor = ServerDescriptor::new(server_id.clone(), endpoint.to_string());
        descriptor.is_primary = is_primary;

        let zone_routes = connection
            .manifest()
            .await
            .map(|_| HashMap::new())
            .unwrap_or_default();
        self.register(server_id, descriptor, connection.clone(), zone_routes).await;
        Ok(connection)
    }

    /// Picks a server for `request` via the composite routing chain and
    /// returns its live connection, copying the descriptor snapshot out
    /// from under the lock before the caller does anything blocking.
    pub async fn route(&self, request: &RouteRequest<'_>) -> Result<Arc<ClientConnection>, RpcError> {
        let state = self.state.read().await;
        let servers: Vec<ServerDescriptor> = state.descriptors.values().cloned().collect();
        let selected = self
            .router
            .select(&servers, &state.zone_to_server, request)
            .ok_or(RpcError::NoServersAvailable)?;
        state
            .connections
            .get(&selected.server_id)
            .cloned()
            .ok_or(RpcError::NoServersAvailable)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn snapshot_descriptors(&self) -> Vec<ServerDescriptor> {
        self.state.read().await.descriptors.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn route_with_no_servers_returns_no_servers_available() {
        let manager = ConnectionManager::new(RpcConfig::default());
        let err = manager
            .route(&RouteRequest {
                target_zone_id: None,
                grain_type: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NoServersAvailable));
    }
}
