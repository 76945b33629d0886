//! Scenario S6: concurrent-session cap enforcement for one identity. Two
//! clients share identity `"p1"`; once the cap is exceeded the oldest
//! session is revoked, and a revoked session's next request fails with
//! `Unauthorized` rather than being dispatched.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rpcnet_client::ClientConnection;
use rpcnet_core::config::RpcConfig;
use rpcnet_core::error::RpcError;
use rpcnet_core::invoker::{InvokeError, Invoker, StreamItem};
use rpcnet_core::message::{GrainId, Identity, Role};
use rpcnet_core::transport::{Transport, UdpTransport};
use rpcnet_server::{IdentityStore, Listener, ManifestRegistry, NoPolicies, StaticIdentityStore};
use tokio::sync::mpsc;

struct EchoGrain;

#[async_trait]
impl Invoker for EchoGrain {
    fn can_invoke(&self, _grain_id: &GrainId, interface_type: &str, _method_id: i32) -> bool {
        interface_type == "IEcho"
    }

    async fn invoke(
        &self,
        _grain_id: &GrainId,
        _interface_type: &str,
        _method_id: i32,
        arguments: &[u8],
    ) -> Result<Vec<u8>, InvokeError> {
        Ok(arguments.to_vec())
    }

    async fn invoke_stream(
        &self,
        _grain_id: &GrainId,
        _interface_type: &str,
        _method_id: i32,
        _arguments: &[u8],
        sender: mpsc::Sender<StreamItem>,
    ) -> Result<(), InvokeError> {
        let _ = sender.send(StreamItem::Complete).await;
        Ok(())
    }
}

const PSK: &[u8] = b"session-limits-test-psk";
const CLIENT_ID: &str = "p1";

async fn start_server(max_concurrent_sessions_per_user: u32) -> SocketAddr {
    let mut config = RpcConfig::default();
    config.server_addr = "127.0.0.1:0".into();
    config.max_concurrent_sessions_per_user = max_concurrent_sessions_per_user;

    let mut registry = ManifestRegistry::new();
    registry.bind("IEcho", "EchoGrain");

    let mut identities = StaticIdentityStore::new();
    identities.insert(
        CLIENT_ID,
        PSK.to_vec(),
        Identity {
            user_id: CLIENT_ID.into(),
            user_name: "Shared Identity".into(),
            role: Role::User,
        },
    );

    let listener = Listener::bind(
        config,
        "server-1",
        registry.build(),
        None,
        HashMap::new(),
        Arc::new(identities) as Arc<dyn IdentityStore>,
        Arc::new(EchoGrain),
        Arc::new(NoPolicies),
    )
    .await
    .expect("bind rendezvous socket");

    let addr = listener.local_addr().expect("local_addr");
    let listener = Arc::new(listener);
    tokio::spawn(listener.serve(|conn| {
        tokio::spawn(async move {
            conn.run().await;
        });
    }));
    addr
}

async fn connect(server_addr: SocketAddr) -> Arc<ClientConnection> {
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let transport = UdpTransport::connect(bind, server_addr).await.expect("connect");
    ClientConnection::connect(
        transport as Arc<dyn Transport>,
        RpcConfig::default(),
        CLIENT_ID,
        PSK,
    )
    .await
    .expect("handshake")
}

async fn ping(client: &ClientConnection) -> Result<Vec<u8>, RpcError> {
    client
        .invoke(
            GrainId::new("EchoGrain", b"k".to_vec()),
            "IEcho",
            0,
            b"ping".to_vec(),
            Some(2_000),
        )
        .await
}

#[tokio::test]
async fn sixth_session_for_one_identity_revokes_the_oldest() {
    let server_addr = start_server(5).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(server_addr).await);
        // Give the listener's session registry a moment to settle before
        // the next handshake, so revocation order is deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // All five should still be usable: the cap hasn't been exceeded yet.
    for client in &clients {
        assert!(ping(client).await.is_ok());
    }

    // A sixth session for the same identity pushes the set over the cap;
    // the oldest (the first client connected) must be revoked.
    let sixth = connect(server_addr).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(ping(&sixth).await.is_ok());
    let oldest_result = ping(&clients[0]).await;
    assert!(
        matches!(oldest_result, Err(RpcError::Unauthorized(_))),
        "expected oldest session to be revoked, got {oldest_result:?}"
    );

    // The rest of the original five are unaffected by the cap.
    for client in &clients[1..] {
        assert!(ping(client).await.is_ok());
    }
}
