//! End-to-end authorization: a request against a method policy the
//! caller's role doesn't satisfy comes back denied, and a request the
//! identity does satisfy succeeds. Rule-ordering unit coverage lives in
//! `rpcnet_core::auth`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rpcnet_client::ClientConnection;
use rpcnet_core::auth::MethodPolicy;
use rpcnet_core::config::RpcConfig;
use rpcnet_core::invoker::{InvokeError, Invoker, StreamItem};
use rpcnet_core::message::{GrainId, Identity, Role};
use rpcnet_core::transport::{Transport, UdpTransport};
use rpcnet_server::{IdentityStore, Listener, ManifestRegistry, PolicyResolver, StaticIdentityStore};
use tokio::sync::mpsc;

struct EchoGrain;

#[async_trait]
impl Invoker for EchoGrain {
    fn can_invoke(&self, _grain_id: &GrainId, interface_type: &str, _method_id: i32) -> bool {
        interface_type == "IAdmin"
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

struct AdminOnly;

impl PolicyResolver for AdminOnly {
    fn policies_for(&self, _interface_type: &str, _method_id: i32) -> Vec<MethodPolicy> {
        vec![MethodPolicy::RequireRole(Role::Admin)]
    }
}

const PSK: &[u8] = b"authz-test-psk";

async fn start_server(role: Role) -> SocketAddr {
    let mut config = RpcConfig::default();
    config.server_addr = "127.0.0.1:0".into();

    let mut registry = ManifestRegistry::new();
    registry.bind("IAdmin", "AdminGrain");

    let mut identities = StaticIdentityStore::new();
    identities.insert(
        "caller",
        PSK.to_vec(),
        Identity {
            user_id: "caller".into(),
            user_name: "Caller".into(),
            role,
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
        Arc::new(AdminOnly),
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
    ClientConnection::connect(transport as Arc<dyn Transport>, RpcConfig::default(), "caller", PSK)
        .await
        .expect("handshake")
}

#[tokio::test]
async fn role_below_requirement_is_denied() {
    let server_addr = start_server(Role::User).await;
    let client = connect(server_addr).await;
    let result = client
        .invoke(GrainId::new("AdminGrain", b"k".to_vec()), "IAdmin", 0, vec![1], None)
        .await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("below required"), "unexpected error: {err}");
}

#[tokio::test]
async fn role_meeting_requirement_is_allowed() {
    let server_addr = start_server(Role::Admin).await;
    let client = connect(server_addr).await;
    let result = client
        .invoke(GrainId::new("AdminGrain", b"k".to_vec()), "IAdmin", 0, vec![1, 2], None)
        .await
        .expect("invoke");
    assert_eq!(result, vec![1, 2]);
}
