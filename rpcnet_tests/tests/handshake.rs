//! End-to-end PSK handshake and request/response flow over real loopback
//! UDP sockets: rendezvous accept, redirect to a per-connection socket,
//! challenge/response, and a unary call answered by an in-process invoker.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rpcnet_client::ClientConnection;
use rpcnet_core::config::RpcConfig;
use rpcnet_core::invoker::{InvokeError, Invoker, StreamItem};
use rpcnet_core::message::{GrainId, Identity, Role};
use rpcnet_core::transport::{Transport, UdpTransport};
use rpcnet_server::{IdentityStore, Listener, ManifestRegistry, NoPolicies, StaticIdentityStore};
use tokio::sync::mpsc;

struct EchoGrain;

#[async_trait]
impl Invoker for EchoGrain {
    fn can_invoke(&self, _grain_id: &GrainId, interface_type: &str, _method_id: i32) -> bool {
        interface_type == "IPing"
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
        arguments: &[u8],
        sender: mpsc::Sender<StreamItem>,
    ) -> Result<(), InvokeError> {
        for chunk in arguments.chunks(1).take(3) {
            let _ = sender.send(StreamItem::Data(chunk.to_vec())).await;
        }
        let _ = sender.send(StreamItem::Complete).await;
        Ok(())
    }
}

const PSK: &[u8] = b"integration-test-psk";
const CLIENT_ID: &str = "client-under-test";

async fn start_server() -> SocketAddr {
    let mut config = RpcConfig::default();
    config.server_addr = "127.0.0.1:0".into();

    let mut registry = ManifestRegistry::new();
    registry.bind("IPing", "PingGrain");

    let mut identities = StaticIdentityStore::new();
    identities.insert(
        CLIENT_ID,
        PSK.to_vec(),
        Identity {
            user_id: CLIENT_ID.into(),
            user_name: "Tester".into(),
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

async fn connect_client(server_addr: SocketAddr) -> Arc<ClientConnection> {
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

#[tokio::test]
async fn handshake_completes_and_reaches_ready_state() {
    let server_addr = start_server().await;
    let client = connect_client(server_addr).await;
    assert_eq!(client.state().await, rpcnet_client::ClientState::Ready);
    assert!(client.manifest().await.is_some());
}

#[tokio::test]
async fn wrong_psk_is_rejected() {
    let server_addr = start_server().await;
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let transport = UdpTransport::connect(bind, server_addr).await.expect("connect");
    let result = ClientConnection::connect(
        transport as Arc<dyn Transport>,
        RpcConfig::default(),
        CLIENT_ID,
        b"totally-wrong-psk",
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unary_request_is_answered_by_the_bound_invoker() {
    let server_addr = start_server().await;
    let client = connect_client(server_addr).await;

    let result = client
        .invoke(
            GrainId::new("PingGrain", b"default".to_vec()),
            "IPing",
            0,
            vec![9, 8, 7],
            None,
        )
        .await
        .expect("invoke");
    assert_eq!(result, vec![9, 8, 7]);
}

#[tokio::test]
async fn streamed_request_delivers_items_then_completes() {
    let server_addr = start_server().await;
    let client = connect_client(server_addr).await;

    let mut stream = client
        .invoke_stream(GrainId::new("PingGrain", b"default".to_vec()), "IPing", 0, vec![1, 2, 3])
        .await
        .expect("invoke_stream");

    let mut items = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for stream items")
        {
            Some(rpcnet_client::stream::StreamOutcome::Item(data)) => items.push(data),
            Some(rpcnet_client::stream::StreamOutcome::Done) => break,
            Some(rpcnet_client::stream::StreamOutcome::Failed(e)) => panic!("stream error: {e}"),
            None => break,
        }
    }
    assert_eq!(items, vec![vec![1], vec![2], vec![3]]);
}
