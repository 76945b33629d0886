//! Standalone conformance runner: exercises the handshake, request/response,
//! streaming, and authorization paths against an in-process server and
//! prints a pass/fail summary. Exits non-zero if anything fails, so it can
//! gate CI the way the integration test suite does, just without requiring
//! `cargo test`'s harness.

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
        for chunk in arguments.chunks(1) {
            if sender.send(StreamItem::Data(chunk.to_vec())).await.is_err() {
                return Ok(());
            }
        }
        let _ = sender.send(StreamItem::Complete).await;
        Ok(())
    }
}

const PSK: &[u8] = b"conformance-runner-psk";
const CLIENT_ID: &str = "conformance-client";

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
            user_name: "Conformance".into(),
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

async fn connect_client(server_addr: SocketAddr, psk: &[u8]) -> Result<Arc<ClientConnection>, rpcnet_core::error::RpcError> {
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let transport = UdpTransport::connect(bind, server_addr)
        .await
        .expect("bind client transport");
    ClientConnection::connect(transport as Arc<dyn Transport>, RpcConfig::default(), CLIENT_ID, psk).await
}

struct Check {
    name: &'static str,
    passed: bool,
    detail: Option<String>,
}

async fn run_checks() -> Vec<Check> {
    let server_addr = start_server().await;
    let mut checks = Vec::new();

    let client = match connect_client(server_addr, PSK).await {
        Ok(c) => {
            checks.push(Check { name: "handshake completes", passed: true, detail: None });
            Some(c)
        }
        Err(e) => {
            checks.push(Check {
                name: "handshake completes",
                passed: false,
                detail: Some(e.to_string()),
            });
            None
        }
    };

    if let Some(client) = client {
        checks.push(Check {
            name: "manifest is delivered",
            passed: client.manifest().await.is_some(),
            detail: None,
        });

        match client
            .invoke(GrainId::new("PingGrain", b"k".to_vec()), "IPing", 0, vec![4, 5, 6], None)
            .await
        {
            Ok(payload) => checks.push(Check {
                name: "unary request echoes payload",
                passed: payload == vec![4, 5, 6],
                detail: None,
            }),
            Err(e) => checks.push(Check {
                name: "unary request echoes payload",
                passed: false,
                detail: Some(e.to_string()),
            }),
        }

        match client
            .invoke_stream(GrainId::new("PingGrain", b"k".to_vec()), "IPing", 0, vec![1, 2, 3])
            .await
        {
            Ok(mut stream) => {
                let mut items = Vec::new();
                loop {
                    match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
                        Ok(Some(rpcnet_client::stream::StreamOutcome::Item(d))) => items.push(d),
                        Ok(Some(rpcnet_client::stream::StreamOutcome::Done)) | Ok(None) => break,
                        Ok(Some(rpcnet_client::stream::StreamOutcome::Failed(_))) | Err(_) => break,
                    }
                }
                checks.push(Check {
                    name: "streamed request yields items then completes",
                    passed: items == vec![vec![1], vec![2], vec![3]],
                    detail: None,
                });
            }
            Err(e) => checks.push(Check {
                name: "streamed request yields items then completes",
                passed: false,
                detail: Some(e.to_string()),
            }),
        }

        client.close().await;
    }

    match connect_client(server_addr, b"wrong-psk").await {
        Ok(_) => checks.push(Check {
            name: "wrong psk is rejected",
            passed: false,
            detail: Some("handshake unexpectedly succeeded".into()),
        }),
        Err(_) => checks.push(Check { name: "wrong psk is rejected", passed: true, detail: None }),
    }

    checks
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    println!("Datagram RPC runtime conformance checks");
    println!("========================================\n");

    let checks = run_checks().await;
    let mut failed = 0;
    for check in &checks {
        if check.passed {
            println!("[PASS] {}", check.name);
        } else {
            failed += 1;
            println!("[FAIL] {}{}", check.name, check
                .detail
                .as_ref()
                .map(|d| format!(" — {d}"))
                .unwrap_or_default());
        }
    }

    println!("\n{}/{} checks passed", checks.len() - failed, checks.len());
    if failed > 0 {
        std::process::exit(1);
    }
}
