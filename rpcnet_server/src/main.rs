//! Demo server binary.
//!
//! Usage:
//!   cargo run -p rpcnet_server -- [--addr 127.0.0.1:40000] [--psk <string>]
//!
//! Binds a rendezvous socket, accepts connections authenticated against a
//! single static client id/PSK pair, and answers `IPing`/method 0 by
//! echoing the request payload back.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rpcnet_core::config::RpcConfig;
use rpcnet_core::invoker::{InvokeError, Invoker, StreamItem};
use rpcnet_core::message::{GrainId, Identity, Role};
use rpcnet_server::{IdentityStore, Listener, ManifestRegistry, NoPolicies, StaticIdentityStore};
use tokio::sync::mpsc;
use tracing::info;

struct PingGrain;

#[async_trait]
impl Invoker for PingGrain {
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
        let _ = sender.send(StreamItem::Data(arguments.to_vec())).await;
        let _ = sender.send(StreamItem::Complete).await;
        Ok(())
    }
}

struct Args {
    addr: String,
    psk: Vec<u8>,
    client_id: String,
}

fn parse_args() -> Args {
    let mut addr = "127.0.0.1:40000".to_string();
    let mut psk = b"demo-pre-shared-key".to_vec();
    let mut client_id = "client-1".to_string();

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr = args[i + 1].clone();
                i += 2;
            }
            "--psk" if i + 1 < args.len() => {
                psk = args[i + 1].clone().into_bytes();
                i += 2;
            }
            "--client-id" if i + 1 < args.len() => {
                client_id = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args { addr, psk, client_id }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let mut config = RpcConfig::default();
    config.server_addr = args.addr.clone();

    let mut registry = ManifestRegistry::new();
    registry.bind("IPing", "PingGrain");
    let manifest = registry.build();

    let mut identities = StaticIdentityStore::new();
    identities.insert(
        args.client_id.clone(),
        args.psk,
        Identity {
            user_id: args.client_id.clone(),
            user_name: args.client_id.clone(),
            role: Role::User,
        },
    );

    let listener = Arc::new(
        Listener::bind(
            config,
            "server-1",
            manifest,
            None,
            HashMap::new(),
            Arc::new(identities) as Arc<dyn IdentityStore>,
            Arc::new(PingGrain),
            Arc::new(NoPolicies),
        )
        .await
        .context("bind rendezvous socket")?,
    );

    info!(addr = %args.addr, "listening");
    listener
        .serve(|conn| {
            tokio::spawn(async move {
                conn.run().await;
            });
        })
        .await;

    Ok(())
}
