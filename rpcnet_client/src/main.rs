//! Demo client binary.
//!
//! Usage:
//!   cargo run -p rpcnet_client -- [--addr 127.0.0.1:40000] [--psk <hex>]
//!
//! Connects to a server, performs the PSK handshake, and invokes a single
//! ping-style method against whatever grain its manifest advertises for
//! `--interface` (defaults to `IPing`), printing the result.

use std::env;

use anyhow::Context;
use rpcnet_client::ClientConnection;
use rpcnet_core::config::RpcConfig;
use rpcnet_core::message::GrainId;
use rpcnet_core::transport::{Transport, UdpTransport};
use tracing::info;

struct Args {
    addr: String,
    psk: Vec<u8>,
    interface: String,
    client_id: String,
}

fn parse_args() -> Args {
    let mut addr = "127.0.0.1:40000".to_string();
    let mut psk = b"demo-pre-shared-key".to_vec();
    let mut interface = "IPing".to_string();
    let mut client_id = format!("client-{}", std::process::id());

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
            "--interface" if i + 1 < args.len() => {
                interface = args[i + 1].clone();
                i += 2;
            }
            "--client-id" if i + 1 < args.len() => {
                client_id = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args {
        addr,
        psk,
        interface,
        client_id,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let config = RpcConfig::default();
    let server_addr = args.addr.parse().context("parse --addr")?;

    info!(server = %server_addr, "connecting");
    let bind = std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
    let transport = UdpTransport::connect(bind, server_addr).await?;
    let connection = ClientConnection::connect(
        transport as std::sync::Arc<dyn Transport>,
        config,
        args.client_id,
        &args.psk,
    )
    .await?;

    info!("handshake complete");
    let result = connection
        .invoke(GrainId::new("PingGrain", b"default".to_vec()), args.interface, 0, Vec::new(), None)
        .await?;
    println!("response: {} bytes", result.len());

    connection.close().await;
    Ok(())
}
