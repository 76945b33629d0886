//! Accept loop (§3, §4.4): demultiplexes the plaintext handshake bootstrap
//! off one rendezvous socket, hands each accepted peer its own
//! per-connection UDP socket, and spawns a [`ServerConnection`] for it.
//!
//! Grounded in the teacher's `ReliableListener::accept` (`net.rs`), which
//! likewise turns one bound socket into a stream of per-peer connection
//! objects; here the UDP analogue of "new file descriptor per accept" is
//! "new ephemeral, connected UDP socket per peer", handed to the client via
//! a `HANDSHAKE_REDIRECT` frame before the challenge is issued.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rpcnet_core::config::RpcConfig;
use rpcnet_core::counters::Counters;
use rpcnet_core::invoker::Invoker;
use rpcnet_core::message::Manifest;
use rpcnet_core::session::{
    PskCipher, PskSession, HANDSHAKE_ACCEPT, HANDSHAKE_CHALLENGE, HANDSHAKE_HELLO,
    HANDSHAKE_REDIRECT, HANDSHAKE_REJECT, HANDSHAKE_RESPONSE,
};
use rpcnet_core::transport::{Transport, UdpTransport};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, PolicyResolver, ServerConnection};
use crate::identity::IdentityStore;

/// Owns the rendezvous socket and the state needed to turn a stream of
/// raw datagrams into a stream of authenticated [`ServerConnection`]s.
pub struct Listener {
    rendezvous: Arc<UdpSocket>,
    server_id: String,
    config: RpcConfig,
    manifest: Manifest,
    zone_id: Option<String>,
    zone_to_server_map: HashMap<String, String>,
    identities: Arc<dyn IdentityStore>,
    invoker: Arc<dyn Invoker>,
    policies: Arc<dyn PolicyResolver>,
    counters: Arc<Counters>,
    in_progress: Mutex<std::collections::HashSet<SocketAddr>>,
    /// Live sessions per identity's client id, oldest first, used to
    /// enforce `max_concurrent_sessions_per_user` (§5, §6, scenario S6).
    sessions: Mutex<HashMap<String, VecDeque<Arc<ServerConnection>>>>,
}

impl Listener {
    pub async fn bind(
        config: RpcConfig,
        server_id: impl Into<String>,
        manifest: Manifest,
        zone_id: Option<String>,
        zone_to_server_map: HashMap<String, String>,
        identities: Arc<dyn IdentityStore>,
        invoker: Arc<dyn Invoker>,
        policies: Arc<dyn PolicyResolver>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.server_addr.clone()).await?;
        Ok(Self {
            rendezvous: Arc::new(socket),
            server_id: server_id.into(),
            config,
            manifest,
            zone_id,
            zone_to_server_map,
            identities,
            invoker,
            policies,
            counters: Arc::new(Counters::default()),
            in_progress: Mutex::new(std::collections::HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// The rendezvous socket's bound address, useful when `server_addr` was
    /// configured with an ephemeral (`:0`) port, as tests do.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.rendezvous.local_addr()
    }

    /// Runs forever, handing each new peer's accepted connection to
    /// `on_accept` once its handshake completes.
    pub async fn serve<F>(self: Arc<Self>, on_accept: F)
    where
        F: Fn(Arc<ServerConnection>) + Send + Sync + 'static,
    {
        let on_accept = Arc::new(on_accept);
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, peer) = match self.rendezvous.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "rendezvous socket recv failed");
                    continue;
                }
            };
            if buf.first() != Some(&HANDSHAKE_HELLO) {
                debug!(%peer, "ignoring non-hello datagram on rendezvous socket");
                continue;
            }
            let client_id = match std::str::from_utf8(&buf[1..n]) {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            };

            {
                let mut in_progress = self.in_progress.lock().await;
                if !in_progress.insert(peer) {
                    continue; // already accepting this peer, ignore the retransmitted HELLO
                }
            }

            let this = self.clone();
            let on_accept = on_accept.clone();
            tokio::spawn(async move {
                let result = this.accept_one(peer, client_id.clone()).await;
                this.in_progress.lock().await.remove(&peer);
                match result {
                    Ok(conn) => {
                        this.register_session(client_id, conn.clone()).await;
                        on_accept(conn)
                    }
                    Err(e) => debug!(%peer, error = %e, "handshake failed"),
                }
            });
        }
    }

    /// Tracks `conn` under `client_id`'s session set and enforces
    /// `max_concurrent_sessions_per_user` by revoking the oldest live
    /// session(s) once the cap is exceeded.
    async fn register_session(&self, client_id: String, conn: Arc<ServerConnection>) {
        let mut sessions = self.sessions.lock().await;
        let deque = sessions.entry(client_id).or_insert_with(VecDeque::new);

        let mut alive = VecDeque::with_capacity(deque.len());
        for c in deque.drain(..) {
            if c.state().await != ConnectionState::Closed {
                alive.push_back(c);
            }
        }
        *deque = alive;
        deque.push_back(conn);

        let max = self.config.max_concurrent_sessions_per_user as usize;
        while deque.len() > max.max(1) {
            if let Some(oldest) = deque.pop_front() {
                oldest.revoke("concurrent session cap exceeded").await;
            }
        }
    }

    async fn accept_one(
        &self,
        peer: SocketAddr,
        client_id: String,
    ) -> Result<Arc<ServerConnection>, String> {
        let Some((psk, identity)) = self.identities.lookup(&client_id) else {
            let _ = self
                .rendezvous
                .send_to(&[HANDSHAKE_REJECT], peer)
                .await;
            return Err(format!("unknown client id {client_id}"));
        };

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let transport = UdpTransport::connect(bind, peer)
            .await
            .map_err(|e| e.to_string())?;

        // Tell the client where the dedicated connection lives, then
        // switch to talking on that socket for the rest of the handshake.
        let new_port = transport.local_addr().map_err(|e| e.to_string())?.port();
        let mut redirect = vec![HANDSHAKE_REDIRECT];
        redirect.extend_from_slice(&new_port.to_be_bytes());
        self.rendezvous
            .send_to(&redirect, peer)
            .await
            .map_err(|e| e.to_string())?;

        let hello = recv_with_timeout(&transport, self.config.psk.handshake_timeout_ms)
            .await
            .map_err(|e| e.to_string())?;
        if hello.first() != Some(&HANDSHAKE_HELLO) {
            return Err("expected hello on redirected socket".into());
        }

        let pending = PskSession::issue_challenge(client_id.clone());
        let mut challenge_frame = vec![HANDSHAKE_CHALLENGE];
        challenge_frame.extend_from_slice(&pending.challenge);
        transport
            .send(&challenge_frame, rpcnet_core::transport::DeliveryMode::ReliableUnordered)
            .await
            .map_err(|e| e.to_string())?;

        let response_frame = recv_with_timeout(&transport, self.config.psk.handshake_timeout_ms)
            .await
            .map_err(|e| e.to_string())?;
        if response_frame.first() != Some(&HANDSHAKE_RESPONSE) {
            return Err("expected response frame".into());
        }

        let cipher: PskCipher = self.config.psk.cipher.into();
        let mut session = PskSession::new(pending.identity.clone(), cipher);
        if session
            .verify_and_derive(&psk, &pending.challenge, &response_frame[1..])
            .is_err()
        {
            let _ = transport
                .send(&[HANDSHAKE_REJECT], rpcnet_core::transport::DeliveryMode::ReliableUnordered)
                .await;
            return Err(format!("challenge response mismatch for {client_id}"));
        }

        transport
            .send(&[HANDSHAKE_ACCEPT], rpcnet_core::transport::DeliveryMode::ReliableUnordered)
            .await
            .map_err(|e| e.to_string())?;

        info!(%peer, %client_id, "accepted connection");
        Ok(ServerConnection::new(
            transport as Arc<dyn Transport>,
            self.config.clone(),
            self.server_id.clone(),
            self.manifest.clone(),
            self.zone_id.clone(),
            self.zone_to_server_map.clone(),
            self.invoker.clone(),
            self.policies.clone(),
            session,
            identity,
            self.counters.clone(),
        ))
    }
}

async fn recv_with_timeout(
    transport: &Arc<UdpTransport>,
    timeout_ms: u64,
) -> Result<Vec<u8>, rpcnet_core::error::RpcError> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), transport.recv())
        .await
        .map_err(|_| rpcnet_core::error::RpcError::HandshakeTimeout)?
}
