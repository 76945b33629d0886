//! Client-side RPC endpoint (C4): one [`ClientConnection`] per server,
//! owning the PSK session, the correlation table for in-flight requests,
//! and the async-stream consumer table.
//!
//! Grounded in the teacher's `GameClient` (state enum, `connect`, background
//! polling) — the handshake and request/response plumbing are new, the
//! shape (explicit state enum, `anyhow`-free `Result<_, RpcError>` surface,
//! `tracing` fields on every transition) follows it closely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rpcnet_core::config::RpcConfig;
use rpcnet_core::error::RpcError;
use rpcnet_core::event::{ConnectionEvent, EventBus};
use rpcnet_core::message::{Manifest, MessageHeader, RpcMessage};
use rpcnet_core::session::{
    PskCipher, PskSession, SessionState, HANDSHAKE_ACCEPT, HANDSHAKE_CHALLENGE, HANDSHAKE_HELLO,
    HANDSHAKE_REDIRECT, HANDSHAKE_REJECT, HANDSHAKE_RESPONSE,
};
use rpcnet_core::transport::{Transport, UdpTransport};
use rpcnet_core::{codec, counters::Counters};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection state, gated on manifest receipt the way the original
/// engine gates on map load (`Connected` -> `LoadingMap` -> `Ready`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AwaitingManifest,
    Ready,
    Closing,
    Closed,
}

struct PendingRequest {
    responder: oneshot::Sender<Result<Vec<u8>, RpcError>>,
    deadline: Instant,
}

/// One item delivered from a server-initiated `AsyncEnumerableItem` stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Item(Vec<u8>),
    Complete,
    Error(String),
}

struct Inner {
    state: ClientState,
    session: PskSession,
    manifest: Option<Manifest>,
    server_id: Option<String>,
    pending: HashMap<Uuid, PendingRequest>,
    streams: HashMap<Uuid, mpsc::Sender<StreamEvent>>,
    events: EventBus,
}

/// A live connection to one server.
pub struct ClientConnection {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    counters: Arc<Counters>,
    client_id: String,
    inner: Mutex<Inner>,
}

impl ClientConnection {
    /// Performs the plaintext PSK handshake, derives session keys, then
    /// completes the RPC-level `Handshake`/`HandshakeAck` exchange over the
    /// now-encrypted channel.
    pub async fn connect(
        mut transport: Arc<dyn Transport>,
        config: RpcConfig,
        client_id: impl Into<String>,
        psk: &[u8],
    ) -> Result<Arc<Self>, RpcError> {
        let client_id = client_id.into();
        let cipher: PskCipher = config.psk.cipher.into();

        // The listener may demultiplex many peers off one rendezvous socket
        // and hand each connection its own ephemeral port; follow at most
        // one redirect before settling on the transport used for the rest
        // of the session.
        let challenge_frame = loop {
            let mut hello = vec![HANDSHAKE_HELLO];
            hello.extend_from_slice(client_id.as_bytes());
            transport
                .send(&hello, rpcnet_core::transport::DeliveryMode::ReliableUnordered)
                .await?;

            let frame = recv_with_timeout(&transport, config.psk.handshake_timeout_ms).await?;
            match frame.first() {
                Some(&HANDSHAKE_REDIRECT) if frame.len() >= 3 => {
                    let port = u16::from_be_bytes([frame[1], frame[2]]);
                    let new_peer = std::net::SocketAddr::new(transport.peer_addr().ip(), port);
                    let bind = std::net::SocketAddr::new(
                        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                        0,
                    );
                    transport = UdpTransport::connect(bind, new_peer).await? as Arc<dyn Transport>;
                    debug!(%new_peer, "redirected to per-connection transport");
                }
                Some(&HANDSHAKE_CHALLENGE) => break frame,
                _ => return Err(RpcError::HandshakeFailed("expected challenge or redirect frame".into())),
            }
        };
        let challenge = &challenge_frame[1..];

        let response = PskSession::respond_to_challenge(psk, challenge);
        let mut response_frame = vec![HANDSHAKE_RESPONSE];
        response_frame.extend_from_slice(&response);
        transport
            .send(&response_frame, rpcnet_core::transport::DeliveryMode::ReliableUnordered)
            .await?;

        let accept_frame = recv_with_timeout(&transport, config.psk.handshake_timeout_ms).await?;
        match accept_frame.first() {
            Some(&HANDSHAKE_ACCEPT) => {}
            Some(&HANDSHAKE_REJECT) => {
                return Err(RpcError::HandshakeFailed("server rejected PSK response".into()))
            }
            _ => return Err(RpcError::HandshakeFailed("expected accept/reject frame".into())),
        }

        let mut session = PskSession::new(client_id.clone(), cipher);
        session.complete_as_client(psk, challenge);

        let conn = Arc::new(Self {
            transport,
            config,
            counters: Arc::new(Counters::default()),
            client_id: client_id.clone(),
            inner: Mutex::new(Inner {
                state: ClientState::Connecting,
                session,
                manifest: None,
                server_id: None,
                pending: HashMap::new(),
                streams: HashMap::new(),
                events: EventBus::default(),
            }),
        });

        conn.send_handshake().await?;
        conn.clone().spawn_reader();
        conn.clone().spawn_heartbeat();
        conn.clone().spawn_deadline_scanner();

        Ok(conn)
    }

    async fn send_handshake(&self) -> Result<(), RpcError> {
        let msg = RpcMessage::Handshake {
            header: MessageHeader::new(now_millis()),
            client_id: self.client_id.clone(),
            protocol_version: 1,
            features: vec!["streams".into(), "heartbeat".into()],
        };
        self.send_encrypted(&msg).await
    }

    async fn send_encrypted(&self, msg: &RpcMessage) -> Result<(), RpcError> {
        let plaintext = codec::encode(msg);
        let record = {
            let mut inner = self.inner.lock().await;
            inner
                .session
                .encrypt(&plaintext)
                .map_err(RpcError::from)?
        };
        self.transport
            .send(&record, rpcnet_core::transport::DeliveryMode::ReliableOrdered(0))
            .await
    }

    /// Invokes a unary method on the bound grain, waiting up to
    /// `timeout_ms` (or the configured default) for a `Response`.
    pub async fn invoke(
        &self,
        grain_id: rpcnet_core::message::GrainId,
        interface_type: impl Into<String>,
        method_id: i32,
        arguments: Vec<u8>,
        timeout_ms: Option<i32>,
    ) -> Result<Vec<u8>, RpcError> {
        {
            let inner = self.inner.lock().await;
            if inner.state != ClientState::Ready {
                return Err(RpcError::ProtocolViolation(
                    "connection is not in the Ready state".into(),
                ));
            }
        }

        let timeout_ms = timeout_ms.unwrap_or(self.config.request_timeout_default_ms as i32);
        let header = MessageHeader::new(now_millis());
        let message_id = header.message_id;
        let msg = RpcMessage::Request {
            header,
            grain_id,
            interface_type: interface_type.into(),
            method_id,
            arguments,
            timeout_ms,
            return_type_name: String::new(),
            target_zone_id: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(
                message_id,
                PendingRequest {
                    responder: tx,
                    deadline: Instant::now() + Duration::from_millis(timeout_ms as u64),
                },
            );
        }

        if let Err(e) = self.send_encrypted(&msg).await {
            self.inner.lock().await.pending.remove(&message_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Cancelled),
        }
    }

    /// Subscribes to a server-streamed method, returning a handle that
    /// sends `AsyncEnumerableCancel` on drop if not drained to completion.
    pub async fn invoke_stream(
        self: &Arc<Self>,
        grain_id: rpcnet_core::message::GrainId,
        interface_type: impl Into<String>,
        method_id: i32,
        arguments: Vec<u8>,
    ) -> Result<crate::stream::AsyncStream, RpcError> {
        let stream_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        {
            let mut inner = self.inner.lock().await;
            inner.streams.insert(stream_id, tx);
        }
        let msg = RpcMessage::AsyncEnumerableRequest {
            header: MessageHeader::new(now_millis()),
            grain_id,
            interface_type: interface_type.into(),
            method_id,
            arguments,
            stream_id,
        };
        self.send_encrypted(&msg).await?;
        Ok(crate::stream::AsyncStream::new(stream_id, self.clone(), rx))
    }

    /// Cancels a previously started stream.
    pub async fn cancel_stream(&self, stream_id: Uuid) -> Result<(), RpcError> {
        self.inner.lock().await.streams.remove(&stream_id);
        let msg = RpcMessage::AsyncEnumerableCancel {
            header: MessageHeader::new(now_millis()),
            stream_id,
        };
        self.send_encrypted(&msg).await
    }

    pub async fn state(&self) -> ClientState {
        self.inner.lock().await.state.clone()
    }

    pub async fn manifest(&self) -> Option<Manifest> {
        self.inner.lock().await.manifest.clone()
    }

    pub async fn drain_events(&self) -> Vec<ConnectionEvent> {
        self.inner.lock().await.events.drain::<ConnectionEvent>()
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    fn spawn_reader(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let record = match self.transport.recv().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "transport closed, client reader exiting");
                        self.inner.lock().await.state = ClientState::Closed;
                        return;
                    }
                };
                if let Err(e) = self.handle_record(&record).await {
                    self.counters.record(&e);
                    warn!(error = %e, "failed to handle inbound record");
                }
            }
        });
    }

    async fn handle_record(&self, record: &[u8]) -> Result<(), RpcError> {
        let plaintext = {
            let mut inner = self.inner.lock().await;
            inner.session.decrypt(record).map_err(RpcError::from)?
        };
        let msg = codec::decode(&plaintext)?;
        self.dispatch(msg).await
    }

    async fn dispatch(&self, msg: RpcMessage) -> Result<(), RpcError> {
        match msg {
            RpcMessage::HandshakeAck {
                server_id,
                manifest,
                zone_id,
                ..
            } => {
                let mut inner = self.inner.lock().await;
                inner.manifest = Some(manifest);
                inner.server_id = Some(server_id.clone());
                inner.state = ClientState::Ready;
                inner
                    .events
                    .push(ConnectionEvent::SessionEstablished { server_id });
                debug!(?zone_id, "handshake complete, connection ready");
                Ok(())
            }
            RpcMessage::Response {
                request_id,
                success,
                payload,
                error_message,
                ..
            } => {
                let mut inner = self.inner.lock().await;
                if let Some(pending) = inner.pending.remove(&request_id) {
                    let result = if success {
                        Ok(payload)
                    } else {
                        Err(RpcError::InvokerError(error_message))
                    };
                    let _ = pending.responder.send(result);
                } else {
                    debug!(%request_id, "response for unknown or already-resolved request");
                }
                Ok(())
            }
            RpcMessage::AsyncEnumerableItem {
                stream_id,
                item_data,
                is_complete,
                error_message,
                ..
            } => {
                let mut inner = self.inner.lock().await;
                if let Some(sender) = inner.streams.get(&stream_id).cloned() {
                    if !error_message.is_empty() {
                        let _ = sender.send(StreamEvent::Error(error_message)).await;
                        inner.streams.remove(&stream_id);
                    } else if is_complete {
                        let _ = sender.send(StreamEvent::Complete).await;
                        inner.streams.remove(&stream_id);
                    } else {
                        let _ = sender.send(StreamEvent::Item(item_data)).await;
                    }
                }
                Ok(())
            }
            RpcMessage::Heartbeat { .. } => Ok(()),
            other => Err(RpcError::ProtocolViolation(format!(
                "unexpected message at client: {other:?}"
            ))),
        }
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
            loop {
                interval.tick().await;
                if self.inner.lock().await.state == ClientState::Closed {
                    return;
                }
                let msg = RpcMessage::Heartbeat {
                    header: MessageHeader::new(now_millis()),
                    source_id: self.client_id.clone(),
                };
                if let Err(e) = self.send_encrypted(&msg).await {
                    debug!(error = %e, "heartbeat send failed");
                }
            }
        });
    }

    fn spawn_deadline_scanner(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.deadline_scan_interval_ms));
            loop {
                interval.tick().await;
                let mut inner = self.inner.lock().await;
                if inner.state == ClientState::Closed {
                    return;
                }
                let now = Instant::now();
                let expired: Vec<Uuid> = inner
                    .pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(pending) = inner.pending.remove(&id) {
                        let _ = pending.responder.send(Err(RpcError::RequestTimeout));
                        self.counters.record(&RpcError::RequestTimeout);
                    }
                }
            }
        });
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = ClientState::Closed;
        self.transport.close().await;
        info!("client connection closed");
    }
}

async fn recv_with_timeout(transport: &Arc<dyn Transport>, timeout_ms: u64) -> Result<Vec<u8>, RpcError> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), transport.recv())
        .await
        .map_err(|_| RpcError::HandshakeTimeout)?
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
