//! Server-side RPC endpoint (C4): per-peer connection state machine,
//! authorization hook, and invoker dispatch, including the
//! `AsyncEnumerable*` streaming path.
//!
//! Grounded in the teacher's `GameServer` connection handling
//! (`handle_new_connection`, `handle_udp_message`) — accept, validate,
//! dispatch, reply — generalized from game snapshots to RPC requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rpcnet_core::auth::{self, AuthContext, MethodPolicy};
use rpcnet_core::config::RpcConfig;
use rpcnet_core::error::RpcError;
use rpcnet_core::invoker::{InvokeError, Invoker, StreamItem};
use rpcnet_core::message::{GrainId, Identity, Manifest, MessageHeader, RpcMessage};
use rpcnet_core::session::PskSession;
use rpcnet_core::transport::Transport;
use rpcnet_core::{codec, counters::Counters};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the per-connection session-lifecycle scanner checks idle and
/// absolute timeouts. Coarser than the client's deadline scanner since
/// session timeouts are configured in minutes/hours, not milliseconds.
const SESSION_LIFECYCLE_SCAN_INTERVAL: Duration = Duration::from_millis(1_000);

/// Server-side connection states (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    AwaitingHandshake,
    Authenticated,
    Closing,
    Closed,
}

/// Resolves the authorization attributes declared on an interface method.
/// Real deployments back this with whatever attribute/reflection system
/// the generated interface stubs use; tests can supply a static map.
pub trait PolicyResolver: Send + Sync {
    fn policies_for(&self, interface_type: &str, method_id: i32) -> Vec<MethodPolicy>;
}

/// A resolver with no declared policies anywhere, so every call falls
/// through to the configured default policy.
pub struct NoPolicies;

impl PolicyResolver for NoPolicies {
    fn policies_for(&self, _interface_type: &str, _method_id: i32) -> Vec<MethodPolicy> {
        Vec::new()
    }
}

struct Inner {
    state: ConnectionState,
    session: PskSession,
    identity: Identity,
    active_streams: HashSet<Uuid>,
    /// Set by session-lifecycle enforcement (concurrent-session cap, idle or
    /// absolute timeout). A revoked session stays connected but every
    /// subsequent request is answered with `Unauthorized` rather than
    /// dispatched, so the caller learns the session is gone without the
    /// transport being torn down mid-response.
    revoked: bool,
    created_at: Instant,
    last_activity: Instant,
}

/// One accepted peer connection, live for the lifetime of its session.
pub struct ServerConnection {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    server_id: String,
    manifest: Manifest,
    zone_id: Option<String>,
    zone_to_server_map: std::collections::HashMap<String, String>,
    invoker: Arc<dyn Invoker>,
    policies: Arc<dyn PolicyResolver>,
    counters: Arc<Counters>,
    inner: Mutex<Inner>,
}

impl ServerConnection {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RpcConfig,
        server_id: impl Into<String>,
        manifest: Manifest,
        zone_id: Option<String>,
        zone_to_server_map: std::collections::HashMap<String, String>,
        invoker: Arc<dyn Invoker>,
        policies: Arc<dyn PolicyResolver>,
        session: PskSession,
        identity: Identity,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            server_id: server_id.into(),
            manifest,
            zone_id,
            zone_to_server_map,
            invoker,
            policies,
            counters,
            inner: Mutex::new(Inner {
                state: ConnectionState::AwaitingHandshake,
                session,
                identity,
                active_streams: HashSet::new(),
                revoked: false,
                created_at: Instant::now(),
                last_activity: Instant::now(),
            }),
        })
    }

    /// Client id this connection authenticated as, per its identity record.
    pub async fn identity(&self) -> Identity {
        self.inner.lock().await.identity.clone()
    }

    /// Marks the session revoked: it stays connected, but every later
    /// request fails with `Unauthorized` instead of being dispatched.
    /// Used by the session cap and idle/absolute timeout enforcement.
    pub async fn revoke(&self, reason: &str) {
        self.inner.lock().await.revoked = true;
        info!(server_id = %self.server_id, reason, "session revoked");
    }

    fn spawn_session_lifecycle(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_LIFECYCLE_SCAN_INTERVAL);
            loop {
                interval.tick().await;
                let mut inner = self.inner.lock().await;
                if inner.state == ConnectionState::Closed {
                    return;
                }
                if inner.revoked {
                    continue;
                }
                let now = Instant::now();
                let idle_ms = now.duration_since(inner.last_activity).as_millis() as u64;
                let age_ms = now.duration_since(inner.created_at).as_millis() as u64;
                let idle_expired = idle_ms >= self.config.session_idle_timeout_ms;
                let absolute_expired = age_ms >= self.config.session_absolute_timeout_ms;
                if idle_expired || absolute_expired {
                    inner.revoked = true;
                    drop(inner);
                    debug!(
                        server_id = %self.server_id,
                        idle_expired,
                        absolute_expired,
                        "session expired, revoking"
                    );
                }
            }
        });
    }

    /// Runs the connection's receive loop until the transport closes.
    /// Intended to be spawned by the listener.
    pub async fn run(self: Arc<Self>) {
        self.clone().spawn_session_lifecycle();
        loop {
            let record = match self.transport.recv().await {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, server_id = %self.server_id, "connection closed");
                    self.inner.lock().await.state = ConnectionState::Closed;
                    return;
                }
            };
            if let Err(e) = self.handle_record(&record).await {
                self.counters.record(&e);
                warn!(error = %e, "error handling inbound record");
                if matches!(e, RpcError::MalformedMessage(_) | RpcError::ProtocolViolation(_)) {
                    self.inner.lock().await.state = ConnectionState::Closing;
                }
            }
        }
    }

    async fn handle_record(&self, record: &[u8]) -> Result<(), RpcError> {
        let plaintext = {
            let mut inner = self.inner.lock().await;
            inner.last_activity = Instant::now();
            inner.session.decrypt(record).map_err(RpcError::from)?
        };
        let msg = codec::decode(&plaintext)?;
        self.dispatch(msg).await
    }

    async fn send_encrypted(&self, msg: &RpcMessage) -> Result<(), RpcError> {
        let plaintext = codec::encode(msg);
        let record = {
            let mut inner = self.inner.lock().await;
            inner.session.encrypt(&plaintext).map_err(RpcError::from)?
        };
        self.transport
            .send(&record, rpcnet_core::transport::DeliveryMode::ReliableOrdered(0))
            .await
    }

    async fn dispatch(self: &Arc<Self>, msg: RpcMessage) -> Result<(), RpcError> {
        match msg {
            RpcMessage::Handshake { client_id, .. } => {
                self.inner.lock().await.state = ConnectionState::Authenticated;
                let ack = RpcMessage::HandshakeAck {
                    header: MessageHeader::new(now_millis()),
                    server_id: self.server_id.clone(),
                    protocol_version: 1,
                    manifest: self.manifest.clone(),
                    zone_id: self.zone_id.clone(),
                    zone_to_server_map: self.zone_to_server_map.clone(),
                };
                info!(%client_id, server_id = %self.server_id, "handshake accepted");
                self.send_encrypted(&ack).await
            }
            RpcMessage::Request {
                header,
                grain_id,
                interface_type,
                method_id,
                arguments,
                ..
            } => self.handle_request(header.message_id, grain_id, interface_type, method_id, arguments).await,
            RpcMessage::AsyncEnumerableRequest {
                grain_id,
                interface_type,
                method_id,
                arguments,
                stream_id,
                ..
            } => {
                self.clone()
                    .handle_stream_request(grain_id, interface_type, method_id, arguments, stream_id)
                    .await
            }
            RpcMessage::AsyncEnumerableCancel { stream_id, .. } => {
                self.inner.lock().await.active_streams.remove(&stream_id);
                Ok(())
            }
            RpcMessage::Heartbeat { .. } => Ok(()),
            other => Err(RpcError::ProtocolViolation(format!(
                "unexpected message at server: {other:?}"
            ))),
        }
    }

    async fn handle_request(
        &self,
        request_id: Uuid,
        grain_id: GrainId,
        interface_type: String,
        method_id: i32,
        arguments: Vec<u8>,
    ) -> Result<(), RpcError> {
        if {
            let inner = self.inner.lock().await;
            inner.state != ConnectionState::Authenticated
        } {
            return Err(RpcError::ProtocolViolation(
                "request received before handshake completed".into(),
            ));
        }

        if self.inner.lock().await.revoked {
            return self
                .respond(
                    request_id,
                    Err(RpcError::Unauthorized("session revoked".into())),
                )
                .await;
        }

        // Authorization runs before method-existence is even consulted: an
        // unauthorized caller must see `Unauthorized`, never a
        // `MethodNotFound` that would leak whether the method exists.
        let policies = self.policies.policies_for(&interface_type, method_id);
        let identity = self.inner.lock().await.identity.clone();
        let decision = auth::authorize(
            &self.config,
            &AuthContext {
                identity: &identity,
                policies: &policies,
                is_server_to_server: identity.role == rpcnet_core::message::Role::Server,
                method: &method_id.to_string(),
                interface: &interface_type,
            },
        );
        if let rpcnet_core::auth::AuthDecision::Deny { reason } = decision {
            self.counters.record(&RpcError::Unauthorized(reason.clone()));
            return self.respond(request_id, Err(RpcError::Unauthorized(reason))).await;
        }

        if !self.invoker.can_invoke(&grain_id, &interface_type, method_id) {
            return self
                .respond(
                    request_id,
                    Err(RpcError::MethodNotFound {
                        interface: interface_type,
                        method_id,
                    }),
                )
                .await;
        }

        let result = self
            .invoker
            .invoke(&grain_id, &interface_type, method_id, &arguments)
            .await
            .map_err(|e| match e {
                InvokeError::NotFound => RpcError::MethodNotFound {
                    interface: interface_type.clone(),
                    method_id,
                },
                InvokeError::Application(msg) => RpcError::InvokerError(msg),
            });
        self.respond(request_id, result).await
    }

    async fn respond(&self, request_id: Uuid, result: Result<Vec<u8>, RpcError>) -> Result<(), RpcError> {
        let msg = match result {
            Ok(payload) => RpcMessage::Response {
                header: MessageHeader::new(now_millis()),
                request_id,
                success: true,
                payload,
                error_message: String::new(),
            },
            Err(e) => RpcMessage::Response {
                header: MessageHeader::new(now_millis()),
                request_id,
                success: false,
                payload: Vec::new(),
                error_message: e.to_string(),
            },
        };
        self.send_encrypted(&msg).await
    }

    async fn handle_stream_request(
        self: Arc<Self>,
        grain_id: GrainId,
        interface_type: String,
        method_id: i32,
        arguments: Vec<u8>,
        stream_id: Uuid,
    ) -> Result<(), RpcError> {
        if self.inner.lock().await.revoked {
            let msg = RpcMessage::AsyncEnumerableItem {
                header: MessageHeader::new(now_millis()),
                stream_id,
                sequence: 0,
                item_data: Vec::new(),
                is_complete: true,
                error_message: RpcError::Unauthorized("session revoked".into()).to_string(),
            };
            return self.send_encrypted(&msg).await;
        }
        self.inner.lock().await.active_streams.insert(stream_id);
        let (tx, mut rx) = mpsc::channel::<StreamItem>(32);
        let invoker = self.invoker.clone();
        tokio::spawn(async move {
            if let Err(e) = invoker
                .invoke_stream(&grain_id, &interface_type, method_id, &arguments, tx)
                .await
            {
                warn!(error = ?e, "stream invoker returned an error");
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut sequence: i64 = 0;
            while let Some(item) = rx.recv().await {
                if !this.inner.lock().await.active_streams.contains(&stream_id) {
                    return; // cancelled
                }
                let msg = match item {
                    StreamItem::Data(data) => {
                        let m = RpcMessage::AsyncEnumerableItem {
                            header: MessageHeader::new(now_millis()),
                            stream_id,
                            sequence,
                            item_data: data,
                            is_complete: false,
                            error_message: String::new(),
                        };
                        sequence += 1;
                        m
                    }
                    StreamItem::Complete => {
                        this.inner.lock().await.active_streams.remove(&stream_id);
                        RpcMessage::AsyncEnumerableItem {
                            header: MessageHeader::new(now_millis()),
                            stream_id,
                            sequence,
                            item_data: Vec::new(),
                            is_complete: true,
                            error_message: String::new(),
                        }
                    }
                    StreamItem::Error(e) => {
                        this.inner.lock().await.active_streams.remove(&stream_id);
                        RpcMessage::AsyncEnumerableItem {
                            header: MessageHeader::new(now_millis()),
                            stream_id,
                            sequence,
                            item_data: Vec::new(),
                            is_complete: true,
                            error_message: e,
                        }
                    }
                };
                let is_terminal = matches!(&msg, RpcMessage::AsyncEnumerableItem { is_complete, .. } if *is_complete);
                if this.send_encrypted(&msg).await.is_err() {
                    return;
                }
                if is_terminal {
                    return;
                }
            }
        });
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn close(&self) {
        self.inner.lock().await.state = ConnectionState::Closed;
        self.transport.close().await;
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
