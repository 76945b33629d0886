//! Core data model: grain identity, manifests, and the `RpcMessage` wire
//! union.
//!
//! Grain dispatch is treated as an opaque `(grain_type, key)` pair — the
//! virtual-actor directory and clustering machinery this would normally sit
//! under is out of scope; callers supply a pluggable [`crate::invoker::Invoker`]
//! instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable string identifying a remote interface.
pub type InterfaceType = String;

/// A stable string identifying the concrete grain implementation type bound
/// to an interface in a server's manifest.
pub type GrainType = String;

/// Identifies a remote object: an ordered, hashable `(grain_type, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrainId {
    pub grain_type: GrainType,
    pub key: Vec<u8>,
}

impl GrainId {
    pub fn new(grain_type: impl Into<GrainType>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            grain_type: grain_type.into(),
            key: key.into(),
        }
    }
}

/// Server-to-client manifest, sent once per session at handshake completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub interface_to_grain: HashMap<InterfaceType, GrainType>,
    pub grain_properties: HashMap<GrainType, HashMap<String, String>>,
    pub interface_properties: HashMap<InterfaceType, HashMap<String, String>>,
}

impl Manifest {
    pub fn bind(&mut self, interface: impl Into<InterfaceType>, grain_type: impl Into<GrainType>) {
        self.interface_to_grain.insert(interface.into(), grain_type.into());
    }

    pub fn grain_type_for(&self, interface: &str) -> Option<&GrainType> {
        self.interface_to_grain.get(interface)
    }
}

/// Common header fields present on every `RpcMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: Uuid,
    pub timestamp: i64,
}

impl MessageHeader {
    pub fn new(timestamp: i64) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp,
        }
    }
}

/// Protocol features a peer advertises at handshake time. Plain strings so
/// new features can be added without a wire-format change (see the
/// cipher-negotiation open question in the design notes — this is the seam
/// a future revision would extend).
pub type FeatureSet = Vec<String>;

/// The tagged union of messages exchanged over the wire (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcMessage {
    Handshake {
        header: MessageHeader,
        client_id: String,
        protocol_version: u32,
        features: FeatureSet,
    },
    HandshakeAck {
        header: MessageHeader,
        server_id: String,
        protocol_version: u32,
        manifest: Manifest,
        zone_id: Option<String>,
        zone_to_server_map: HashMap<String, String>,
    },
    Request {
        header: MessageHeader,
        grain_id: GrainId,
        interface_type: InterfaceType,
        method_id: i32,
        arguments: Vec<u8>,
        timeout_ms: i32,
        return_type_name: String,
        target_zone_id: Option<String>,
    },
    Response {
        header: MessageHeader,
        request_id: Uuid,
        success: bool,
        payload: Vec<u8>,
        error_message: String,
    },
    Heartbeat {
        header: MessageHeader,
        source_id: String,
    },
    AsyncEnumerableRequest {
        header: MessageHeader,
        grain_id: GrainId,
        interface_type: InterfaceType,
        method_id: i32,
        arguments: Vec<u8>,
        stream_id: Uuid,
    },
    AsyncEnumerableItem {
        header: MessageHeader,
        stream_id: Uuid,
        sequence: i64,
        item_data: Vec<u8>,
        is_complete: bool,
        error_message: String,
    },
    AsyncEnumerableCancel {
        header: MessageHeader,
        stream_id: Uuid,
    },
}

impl RpcMessage {
    /// The one-byte message-type tag (§4.1) that precedes the encoded
    /// payload on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            RpcMessage::Request { .. } => 1,
            RpcMessage::Response { .. } => 2,
            RpcMessage::Heartbeat { .. } => 3,
            RpcMessage::Handshake { .. } => 4,
            RpcMessage::HandshakeAck { .. } => 5,
            RpcMessage::AsyncEnumerableRequest { .. } => 6,
            RpcMessage::AsyncEnumerableItem { .. } => 7,
            RpcMessage::AsyncEnumerableCancel { .. } => 8,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            RpcMessage::Handshake { header, .. }
            | RpcMessage::HandshakeAck { header, .. }
            | RpcMessage::Request { header, .. }
            | RpcMessage::Response { header, .. }
            | RpcMessage::Heartbeat { header, .. }
            | RpcMessage::AsyncEnumerableRequest { header, .. }
            | RpcMessage::AsyncEnumerableItem { header, .. }
            | RpcMessage::AsyncEnumerableCancel { header, .. } => header,
        }
    }
}

/// Health of a server connection as tracked by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl Health {
    pub fn is_routable(&self) -> bool {
        matches!(self, Health::Healthy | Health::Degraded)
    }

    pub fn is_offline_or_unhealthy(&self) -> bool {
        matches!(self, Health::Offline | Health::Unhealthy)
    }
}

/// Describes a server the connection manager may route requests to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub server_id: String,
    pub endpoint: String,
    pub is_primary: bool,
    pub health: Health,
    pub metadata: HashMap<String, String>,
}

impl ServerDescriptor {
    pub fn new(server_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint: endpoint.into(),
            is_primary: false,
            health: Health::Healthy,
            metadata: HashMap::new(),
        }
    }
}

/// Caller role used by the authorization filter (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Anonymous,
    Guest,
    User,
    Admin,
    /// Orthogonal to the anonymous..admin ordering; only compared by rules
    /// that explicitly check for it (server-only, server-to-server calls).
    Server,
}

/// An authenticated (or anonymous) caller identity, created once a
/// session's PSK handshake completes with a successful identity lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: String::new(),
            user_name: String::new(),
            role: Role::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.role == Role::Anonymous
    }
}
